//! Domain types and pure logic for following Firestick indexing jobs.
//!
//! Nothing in this crate performs network I/O. The client crate feeds it
//! snapshots and progress events and renders from [`store::JobProgressStore`].

pub mod backoff;
pub mod error;
pub mod job;
pub mod prefs;
pub mod store;
pub mod types;
