//! Client-side synchronisation core for the code indexing service.
//!
//! Deduplicates concurrent REST calls, keeps one live progress transport
//! per followed job (server push with reconnect backoff, or polling when
//! push is unavailable), and merges progress into an observable store.

pub mod api;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod sse;
pub mod supervisor;

pub use api::IndexingApi;
pub use config::ClientConfig;
pub use coordinator::{DedupePolicy, RequestCoordinator, RequestKey};
pub use error::{ChannelError, ClientError, ConfigError, NetworkFailure};
pub use session::Session;
pub use supervisor::{StreamState, StreamStatus, StreamSupervisor};
