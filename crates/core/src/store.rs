//! Authoritative client-side record of the job being followed.
//!
//! [`JobProgressStore`] publishes immutable [`JobProgress`] snapshots
//! through a [`tokio::sync::watch`] channel. Every merge runs inside the
//! channel's write lock, so a reader sees either the record before a merge
//! or the record after it, never a mixture.
//!
//! Live transports do not write to the store directly. They hold a
//! [`TransportLease`]; taking a new lease revokes the previous one, so once
//! a transport has been replaced none of its late messages can land.

use std::sync::Arc;

use tokio::sync::watch;

use crate::job::{JobHandle, ProgressEvent};
use crate::types::{JobId, Timestamp};

/// Default number of entries kept in the recent-jobs history.
pub const DEFAULT_RECENT_JOBS_LIMIT: usize = 10;

/// Snapshot of everything the store knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobProgress {
    /// The job currently being displayed, if any.
    pub job: Option<JobHandle>,
    /// When the last partial update was merged. Observers use this as a
    /// liveness signal.
    pub last_update_at: Option<Timestamp>,
    /// Recent jobs, most recent first.
    pub recent: Vec<JobHandle>,
    /// Generation of the only lease currently allowed to write.
    writer: u64,
}

impl JobProgress {
    /// Whether the current record belongs to `job_id` and is terminal.
    pub fn is_terminal_for(&self, job_id: &JobId) -> bool {
        self.job
            .as_ref()
            .is_some_and(|job| &job.id == job_id && job.is_terminal())
    }
}

/// Observable store for the followed job and the recent-jobs history.
pub struct JobProgressStore {
    tx: Arc<watch::Sender<JobProgress>>,
    recent_limit: usize,
}

impl JobProgressStore {
    /// Create an empty store keeping at most `recent_limit` recent jobs.
    pub fn new(recent_limit: usize) -> Self {
        let (tx, _) = watch::channel(JobProgress::default());
        Self {
            tx: Arc::new(tx),
            recent_limit,
        }
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.tx.subscribe()
    }

    /// Clone the current snapshot.
    pub fn snapshot(&self) -> JobProgress {
        self.tx.borrow().clone()
    }

    /// Clone the current job record.
    pub fn current(&self) -> Option<JobHandle> {
        self.tx.borrow().job.clone()
    }

    /// Replace the entire record for the job.
    pub fn apply_full(&self, snapshot: JobHandle) {
        self.tx.send_modify(|state| replace_job(state, snapshot));
    }

    /// Merge a partial update into the record for `job_id`.
    ///
    /// If the store holds a different job (or none), the event is applied
    /// on top of a fresh record for `job_id`. Returns the merged record.
    pub fn apply_partial(&self, job_id: &JobId, event: &ProgressEvent) -> JobHandle {
        let mut merged = None;
        self.tx.send_modify(|state| merged = Some(merge_event(state, job_id, event)));
        merged.unwrap_or_else(|| JobHandle::new(job_id.clone()))
    }

    /// Replace the recent-jobs history, keeping at most the configured
    /// number of entries.
    pub fn record_recent(&self, mut list: Vec<JobHandle>) {
        list.truncate(self.recent_limit);
        self.tx.send_modify(|state| state.recent = list);
    }

    /// Take exclusive write access for a live transport, revoking whichever
    /// lease was issued before.
    pub fn lease(&self) -> TransportLease {
        let mut generation = 0;
        self.tx.send_if_modified(|state| {
            state.writer += 1;
            generation = state.writer;
            false
        });
        TransportLease {
            tx: Arc::clone(&self.tx),
            generation,
        }
    }

    /// Revoke every outstanding lease.
    pub fn revoke_leases(&self) {
        self.tx.send_if_modified(|state| {
            state.writer += 1;
            false
        });
    }
}

impl Default for JobProgressStore {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_JOBS_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// TransportLease
// ---------------------------------------------------------------------------

/// Write access held by the single active live transport.
///
/// All writes are rejected once a newer lease has been taken or the leases
/// have been revoked. The check and the write happen under the same lock.
pub struct TransportLease {
    tx: Arc<watch::Sender<JobProgress>>,
    generation: u64,
}

impl TransportLease {
    /// Whether this lease still grants write access.
    pub fn is_current(&self) -> bool {
        self.tx.borrow().writer == self.generation
    }

    /// Replace the record, unless the lease was revoked.
    pub fn apply_full(&self, snapshot: JobHandle) -> bool {
        let generation = self.generation;
        self.tx.send_if_modified(|state| {
            if state.writer != generation {
                return false;
            }
            replace_job(state, snapshot);
            true
        })
    }

    /// Merge a partial update, unless the lease was revoked. Returns the
    /// merged record on success.
    pub fn apply_partial(&self, job_id: &JobId, event: &ProgressEvent) -> Option<JobHandle> {
        let generation = self.generation;
        let mut merged = None;
        self.tx.send_if_modified(|state| {
            if state.writer != generation {
                return false;
            }
            merged = Some(merge_event(state, job_id, event));
            true
        });
        merged
    }

    /// Give up write access. Has no effect if a newer lease exists.
    pub fn release(&self) {
        let generation = self.generation;
        self.tx.send_if_modified(|state| {
            if state.writer == generation {
                state.writer += 1;
            }
            false
        });
    }
}

// ---- private helpers ----

fn replace_job(state: &mut JobProgress, snapshot: JobHandle) {
    state.job = Some(snapshot);
}

fn merge_event(state: &mut JobProgress, job_id: &JobId, event: &ProgressEvent) -> JobHandle {
    if !matches!(&state.job, Some(job) if &job.id == job_id) {
        state.job = None;
    }
    let job = state
        .job
        .get_or_insert_with(|| JobHandle::new(job_id.clone()));
    job.merge(event);
    state.last_update_at = Some(chrono::Utc::now());
    job.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, STAT_FILES_PARSED};

    fn event(json: &str) -> ProgressEvent {
        ProgressEvent::parse(json).unwrap()
    }

    #[test]
    fn partial_on_empty_store_creates_record() {
        let store = JobProgressStore::default();
        let id = JobId::from(42);

        let merged = store.apply_partial(&id, &event(r#"{"percent":10,"status":"RUNNING"}"#));

        assert_eq!(merged.id, id);
        assert_eq!(merged.progress_percent, 10);
        assert_eq!(merged.status, JobStatus::Running);
        assert_eq!(store.current(), Some(merged));
        assert!(store.snapshot().last_update_at.is_some());
    }

    #[test]
    fn partial_keeps_fields_from_full_snapshot() {
        let store = JobProgressStore::default();
        let mut job = JobHandle::new(JobId::from(1));
        job.started_at = Some(chrono::Utc::now());
        job.stats.insert("filesDiscovered".into(), 30);
        store.apply_full(job.clone());

        store.apply_partial(&job.id, &event(r#"{"filesParsed":3}"#));

        let current = store.current().unwrap();
        assert_eq!(current.started_at, job.started_at);
        assert_eq!(current.stat("filesDiscovered"), Some(30));
        assert_eq!(current.stat(STAT_FILES_PARSED), Some(3));
    }

    #[test]
    fn partial_for_other_job_starts_fresh() {
        let store = JobProgressStore::default();
        let mut old = JobHandle::new(JobId::from(1));
        old.stats.insert("filesDiscovered".into(), 30);
        store.apply_full(old);

        let merged = store.apply_partial(&JobId::from(2), &event(r#"{"percent":5}"#));

        assert_eq!(merged.id, JobId::from(2));
        assert!(merged.stats.is_empty());
    }

    #[test]
    fn full_snapshot_does_not_touch_liveness() {
        let store = JobProgressStore::default();
        store.apply_full(JobHandle::new(JobId::from(1)));
        assert!(store.snapshot().last_update_at.is_none());
    }

    #[test]
    fn recent_history_is_capped() {
        let store = JobProgressStore::new(3);
        let list = (1..=5).map(|i| JobHandle::new(JobId::from(i))).collect();
        store.record_recent(list);

        let recent = store.snapshot().recent;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, JobId::from(1));
    }

    #[test]
    fn new_lease_revokes_previous() {
        let store = JobProgressStore::default();
        let id = JobId::from(1);
        let first = store.lease();
        let second = store.lease();

        assert!(!first.is_current());
        assert!(first.apply_partial(&id, &event(r#"{"percent":50}"#)).is_none());
        assert!(store.current().is_none());

        assert!(second.apply_partial(&id, &event(r#"{"percent":20}"#)).is_some());
        assert_eq!(store.current().unwrap().progress_percent, 20);
    }

    #[test]
    fn revoked_lease_cannot_write() {
        let store = JobProgressStore::default();
        let lease = store.lease();
        store.revoke_leases();

        assert!(!lease.apply_full(JobHandle::new(JobId::from(1))));
        assert!(store.current().is_none());
    }

    #[test]
    fn release_of_stale_lease_keeps_newer_one() {
        let store = JobProgressStore::default();
        let old = store.lease();
        let new = store.lease();

        old.release();
        assert!(new.is_current());

        new.release();
        assert!(!new.is_current());
    }

    #[tokio::test]
    async fn subscribers_see_merges() {
        let store = JobProgressStore::default();
        let mut rx = store.subscribe();
        let id = JobId::from(9);

        store.apply_partial(&id, &event(r#"{"percent":70}"#));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().job.as_ref().unwrap().progress_percent, 70);
    }

    #[test]
    fn terminal_check_is_per_job() {
        let store = JobProgressStore::default();
        store.apply_partial(&JobId::from(1), &event(r#"{"percent":100}"#));

        let snapshot = store.snapshot();
        assert!(snapshot.is_terminal_for(&JobId::from(1)));
        assert!(!snapshot.is_terminal_for(&JobId::from(2)));
    }
}
