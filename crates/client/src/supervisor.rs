//! Supervision of the live progress transport for one job at a time.
//!
//! [`StreamSupervisor`] spawns a driver task per followed job. The driver
//! opens a push channel through a [`LiveChannelConnector`], merges every
//! valid message into the [`JobProgressStore`], and reconnects with
//! exponential backoff when the channel breaks. When push delivery is
//! unsupported it falls back to polling a [`SnapshotSource`].
//!
//! State machine (published through [`StreamSupervisor::subscribe`]):
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closed
//!                   ^   |          |
//!                   |   v          v
//!               ReconnectWait <----+
//!                   |
//!                   v (attempts exhausted)
//! Connecting -> Polling -> Closed
//! ```
//!
//! A driver only ever writes to the store through a [`TransportLease`], so
//! once it has been replaced or stopped none of its late messages land.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use firestick_core::backoff::{Backoff, ReconnectConfig};
use firestick_core::job::{JobHandle, ProgressEvent};
use firestick_core::store::{JobProgress, JobProgressStore, TransportLease};
use firestick_core::types::JobId;
use futures::StreamExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::IndexingApi;
use crate::channel::{LiveChannelConnector, MessageStream};
use crate::config::ClientConfig;
use crate::error::{ChannelError, ClientError};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Transport state of the supervised job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing is being supervised.
    Disconnected,
    /// Opening the push channel. `attempt` counts from 1 since the last
    /// successful connection or manual reconnect.
    Connecting { attempt: u32 },
    /// The push channel is open.
    Connected,
    /// Waiting `delay` before the next connection attempt.
    ReconnectWait { delay: Duration, attempt: u32 },
    /// Following the job through periodic snapshots.
    Polling,
    /// The job reached a terminal state. No transport remains.
    Closed,
}

impl StreamState {
    /// Short name for display.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::ReconnectWait { .. } => "reconnect-wait",
            Self::Polling => "polling",
            Self::Closed => "closed",
        }
    }
}

/// State of the supervisor as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    /// Job being supervised, if any.
    pub job_id: Option<JobId>,
    pub state: StreamState,
    /// Bumped on every start and stop; drivers of an older generation can
    /// no longer publish.
    generation: u64,
}

/// Source of full job snapshots, used while polling.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, job_id: &JobId) -> Result<JobHandle, ClientError>;
}

#[async_trait]
impl SnapshotSource for IndexingApi {
    /// Ask for the latest job and fall back to a lookup by id when a newer
    /// job has been started in the meantime.
    async fn fetch_snapshot(&self, job_id: &JobId) -> Result<JobHandle, ClientError> {
        let latest = self.latest_job().await?;
        if &latest.id == job_id {
            return Ok(latest);
        }
        self.job_by_id(job_id).await
    }
}

/// Timing parameters for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub reconnect: ReconnectConfig,
    /// Interval between snapshot fetches while polling.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            poll_interval: Duration::from_millis(1500),
        }
    }
}

impl From<&ClientConfig> for SupervisorConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            poll_interval: config.poll_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamSupervisor
// ---------------------------------------------------------------------------

/// Owns the single live transport of a session.
///
/// At most one job is supervised at a time; starting another job tears
/// the previous transport down first. Dropping the supervisor cancels
/// every driver it spawned.
pub struct StreamSupervisor {
    connector: Arc<dyn LiveChannelConnector>,
    snapshots: Arc<dyn SnapshotSource>,
    store: Arc<JobProgressStore>,
    config: SupervisorConfig,
    status: Arc<watch::Sender<StreamStatus>>,
    active: Mutex<Option<ActiveStream>>,
    /// Parent of every driver's token.
    cancel: CancellationToken,
}

/// Bookkeeping for the running driver.
struct ActiveStream {
    job_id: JobId,
    cancel: CancellationToken,
    reconnect: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StreamSupervisor {
    pub fn new(
        connector: Arc<dyn LiveChannelConnector>,
        snapshots: Arc<dyn SnapshotSource>,
        store: Arc<JobProgressStore>,
        config: SupervisorConfig,
    ) -> Self {
        let (status, _) = watch::channel(StreamStatus {
            job_id: None,
            state: StreamState::Disconnected,
            generation: 0,
        });
        Self {
            connector,
            snapshots,
            store,
            config,
            status: Arc::new(status),
            active: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    /// Current state.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Whether a live driver currently owns `job_id`'s record.
    pub fn is_following(&self, job_id: &JobId) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|current| &current.job_id == job_id && !current.task.is_finished())
    }

    /// Begin following `job_id`.
    ///
    /// Any transport for a different job is torn down first. Starting the
    /// job that is already being supervised is a no-op unless its driver
    /// has finished. Returns whether a new driver was spawned. Must be
    /// called within a Tokio runtime.
    pub fn start(&self, job_id: JobId) -> bool {
        let mut active = self.lock_active();

        if let Some(current) = active.as_ref() {
            if current.job_id == job_id && !current.task.is_finished() {
                tracing::debug!(job_id = %job_id, "Job already supervised");
                return false;
            }
        }
        if let Some(previous) = active.take() {
            tracing::info!(job_id = %previous.job_id, "Tearing down previous transport");
            previous.cancel.cancel();
        }

        let mut generation = 0;
        self.status.send_modify(|status| {
            status.generation += 1;
            generation = status.generation;
            status.job_id = Some(job_id.clone());
            status.state = StreamState::Disconnected;
        });

        let cancel = self.cancel.child_token();
        let reconnect = Arc::new(Notify::new());
        let driver = Driver {
            job_id: job_id.clone(),
            generation,
            connector: Arc::clone(&self.connector),
            snapshots: Arc::clone(&self.snapshots),
            lease: self.store.lease(),
            progress: self.store.subscribe(),
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
            reconnect: Arc::clone(&reconnect),
            backoff: Backoff::new(self.config.reconnect.clone()),
            poll_interval: self.config.poll_interval,
        };
        let task = tokio::spawn(driver.run());

        *active = Some(ActiveStream {
            job_id,
            cancel,
            reconnect,
            task,
        });
        true
    }

    /// Force an immediate connection attempt and reset the backoff.
    ///
    /// Ignored once the job is closed or when nothing is supervised.
    pub fn reconnect(&self) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(current) if !current.task.is_finished() => {
                tracing::info!(job_id = %current.job_id, "Manual reconnect requested");
                current.reconnect.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Tear down the transport and any pending reconnect. Idempotent.
    pub fn stop(&self) {
        if let Some(previous) = self.lock_active().take() {
            tracing::info!(job_id = %previous.job_id, "Stopping live progress supervision");
            previous.cancel.cancel();
        }
        self.store.revoke_leases();
        self.status.send_if_modified(|status| {
            status.generation += 1;
            let changed = status.job_id.is_some() || status.state != StreamState::Disconnected;
            status.job_id = None;
            status.state = StreamState::Disconnected;
            changed
        });
    }

    // ---- private helpers ----

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Phase {
    Connect,
    Wait(Duration),
    Poll,
}

enum Exit {
    /// The job is terminal.
    Closed,
    /// Torn down, superseded, or the lease was revoked.
    Cancelled,
}

/// Per-job task driving the state machine.
struct Driver {
    job_id: JobId,
    generation: u64,
    connector: Arc<dyn LiveChannelConnector>,
    snapshots: Arc<dyn SnapshotSource>,
    lease: TransportLease,
    progress: watch::Receiver<JobProgress>,
    status: Arc<watch::Sender<StreamStatus>>,
    cancel: CancellationToken,
    reconnect: Arc<Notify>,
    backoff: Backoff,
    poll_interval: Duration,
}

impl Driver {
    async fn run(mut self) {
        tracing::info!(job_id = %self.job_id, "Supervising live progress");

        let exit = self.drive().await;
        self.lease.release();

        match exit {
            Exit::Closed => {
                self.set_state(StreamState::Closed);
                tracing::info!(job_id = %self.job_id, "Job finished, live progress closed");
            }
            Exit::Cancelled => {
                tracing::debug!(job_id = %self.job_id, "Live progress supervision cancelled");
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        if self.progress.borrow_and_update().is_terminal_for(&self.job_id) {
            return Exit::Closed;
        }

        let mut phase = Phase::Connect;
        loop {
            let next = match phase {
                Phase::Connect => self.connect().await,
                Phase::Wait(delay) => self.wait(delay).await,
                Phase::Poll => self.poll().await,
            };
            match next {
                Ok(next) => phase = next,
                Err(exit) => return exit,
            }
        }
    }

    async fn connect(&mut self) -> Result<Phase, Exit> {
        let attempt = self.backoff.failures() + 1;
        self.set_state(StreamState::Connecting { attempt });

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
            _ = terminal_reached(&mut self.progress, &self.job_id) => return Err(Exit::Closed),
            _ = self.reconnect.notified() => {
                self.backoff.reset();
                return Ok(Phase::Connect);
            }
            result = self.connector.open(&self.job_id) => result,
        };

        match opened {
            Ok(messages) => self.stream(messages).await,
            Err(ChannelError::Unsupported(reason)) => {
                tracing::info!(
                    job_id = %self.job_id,
                    reason = %reason,
                    "Live channel unsupported, falling back to polling",
                );
                Ok(Phase::Poll)
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    attempt,
                    error = %e,
                    "Live channel connect failed",
                );
                Ok(self.after_failure())
            }
        }
    }

    async fn stream(&mut self, mut messages: MessageStream) -> Result<Phase, Exit> {
        self.backoff.reset();
        self.set_state(StreamState::Connected);
        tracing::info!(job_id = %self.job_id, "Live channel connected");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                _ = terminal_reached(&mut self.progress, &self.job_id) => return Err(Exit::Closed),
                _ = self.reconnect.notified() => None,
                message = messages.next() => Some(message),
            };

            match next {
                None => {
                    self.backoff.reset();
                    return Ok(Phase::Connect);
                }
                Some(Some(Ok(text))) => self.handle_message(&text)?,
                Some(Some(Err(e))) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Live channel failed");
                    return Ok(self.after_failure());
                }
                Some(None) => {
                    tracing::warn!(job_id = %self.job_id, "Live channel closed by server");
                    return Ok(self.after_failure());
                }
            }
        }
    }

    /// Merge one payload. Invalid payloads and payloads for other jobs are
    /// dropped without touching the channel.
    fn handle_message(&self, text: &str) -> Result<(), Exit> {
        let event = match ProgressEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(job_id = %self.job_id, error = %e, "Dropping malformed progress message");
                return Ok(());
            }
        };
        if let Some(other) = event.job_id.as_ref().filter(|id| *id != &self.job_id) {
            tracing::debug!(job_id = %self.job_id, other = %other, "Dropping progress message for another job");
            return Ok(());
        }

        match self.lease.apply_partial(&self.job_id, &event) {
            None => Err(Exit::Cancelled),
            Some(job) if job.is_terminal() => Err(Exit::Closed),
            Some(_) => Ok(()),
        }
    }

    fn after_failure(&mut self) -> Phase {
        if self.backoff.exhausted() {
            tracing::warn!(
                job_id = %self.job_id,
                failures = self.backoff.failures(),
                "Giving up on live channel, polling instead",
            );
            return Phase::Poll;
        }
        Phase::Wait(self.backoff.next_delay())
    }

    async fn wait(&mut self, delay: Duration) -> Result<Phase, Exit> {
        let attempt = self.backoff.failures();
        self.set_state(StreamState::ReconnectWait { delay, attempt });
        tracing::info!(
            job_id = %self.job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting live channel after delay",
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Exit::Cancelled),
            _ = terminal_reached(&mut self.progress, &self.job_id) => Err(Exit::Closed),
            _ = self.reconnect.notified() => {
                self.backoff.reset();
                Ok(Phase::Connect)
            }
            _ = tokio::time::sleep(delay) => Ok(Phase::Connect),
        }
    }

    async fn poll(&mut self) -> Result<Phase, Exit> {
        self.set_state(StreamState::Polling);
        tracing::info!(
            job_id = %self.job_id,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Following job by polling",
        );

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                _ = terminal_reached(&mut self.progress, &self.job_id) => return Err(Exit::Closed),
                _ = self.reconnect.notified() => {
                    self.backoff.reset();
                    return Ok(Phase::Connect);
                }
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                result = self.snapshots.fetch_snapshot(&self.job_id) => result,
            };

            match fetched {
                Ok(snapshot) if snapshot.id != self.job_id => {
                    tracing::debug!(job_id = %self.job_id, other = %snapshot.id, "Ignoring snapshot of another job");
                }
                Ok(snapshot) => {
                    let terminal = snapshot.is_terminal();
                    if !self.lease.apply_full(snapshot) {
                        return Err(Exit::Cancelled);
                    }
                    if terminal {
                        return Err(Exit::Closed);
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Progress poll failed");
                }
            }
        }
    }

    /// Publish `state` unless a newer start or stop has taken over.
    fn set_state(&self, state: StreamState) {
        let generation = self.generation;
        self.status.send_if_modified(|status| {
            if status.generation != generation || status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }
}

/// Resolve once the store holds a terminal record for `job_id`.
async fn terminal_reached(progress: &mut watch::Receiver<JobProgress>, job_id: &JobId) {
    loop {
        if progress.borrow_and_update().is_terminal_for(job_id) {
            return;
        }
        if progress.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
