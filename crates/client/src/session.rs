//! One client session: API, store, supervisor and preferences wired
//! together.
//!
//! [`Session`] is the entry point a front end drives. It owns the
//! session-scoped [`RequestCoordinator`], the [`JobProgressStore`] every
//! view observes, and the [`StreamSupervisor`] that keeps the followed job
//! live.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use firestick_core::job::JobHandle;
use firestick_core::prefs::{JobParams, Preferences};
use firestick_core::store::JobProgressStore;
use firestick_core::types::JobId;

use crate::api::IndexingApi;
use crate::channel::{LiveChannelConnector, SseConnector};
use crate::config::ClientConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::ClientError;
use crate::supervisor::{SnapshotSource, StreamSupervisor, SupervisorConfig};

pub struct Session {
    config: ClientConfig,
    api: Arc<IndexingApi>,
    store: Arc<JobProgressStore>,
    supervisor: StreamSupervisor,
    prefs: Mutex<Preferences>,
}

impl Session {
    /// Build a session talking to the configured backend.
    ///
    /// Preferences that cannot be loaded are logged and replaced by
    /// in-memory ones.
    pub fn new(config: ClientConfig) -> Self {
        let client = reqwest::Client::new();
        let api = Arc::new(IndexingApi::with_client(
            client.clone(),
            &config,
            RequestCoordinator::new(),
        ));
        let connector = Arc::new(SseConnector::with_client(client, &config));

        let prefs = match &config.prefs_path {
            Some(path) => Preferences::load(path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load preferences, using defaults");
                Preferences::in_memory()
            }),
            None => Preferences::in_memory(),
        };

        let snapshots: Arc<dyn SnapshotSource> = api.clone();
        Self::with_parts(config, api, connector, snapshots, prefs)
    }

    /// Build a session from explicit parts.
    pub fn with_parts(
        config: ClientConfig,
        api: Arc<IndexingApi>,
        connector: Arc<dyn LiveChannelConnector>,
        snapshots: Arc<dyn SnapshotSource>,
        prefs: Preferences,
    ) -> Self {
        let store = Arc::new(JobProgressStore::new(config.recent_jobs_limit));
        let supervisor = StreamSupervisor::new(
            connector,
            snapshots,
            Arc::clone(&store),
            SupervisorConfig::from(&config),
        );
        Self {
            config,
            api,
            store,
            supervisor,
            prefs: Mutex::new(prefs),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &IndexingApi {
        &self.api
    }

    pub fn store(&self) -> &JobProgressStore {
        &self.store
    }

    pub fn supervisor(&self) -> &StreamSupervisor {
        &self.supervisor
    }

    /// Parameters of the last indexing run, for pre-filling a form.
    pub fn last_job_params(&self) -> JobParams {
        self.lock_prefs().job_params()
    }

    /// Start an indexing run and follow it.
    ///
    /// When the backend does not report the new job's id, the latest job
    /// is looked up instead. The parameters are remembered on success.
    pub async fn start_indexing(&self, params: JobParams) -> Result<JobId, ClientError> {
        let response = self.api.start_job(&params).await?;
        self.remember_params(&params);

        let job = match response.job_id {
            Some(id) => {
                let mut job = JobHandle::new(id);
                if let Some(status) = response.status {
                    job.status = status;
                }
                job
            }
            None => {
                tracing::debug!("Start response carried no job id, using latest job");
                self.api.latest_job().await?
            }
        };

        let job_id = job.id.clone();
        tracing::info!(job_id = %job_id, "Indexing job started");
        self.open_job(job);
        Ok(job_id)
    }

    /// Show `job` and follow it until it is terminal.
    ///
    /// A job that is already being followed keeps its live record.
    pub fn open_job(&self, job: JobHandle) {
        if self.supervisor.is_following(&job.id) {
            tracing::debug!(job_id = %job.id, "Job already live, keeping streamed record");
            return;
        }
        let job_id = job.id.clone();
        self.store.apply_full(job);
        self.supervisor.start(job_id);
    }

    /// Fetch the latest job into the store, following it when still
    /// running.
    ///
    /// While that job is streaming, the live record wins over the fetched
    /// snapshot.
    pub async fn refresh_latest(&self) -> Result<JobHandle, ClientError> {
        let latest = self.api.latest_job().await?;
        if self.supervisor.is_following(&latest.id) {
            tracing::debug!(job_id = %latest.id, "Latest job already live, keeping streamed record");
            return Ok(latest);
        }
        self.store.apply_full(latest.clone());
        if !latest.is_terminal() {
            self.supervisor.start(latest.id.clone());
        }
        Ok(latest)
    }

    /// Fetch the recent-jobs history into the store.
    pub async fn refresh_recent(&self) -> Result<Vec<JobHandle>, ClientError> {
        let recent = self.api.recent_jobs(self.config.recent_jobs_limit).await?;
        self.store.record_recent(recent.clone());
        Ok(recent)
    }

    /// Force the live channel to reconnect now.
    pub fn reconnect(&self) -> bool {
        self.supervisor.reconnect()
    }

    /// Stop following the current job.
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    /// Remember a search query. Returns the updated recent-query list.
    pub fn record_query(&self, query: &str) -> Vec<String> {
        let mut prefs = self.lock_prefs();
        let queries = prefs.push_recent_query(query);
        if let Err(e) = prefs.save() {
            tracing::warn!(error = %e, "Failed to save preferences");
        }
        queries
    }

    /// Recent search queries, most recent first.
    pub fn recent_queries(&self) -> Vec<String> {
        self.lock_prefs().recent_queries()
    }

    // ---- private helpers ----

    fn remember_params(&self, params: &JobParams) {
        let mut prefs = self.lock_prefs();
        prefs.set_job_params(params);
        if let Err(e) = prefs.save() {
            tracing::warn!(error = %e, "Failed to save preferences");
        }
    }

    fn lock_prefs(&self) -> MutexGuard<'_, Preferences> {
        self.prefs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
