//! REST API client for the indexing backend.
//!
//! Wraps the job, file and probe endpoints using [`reqwest`]. Idempotent
//! lookups and starts are routed through the session's
//! [`RequestCoordinator`]; probes bypass it and carry their own deadline.

use std::time::Duration;

use firestick_core::job::{JobHandle, JobStatus};
use firestick_core::prefs::JobParams;
use firestick_core::types::JobId;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::coordinator::{DedupePolicy, RequestCoordinator, RequestKey};
use crate::error::ClientError;

/// Header carrying a fresh correlation id on every request.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Bounds applied to the `limit` of a recent-jobs lookup.
pub const RECENT_JOBS_LIMIT_RANGE: std::ops::RangeInclusive<usize> = 1..=100;

/// HTTP client for one indexing backend.
pub struct IndexingApi {
    client: reqwest::Client,
    base_url: String,
    app: Option<String>,
    probe_timeout: Duration,
    coordinator: RequestCoordinator,
}

/// Response of the start endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Id of the job that was started. Some backends omit it.
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

/// Content of a single indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// Result of the health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    /// Raw status string reported by the backend.
    pub status: String,
    pub healthy: bool,
}

/// Result of the embedding-mode probe.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingInfo {
    /// Embedding mode, upper-cased (e.g. `ONNX`).
    pub mode: String,
    /// The full payload, for fields this client does not interpret.
    pub details: serde_json::Value,
}

impl IndexingApi {
    /// Create a new API client from configuration.
    pub fn new(config: &ClientConfig, coordinator: RequestCoordinator) -> Self {
        Self::with_client(reqwest::Client::new(), config, coordinator)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        config: &ClientConfig,
        coordinator: RequestCoordinator,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            app: config.app.clone(),
            probe_timeout: config.probe_timeout,
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    /// Start an indexing run.
    ///
    /// Sends `GET /api/indexing/run`. A start issued while another one is
    /// still pending supersedes it, whatever its parameters.
    pub async fn start_job(&self, params: &JobParams) -> Result<StartResponse, ClientError> {
        let mut query = Vec::new();
        if let Some(root) = &params.root {
            query.push(("root", root.clone()));
        }
        if !params.exclude_dirs.is_empty() {
            query.push(("excludeDirs", params.exclude_dirs.join(",")));
        }
        if !params.exclude_globs.is_empty() {
            query.push(("excludeGlobs", params.exclude_globs.join(",")));
        }
        let url = self.url("/api/indexing/run", query)?;
        let key = RequestKey::new("GET", "/api/indexing/run");

        self.coordinated(key, url, DedupePolicy::CancelPrevious).await
    }

    /// Fetch the most recent job. Sends `GET /api/indexing/jobs/latest`.
    pub async fn latest_job(&self) -> Result<JobHandle, ClientError> {
        let url = self.url("/api/indexing/jobs/latest", Vec::new())?;
        self.shared_get(url).await
    }

    /// Fetch one job. Sends `GET /api/indexing/jobs/{id}`.
    pub async fn job_by_id(&self, id: &JobId) -> Result<JobHandle, ClientError> {
        let url = self.url(&format!("/api/indexing/jobs/{id}"), Vec::new())?;
        self.shared_get(url).await
    }

    /// Fetch recent jobs, most recent first.
    ///
    /// `limit` is clamped to [`RECENT_JOBS_LIMIT_RANGE`].
    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobHandle>, ClientError> {
        let limit = limit.clamp(*RECENT_JOBS_LIMIT_RANGE.start(), *RECENT_JOBS_LIMIT_RANGE.end());
        let url = self.url("/api/indexing/jobs", vec![("limit", limit.to_string())])?;
        self.shared_get(url).await
    }

    /// Fetch the content of an indexed file. Sends `GET /api/code/file`.
    ///
    /// A newer lookup of the same path cancels one still in flight.
    pub async fn file_content(&self, path: &str) -> Result<FileContent, ClientError> {
        let url = self.url("/api/code/file", vec![("path", path.to_string())])?;
        let key = RequestKey::new("GET", &target(&url));
        self.coordinated(key, url, DedupePolicy::CancelPrevious).await
    }

    /// Probe backend health. Sends `GET /api/health` with the probe deadline.
    ///
    /// `OK` and `UP` (any case) count as healthy.
    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        let url = self.url("/api/health", Vec::new())?;
        let payload = self.probe(url).await?;
        let status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Parse("health payload has no status".into()))?
            .to_string();
        let healthy = matches!(status.to_ascii_uppercase().as_str(), "OK" | "UP");

        Ok(HealthStatus { status, healthy })
    }

    /// Probe the embedding mode. Sends `GET /api/embedding/info` with the
    /// probe deadline.
    pub async fn embedding_info(&self) -> Result<EmbeddingInfo, ClientError> {
        let url = self.url("/api/embedding/info", Vec::new())?;
        let details = self.probe(url).await?;
        let mode = details
            .get("mode")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Parse("embedding info has no mode".into()))?
            .to_ascii_uppercase();

        Ok(EmbeddingInfo { mode, details })
    }

    // ---- private helpers ----

    /// Build an absolute URL, appending `app` when configured.
    fn url(&self, path: &str, mut query: Vec<(&str, String)>) -> Result<Url, ClientError> {
        if let Some(app) = &self.app {
            query.push(("app", app.clone()));
        }
        let base = format!("{}{}", self.base_url, path);
        let url = if query.is_empty() {
            Url::parse(&base)
        } else {
            Url::parse_with_params(&base, &query)
        };
        url.map_err(|e| ClientError::Parse(format!("invalid request URL {base}: {e}")))
    }

    /// `GET` deduplicated with [`DedupePolicy::Share`], keyed by path and query.
    async fn shared_get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let key = RequestKey::new("GET", &target(&url));
        self.coordinated(key, url, DedupePolicy::Share).await
    }

    async fn coordinated<T: DeserializeOwned>(
        &self,
        key: RequestKey,
        url: Url,
        policy: DedupePolicy,
    ) -> Result<T, ClientError> {
        let client = self.client.clone();
        let value = self
            .coordinator
            .submit(key, policy, move || get_json(client, url, None))
            .await?;

        serde_json::from_value(value.as_ref().clone()).map_err(|e| ClientError::Parse(e.to_string()))
    }

    async fn probe(&self, url: Url) -> Result<serde_json::Value, ClientError> {
        get_json(self.client.clone(), url, Some(self.probe_timeout)).await
    }
}

/// Issue one `GET` and decode its JSON body.
async fn get_json(
    client: reqwest::Client,
    url: Url,
    deadline: Option<Duration>,
) -> Result<serde_json::Value, ClientError> {
    let request_id = uuid::Uuid::now_v7().to_string();
    tracing::debug!(request_id = %request_id, url = %url, "GET");

    let mut request = client.get(url).header(REQUEST_ID_HEADER, &request_id);
    if let Some(deadline) = deadline {
        request = request.timeout(deadline);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(e, deadline))?;
    let response = ensure_success(response).await?;
    let value = response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ClientError::from_reqwest(e, deadline))?;
    Ok(value)
}

/// Ensure the response has a success status code. Returns the response
/// unchanged on success, or a [`ClientError::HttpStatus`] containing the
/// status and body text on failure.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(ClientError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Path plus query, used as the dedupe target.
fn target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(app: Option<&str>) -> IndexingApi {
        let config = ClientConfig {
            base_url: "http://indexer:8080".into(),
            app: app.map(str::to_string),
            ..Default::default()
        };
        IndexingApi::new(&config, RequestCoordinator::new())
    }

    #[test]
    fn url_encodes_query_and_app() {
        let url = api(Some("billing"))
            .url("/api/code/file", vec![("path", "src/a b.rs".into())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://indexer:8080/api/code/file?path=src%2Fa+b.rs&app=billing"
        );
    }

    #[test]
    fn url_without_query_has_no_question_mark() {
        let url = api(None).url("/api/indexing/jobs/latest", Vec::new()).unwrap();
        assert_eq!(url.as_str(), "http://indexer:8080/api/indexing/jobs/latest");
        assert_eq!(target(&url), "/api/indexing/jobs/latest");
    }

    #[test]
    fn target_includes_query() {
        let url = api(None)
            .url("/api/indexing/jobs", vec![("limit", "10".into())])
            .unwrap();
        assert_eq!(target(&url), "/api/indexing/jobs?limit=10");
    }

    #[test]
    fn start_response_tolerates_missing_fields() {
        let response: StartResponse = serde_json::from_str("{}").unwrap();
        assert!(response.job_id.is_none());

        let response: StartResponse = serde_json::from_str(r#"{"jobId": 17}"#).unwrap();
        assert_eq!(response.job_id, Some(JobId::from(17)));
    }
}
