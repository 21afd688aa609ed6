//! Live progress channel: the server-push transport behind the supervisor.
//!
//! [`LiveChannelConnector`] is the seam between
//! [`crate::supervisor::StreamSupervisor`] and the wire. The production
//! implementation, [`SseConnector`], subscribes to the backend's
//! server-sent-events endpoint; tests substitute scripted connectors.

use async_trait::async_trait;
use firestick_core::types::JobId;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{header, StatusCode};

use crate::api::REQUEST_ID_HEADER;
use crate::config::ClientConfig;
use crate::error::ChannelError;
use crate::sse::SseDecoder;

/// Raw text payloads of one open channel, in arrival order.
///
/// The stream ends when the server closes the channel.
pub type MessageStream = BoxStream<'static, Result<String, ChannelError>>;

/// Opens push channels for a job.
#[async_trait]
pub trait LiveChannelConnector: Send + Sync {
    /// Open a channel delivering progress messages for `job_id`.
    ///
    /// Returns [`ChannelError::Unsupported`] when push delivery is not
    /// available at all, so the caller can fall back to polling.
    async fn open(&self, job_id: &JobId) -> Result<MessageStream, ChannelError>;
}

/// Server-sent-events connector for `GET /api/indexing/stream`.
pub struct SseConnector {
    client: reqwest::Client,
    base_url: String,
    app: Option<String>,
    enabled: bool,
}

impl SseConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Create a connector reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            app: config.app.clone(),
            enabled: config.push_enabled,
        }
    }
}

#[async_trait]
impl LiveChannelConnector for SseConnector {
    async fn open(&self, job_id: &JobId) -> Result<MessageStream, ChannelError> {
        if !self.enabled {
            return Err(ChannelError::Unsupported("push disabled by configuration".into()));
        }

        let mut query = vec![("jobId", job_id.to_string())];
        if let Some(app) = &self.app {
            query.push(("app", app.clone()));
        }
        let url = format!("{}/api/indexing/stream", self.base_url);
        tracing::debug!(job_id = %job_id, url = %url, "Opening live channel");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header(header::ACCEPT, "text/event-stream")
            .header(REQUEST_ID_HEADER, uuid::Uuid::now_v7().to_string())
            .send()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::NOT_FOUND
                | StatusCode::METHOD_NOT_ALLOWED
                | StatusCode::NOT_ACCEPTABLE
                | StatusCode::NOT_IMPLEMENTED
        ) {
            return Err(ChannelError::Unsupported(format!("stream endpoint answered {status}")));
        }
        if !status.is_success() {
            return Err(ChannelError::Connect(format!("stream endpoint answered {status}")));
        }

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        if !is_event_stream {
            return Err(ChannelError::Unsupported(
                "stream endpoint did not return text/event-stream".into(),
            ));
        }

        Ok(decode_events(response.bytes_stream()).boxed())
    }
}

/// Turn a body byte stream into event payloads.
fn decode_events<S, B, E>(body: S) -> impl Stream<Item = Result<String, ChannelError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = SseDecoder::new();
    body.map(move |chunk| match chunk {
        Ok(bytes) => decoder.push(bytes.as_ref()).into_iter().map(Ok).collect::<Vec<_>>(),
        Err(e) => vec![Err(ChannelError::Stream(e.to_string()))],
    })
    .flat_map(stream::iter)
}
