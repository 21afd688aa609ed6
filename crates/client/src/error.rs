//! Error taxonomy for the network-facing half of the client.

use std::time::Duration;

/// Why a network call did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkFailure {
    /// Connection refused, DNS, TLS, broken body, etc.
    #[error("{0}")]
    Transport(String),

    /// The call exceeded its deadline and was aborted.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The call was aborted because a newer request superseded it.
    #[error("cancelled")]
    Cancelled,
}

/// Errors surfaced by [`crate::api::IndexingApi`] and the
/// [`crate::coordinator::RequestCoordinator`].
///
/// `Clone` so that every caller sharing a deduplicated request receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The request never produced a response.
    #[error("Network failure: {0}")]
    Network(#[from] NetworkFailure),

    /// The server answered with a non-2xx status code.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("Malformed response: {0}")]
    Parse(String),
}

impl ClientError {
    /// Whether the call was aborted by its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Network(NetworkFailure::Timeout(_)))
    }

    /// Whether the call was superseded by a newer one.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Network(NetworkFailure::Cancelled))
    }

    /// HTTP status of a non-success response, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, deadline: Option<Duration>) -> Self {
        match deadline {
            Some(deadline) if err.is_timeout() => NetworkFailure::Timeout(deadline).into(),
            _ if err.is_decode() => Self::Parse(err.to_string()),
            _ => NetworkFailure::Transport(err.to_string()).into(),
        }
    }
}

/// Errors from opening or reading a live progress channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Push delivery is not available in this environment. The supervisor
    /// falls back to polling instead of retrying.
    #[error("Live channel unsupported: {0}")]
    Unsupported(String),

    /// The channel could not be opened. Retried with backoff.
    #[error("Live channel connect failed: {0}")]
    Connect(String),

    /// An open channel broke. Retried with backoff.
    #[error("Live channel stream error: {0}")]
    Stream(String),
}

/// Errors from loading [`crate::config::ClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_failures() {
        let timeout = ClientError::from(NetworkFailure::Timeout(Duration::from_secs(4)));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());
        assert_eq!(timeout.to_string(), "Network failure: timed out after 4000ms");

        let status = ClientError::HttpStatus {
            status: 404,
            body: String::new(),
        };
        assert_eq!(status.status(), Some(404));
        assert!(ClientError::from(NetworkFailure::Cancelled).is_cancelled());
    }
}
