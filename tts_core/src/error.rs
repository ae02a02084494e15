use std::time::Duration;

use thiserror::Error;

/// Errors raised by the streaming pipeline.
///
/// Every variant maps onto one [`FailureKind`]; the retry policy and the
/// controller only ever look at the kind, never at the message.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by backend{}", retry_after_suffix(.retry_after))]
    RateLimit { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    NetworkTransient(String),

    #[error("Malformed backend payload: {0}")]
    ProtocolMalformed(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {:.1}s)", d.as_secs_f64()),
        None => String::new(),
    }
}

/// Classification used to decide retry vs. fail-fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Auth,
    RateLimit,
    NetworkTransient,
    ProtocolMalformed,
    DeviceUnavailable,
    Local,
}

impl StreamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StreamError::Validation(_) => FailureKind::Validation,
            StreamError::Auth(_) => FailureKind::Auth,
            StreamError::RateLimit { .. } => FailureKind::RateLimit,
            StreamError::NetworkTransient(_) => FailureKind::NetworkTransient,
            StreamError::ProtocolMalformed(_) => FailureKind::ProtocolMalformed,
            StreamError::DeviceUnavailable(_) => FailureKind::DeviceUnavailable,
            StreamError::Cache(_) | StreamError::Io(_) => FailureKind::Local,
        }
    }

    /// Timeout on any network wait.
    pub fn timeout(after: Duration) -> Self {
        StreamError::NetworkTransient(format!("timed out after {} ms", after.as_millis()))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StreamError::Validation(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        StreamError::ProtocolMalformed(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        StreamError::NetworkTransient(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(StreamError::validation("x").kind(), FailureKind::Validation);
        assert_eq!(StreamError::Auth("bad key".into()).kind(), FailureKind::Auth);
        assert_eq!(
            StreamError::RateLimit { retry_after: None }.kind(),
            FailureKind::RateLimit
        );
        assert_eq!(
            StreamError::timeout(Duration::from_millis(10)).kind(),
            FailureKind::NetworkTransient
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(StreamError::from(io).kind(), FailureKind::Local);
    }

    #[test]
    fn test_rate_limit_message_mentions_retry_after() {
        let err = StreamError::RateLimit {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert!(err.to_string().contains("retry after 1.5s"));
        let err = StreamError::RateLimit { retry_after: None };
        assert_eq!(err.to_string(), "Rate limited by backend");
    }
}
