//! Error types shared by every part of the SDK.

use std::time::Duration;

use thiserror::Error;

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error type for SDK operations.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Missing or invalid configuration (blid, password, host, cipher list)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection, authentication or TLS failure. Never retried.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport refused or failed to write a publish
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The session ended while the call was pending
    #[error("Session is closed")]
    Closed,

    /// Bounded wait elapsed
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// The device answered with something we do not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdkError {
    /// Build a [`SdkError::Timeout`] from the limit that elapsed.
    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
    }

    /// Whether the error means the session is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let error = SdkError::timeout(Duration::from_millis(1500));
        assert_eq!(error.to_string(), "Operation timeout after 1500ms");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SdkError::Closed.is_fatal());
        assert!(SdkError::Connection("bad password".to_string()).is_fatal());
        assert!(!SdkError::Publish("queue full".to_string()).is_fatal());
        assert!(!SdkError::Timeout(10).is_fatal());
    }

    #[test]
    fn test_serialization_from() {
        let inner = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: SdkError = inner.into();
        assert!(error.to_string().starts_with("Serialization error"));
    }
}
