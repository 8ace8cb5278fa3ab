//! Error taxonomy for scraping and comparable discovery.
//!
//! Only `NotSupported`, `StrategyExhausted` and `ResourceTimeout` surface as
//! hard failures at the caller boundary. `ValidationRejected` is swallowed by
//! the tier that produced it and `TransientBlock` is consumed by the
//! orchestrator's backoff path.

use crate::strategy::TraceEntry;
use std::time::Duration;

/// All errors produced by the scraping runtime.
#[derive(thiserror::Error, Debug)]
pub enum ScrapeError {
    #[error("source not supported: {0}")]
    NotSupported(String),

    #[error("all {} techniques failed for {url}", trace.len())]
    StrategyExhausted { url: String, trace: Vec<TraceEntry> },

    #[error("timed out after {}ms waiting for {what}", elapsed.as_millis())]
    ResourceTimeout { what: String, elapsed: Duration },

    #[error("candidate rejected: {0}")]
    ValidationRejected(String),

    #[error("blocked by {url}: {reason}")]
    TransientBlock { url: String, reason: String },

    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScrapeError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StrategyExhausted { .. } | Self::ResourceTimeout { .. } | Self::TransientBlock { .. }
        )
    }

    /// Whether this failure is a hard failure at the calling boundary.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            Self::NotSupported(_) | Self::StrategyExhausted { .. } | Self::ResourceTimeout { .. }
        )
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        Self::ResourceTimeout {
            what: what.into(),
            elapsed,
        }
    }
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!ScrapeError::NotSupported("x.com".into()).is_retryable());
        assert!(ScrapeError::timeout("browser", Duration::from_millis(5)).is_retryable());
        assert!(ScrapeError::TransientBlock {
            url: "https://x".into(),
            reason: "429".into()
        }
        .is_retryable());
        assert!(!ScrapeError::ValidationRejected("price".into()).is_retryable());
    }

    #[test]
    fn test_hard_failures() {
        let exhausted = ScrapeError::StrategyExhausted {
            url: "https://cian.ru/sale/flat/1/".into(),
            trace: Vec::new(),
        };
        assert!(exhausted.is_hard_failure());
        assert!(!ScrapeError::ValidationRejected("region".into()).is_hard_failure());
        assert!(!ScrapeError::TransientBlock {
            url: String::new(),
            reason: String::new()
        }
        .is_hard_failure());
    }

    #[test]
    fn test_timeout_message() {
        let err = ScrapeError::timeout("browser lease", Duration::from_millis(250));
        assert_eq!(err.to_string(), "timed out after 250ms waiting for browser lease");
    }
}
