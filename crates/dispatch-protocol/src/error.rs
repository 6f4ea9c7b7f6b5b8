/// Error taxonomy shared across the pipeline.
///
/// Every fallible step classifies its failure so the caller can decide
/// between retry (transient), skip-and-flag (permanent), reject
/// (invariant), and backoff-and-alert (dependency). Unexpected errors are
/// contained at the worker boundary and never kill a pool task.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Timeouts, connection resets, 429s, 5xx responses. Retried within
    /// the owning component's policy.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed messages, unsupported audio formats, bad provider
    /// bodies. Never retried; the affected entity is flagged and skipped.
    #[error("permanent: {0}")]
    Permanent(String),

    /// A data invariant would be violated (e.g. merging into an
    /// already-merged call). The operation is rejected and skipped.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An external dependency (scanner bridge, transcription engine,
    /// geocoder provider) is unavailable.
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    /// Anything uncaught. Isolated to the failing task and logged with
    /// the offending entity id.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Dependency(_))
    }

    /// Classify an HTTP status per the external-interface contracts:
    /// 429 and 5xx are transient, other 4xx are permanent.
    pub fn from_status(status: u16, context: &str) -> Self {
        if status == 429 || status >= 500 {
            Self::Transient(format!("{context}: HTTP {status}"))
        } else {
            Self::Permanent(format!("{context}: HTTP {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(PipelineError::from_status(429, "geocode").is_transient());
        assert!(PipelineError::from_status(503, "geocode").is_transient());
        assert!(!PipelineError::from_status(404, "geocode").is_transient());
        assert!(!PipelineError::from_status(400, "stt").is_transient());
    }
}
