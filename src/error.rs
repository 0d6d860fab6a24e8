//! Error types for the analysis bridge

use std::fmt;

use thiserror::Error;

/// Exit code the pipeline scripts reserve for permanent failures.
pub const PERMANENT_EXIT_CODE: i32 = 2;

/// Exit code recorded when a failure did not come from a process exit.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const TRANSIENT_MARKERS: [&str; 4] = ["timeout", "network", "connection", "rate limit"];

/// Crate-level error for everything outside a single pipeline attempt
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Worker pool saturated: {pending} tasks already queued")]
    PoolSaturated { pending: usize },

    #[error("Worker pool is shutting down")]
    PoolClosed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// What went wrong during one pipeline attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The process could not be started at all.
    Launch,
    /// The process outlived its timeout and was killed.
    Timeout,
    /// The process exited with a non-zero status.
    NonZeroExit,
    /// The process produced no output to parse.
    EmptyOutput,
    /// Reading from or waiting on the process failed.
    Io,
    /// The caller cancelled the invocation.
    Cancelled,
    /// The request failed validation and was never dispatched.
    InvalidRequest,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "LaunchFailure",
            Self::Timeout => "Timeout",
            Self::NonZeroExit => "NonZeroExit",
            Self::EmptyOutput => "EmptyOutput",
            Self::Io => "IoFailure",
            Self::Cancelled => "Cancelled",
            Self::InvalidRequest => "InvalidRequest",
        }
    }

    /// Kinds that are never retried regardless of their message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Launch | Self::Cancelled | Self::EmptyOutput | Self::InvalidRequest
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a pipeline invocation, classified for the retry loop.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProcessingError {
    pub kind: FailureKind,
    pub message: String,
    pub correlation_id: String,
    pub pipeline_id: String,
    pub exit_code: i32,
}

impl ProcessingError {
    pub fn new(
        kind: FailureKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: correlation_id.into(),
            pipeline_id: "unknown".to_string(),
            exit_code: UNKNOWN_EXIT_CODE,
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = pipeline_id.into();
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn launch(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(FailureKind::Launch, message, correlation_id)
    }

    pub fn timeout(timeout_secs: u64, correlation_id: impl Into<String>) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("pipeline script timeout after {timeout_secs}s"),
            correlation_id,
        )
    }

    pub fn non_zero_exit(
        exit_code: i32,
        stderr: &str,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(
            FailureKind::NonZeroExit,
            format!("pipeline script failed (exit_code={exit_code}): {}", stderr.trim()),
            correlation_id,
        )
        .with_exit_code(exit_code)
    }

    pub fn cancelled(correlation_id: impl Into<String>) -> Self {
        Self::new(
            FailureKind::Cancelled,
            "pipeline invocation cancelled",
            correlation_id,
        )
    }

    pub fn invalid_request(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidRequest, message, correlation_id)
    }

    /// True when the message names a condition that usually clears on its own.
    pub fn is_transient(&self) -> bool {
        let lower = self.message.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
    }

    pub fn is_retryable(&self) -> bool {
        !self.kind.is_fatal() && self.is_transient() && self.exit_code != PERMANENT_EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_are_case_insensitive() {
        let err = ProcessingError::new(FailureKind::Io, "Connection reset by peer", "c1");
        assert!(err.is_transient());
        assert!(err.is_retryable());

        let err = ProcessingError::new(FailureKind::Io, "RATE LIMIT exceeded", "c1");
        assert!(err.is_transient());
    }

    #[test]
    fn timeout_message_is_retryable() {
        let err = ProcessingError::timeout(30, "c1");
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(err.is_retryable());
        assert_eq!(err.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(err.pipeline_id, "unknown");
    }

    #[test]
    fn exit_code_two_is_never_retryable() {
        let err = ProcessingError::non_zero_exit(2, "network unreachable", "c1");
        assert!(err.is_transient());
        assert!(!err.is_retryable());
    }

    #[test]
    fn non_zero_exit_without_marker_is_permanent() {
        let err = ProcessingError::non_zero_exit(1, "KeyError: 'feedback'", "c1");
        assert!(!err.is_transient());
        assert!(!err.is_retryable());

        let err = ProcessingError::non_zero_exit(1, "upstream connection refused", "c1");
        assert!(err.is_retryable());
    }

    #[test]
    fn fatal_kinds_ignore_transient_wording() {
        let err = ProcessingError::launch("connection to interpreter failed", "c1");
        assert!(err.is_transient());
        assert!(!err.is_retryable());
        assert!(!ProcessingError::cancelled("c1").is_retryable());
        let err = ProcessingError::invalid_request("timeout_secs must be greater than 0", "c1");
        assert!(err.is_transient());
        assert!(!err.is_retryable());
        assert_eq!(err.kind.as_str(), "InvalidRequest");
    }

    #[test]
    fn display_is_the_message() {
        let err = ProcessingError::timeout(10, "c1").with_pipeline("test_scripts.py");
        assert_eq!(err.to_string(), "pipeline script timeout after 10s");
        assert_eq!(err.pipeline_id, "test_scripts.py");
    }
}
