//! Immutable description of one pipeline invocation

use std::time::Duration;

use serde::Serialize;

use crate::error::{BridgeError, Result};

/// Placeholder argument passed when a request has no context.
pub const NULL_CONTEXT: &str = "null";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_PRIORITY: u8 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub script_id: String,
    pub input_payload: String,
    pub context: Option<String>,
    pub correlation_id: Option<String>,
    pub timeout_secs: u64,
    pub retry_enabled: bool,
    pub max_retries: u32,
    /// 1 = highest, 5 = lowest
    pub priority: u8,
}

impl AnalysisRequest {
    pub fn new(script_id: impl Into<String>, input_payload: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            input_payload: input_payload.into(),
            context: None,
            correlation_id: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_context(mut self, context: Option<impl Into<String>>) -> Self {
        self.context = context.map(Into::into);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_enabled = true;
        self.max_retries = max_retries;
        self
    }

    pub fn without_retries(mut self) -> Self {
        self.retry_enabled = false;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.script_id.trim().is_empty() {
            return Err(BridgeError::Validation {
                message: "script_id cannot be empty".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(BridgeError::Validation {
                message: "timeout_secs must be greater than 0".into(),
            });
        }
        if self.retry_enabled && self.max_retries == 0 {
            return Err(BridgeError::Validation {
                message: "max_retries must be at least 1 when retries are enabled".into(),
            });
        }
        if !(1..=5).contains(&self.priority) {
            return Err(BridgeError::Validation {
                message: format!("priority must be between 1 and 5, got {}", self.priority),
            });
        }
        Ok(())
    }

    /// Total number of attempts the retry loop may make.
    pub fn attempts(&self) -> u32 {
        if self.retry_enabled {
            self.max_retries.max(1)
        } else {
            1
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("")
    }

    /// Arguments after the executable:
    /// `<script> <payload> <context|null> [<correlation_id>]`
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            self.script_id.clone(),
            self.input_payload.clone(),
            self.context
                .clone()
                .unwrap_or_else(|| NULL_CONTEXT.to_string()),
        ];
        if let Some(ref cid) = self.correlation_id {
            args.push(cid.clone());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_args_use_null_placeholder() {
        let req = AnalysisRequest::new("pipeline1_living_manual.py", "hello");
        assert_eq!(
            req.command_args(),
            vec!["pipeline1_living_manual.py", "hello", "null"]
        );

        let req = req
            .with_context(Some("{\"team\":1}"))
            .with_correlation_id("feedback_1a2b3c4d");
        assert_eq!(
            req.command_args(),
            vec![
                "pipeline1_living_manual.py",
                "hello",
                "{\"team\":1}",
                "feedback_1a2b3c4d"
            ]
        );
    }

    #[test]
    fn attempts_follow_retry_flag() {
        let req = AnalysisRequest::new("s.py", "x").with_max_retries(4);
        assert_eq!(req.attempts(), 4);
        assert_eq!(req.without_retries().attempts(), 1);
    }

    #[test]
    fn validate_rejects_broken_invariants() {
        assert!(AnalysisRequest::new("s.py", "x").validate().is_ok());
        assert!(
            AnalysisRequest::new("s.py", "x")
                .with_timeout_secs(0)
                .validate()
                .is_err()
        );
        assert!(
            AnalysisRequest::new("s.py", "x")
                .with_max_retries(0)
                .validate()
                .is_err()
        );
        // zero retries is irrelevant once retries are off
        assert!(
            AnalysisRequest::new("s.py", "x")
                .with_max_retries(0)
                .without_retries()
                .validate()
                .is_ok()
        );
        assert!(
            AnalysisRequest::new("s.py", "x")
                .with_priority(9)
                .validate()
                .is_err()
        );
        assert!(AnalysisRequest::new(" ", "x").validate().is_err());
    }
}
