//! Bounded retry loop around a single [`Invoker`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProcessingError;
use crate::invoker::Invoker;
use crate::model::AnalysisResponse;
use crate::parser::parse_output;
use crate::request::AnalysisRequest;

/// Lifecycle of one logical invocation, logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
}

impl InvocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Dispatched => "dispatched",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct RetryCoordinator {
    invoker: Arc<dyn Invoker>,
    base_delay: Duration,
}

impl RetryCoordinator {
    pub fn new(invoker: Arc<dyn Invoker>, base_delay: Duration) -> Self {
        Self {
            invoker,
            base_delay,
        }
    }

    /// Delay before attempt `attempt + 1`; grows linearly.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `request` until it yields parseable output, fails permanently or
    /// exhausts its attempts. A parsed response ends the loop even when it
    /// reports `success == false`.
    pub async fn execute_with_retry(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResponse, ProcessingError> {
        let cid = request.correlation_id();
        let max_attempts = request.attempts();
        let mut state = InvocationState::Created;
        debug!(
            "Invocation {} for {} (correlation_id: {}, max_attempts: {})",
            state.as_str(),
            request.script_id,
            cid,
            max_attempts
        );

        if let Err(err) = request.validate() {
            warn!("Rejected request for {}: {} (correlation_id: {})", request.script_id, err, cid);
            return Err(ProcessingError::invalid_request(err.to_string(), cid)
                .with_pipeline(&request.script_id));
        }

        if cancel.is_cancelled() {
            return Err(ProcessingError::cancelled(cid).with_pipeline(&request.script_id));
        }

        let mut attempt = 1;
        loop {
            state = if attempt == 1 {
                InvocationState::Dispatched
            } else {
                InvocationState::Retrying
            };
            debug!(
                "Invocation {} attempt {}/{} (correlation_id: {})",
                state.as_str(),
                attempt,
                max_attempts,
                cid
            );

            let err = match self.invoker.invoke(request, cancel).await {
                Ok(output) => {
                    let elapsed_ms = output.elapsed.as_millis() as u64;
                    let mut response = parse_output(&output.stdout, elapsed_ms, cid);
                    if output.stdout_truncated && !response.success {
                        let note = format!("stdout truncated at {} bytes", output.stdout.len());
                        response.error_message = Some(match response.error_message.take() {
                            Some(message) => format!("{message} ({note})"),
                            None => note,
                        });
                    }
                    state = InvocationState::Succeeded;
                    info!(
                        "Invocation {} after {} attempt(s): success={} (correlation_id: {})",
                        state.as_str(),
                        attempt,
                        response.success,
                        cid
                    );
                    return Ok(response);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                state = InvocationState::Failed;
                warn!(
                    "Invocation {} on attempt {}/{} [{}]: {} (correlation_id: {})",
                    state.as_str(),
                    attempt,
                    max_attempts,
                    err.kind,
                    err.message,
                    cid
                );
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(
                "Attempt {}/{} failed with retryable error, retrying in {}ms: {} (correlation_id: {})",
                attempt,
                max_attempts,
                delay.as_millis(),
                err.message,
                cid
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProcessingError::cancelled(cid).with_pipeline(&request.script_id));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::invoker::ProcessOutput;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Replays scripted attempt outcomes and records when each attempt began.
    struct ScriptedInvoker {
        outcomes: Mutex<VecDeque<Result<ProcessOutput, ProcessingError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedInvoker {
        fn new(outcomes: Vec<Result<ProcessOutput, ProcessingError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Invoker for ScriptedInvoker {
        async fn invoke(
            &self,
            request: &AnalysisRequest,
            _cancel: &CancellationToken,
        ) -> Result<ProcessOutput, ProcessingError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ProcessingError::launch(
                        "no scripted outcome",
                        request.correlation_id(),
                    ))
                })
        }
    }

    fn stdout(body: &str) -> Result<ProcessOutput, ProcessingError> {
        Ok(ProcessOutput {
            stdout: body.to_string(),
            stderr: String::new(),
            exit_code: 0,
            elapsed: Duration::from_millis(12),
            stdout_truncated: false,
        })
    }

    fn truncated_stdout(body: &str) -> Result<ProcessOutput, ProcessingError> {
        stdout(body).map(|output| ProcessOutput {
            stdout_truncated: true,
            ..output
        })
    }

    fn timeout() -> Result<ProcessOutput, ProcessingError> {
        Err(ProcessingError::timeout(30, "retry_test"))
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("pipeline1_living_manual.py", "text")
            .with_correlation_id("retry_test")
            .with_max_retries(3)
    }

    #[tokio::test]
    async fn retries_transient_failures_with_linear_backoff() {
        let invoker = ScriptedInvoker::new(vec![
            timeout(),
            timeout(),
            stdout(r#"{"success": true, "classification_results": []}"#),
        ]);
        let base = Duration::from_millis(50);
        let coordinator = RetryCoordinator::new(invoker.clone(), base);

        let response = coordinator
            .execute_with_retry(&request(), &CancellationToken::new())
            .await
            .expect("third attempt succeeds");

        assert!(response.success);
        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= base);
        assert!(calls[2] - calls[1] >= base * 2);
    }

    #[tokio::test]
    async fn permanent_exit_code_is_not_retried() {
        let invoker = ScriptedInvoker::new(vec![Err(ProcessingError::non_zero_exit(
            2,
            "connection refused",
            "retry_test",
        ))]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(10));

        let err = coordinator
            .execute_with_retry(&request(), &CancellationToken::new())
            .await
            .expect_err("permanent failure");

        assert_eq!(err.exit_code, 2);
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let invoker = ScriptedInvoker::new(vec![timeout(), timeout(), timeout(), timeout()]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(5));

        let err = coordinator
            .execute_with_retry(&request(), &CancellationToken::new())
            .await
            .expect_err("all attempts time out");

        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn disabled_retries_make_one_attempt() {
        let invoker = ScriptedInvoker::new(vec![timeout(), stdout("{}")]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(5));

        let err = coordinator
            .execute_with_retry(&request().without_retries(), &CancellationToken::new())
            .await
            .expect_err("single attempt");

        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn malformed_output_ends_the_loop() {
        let invoker = ScriptedInvoker::new(vec![stdout("Traceback: not json"), stdout("{}")]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(5));

        let response = coordinator
            .execute_with_retry(&request(), &CancellationToken::new())
            .await
            .expect("parse failures are responses");

        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("MalformedPayload"));
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn truncated_output_is_named_in_the_failure() {
        let invoker = ScriptedInvoker::new(vec![truncated_stdout(
            r##"{"success": true, "classification_results": [{"keyword": "#성"##,
        )]);
        let coordinator = RetryCoordinator::new(invoker, Duration::from_millis(5));

        let response = coordinator
            .execute_with_retry(&request(), &CancellationToken::new())
            .await
            .expect("parse failures are responses");

        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("MalformedPayload"));
        let message = response.error_message.unwrap_or_default();
        assert!(message.contains("stdout truncated at"), "{message}");
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_the_loop() {
        let invoker = ScriptedInvoker::new(vec![timeout(), stdout("{}")]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = coordinator
            .execute_with_retry(&request(), &cancel)
            .await
            .expect_err("cancelled");

        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(invoker.calls().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_token_never_dispatches() {
        let invoker = ScriptedInvoker::new(vec![stdout("{}")]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .execute_with_retry(&request(), &cancel)
            .await
            .expect_err("cancelled up front");
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_dispatch() {
        let invoker = ScriptedInvoker::new(vec![stdout("{}"), stdout("{}")]);
        let coordinator = RetryCoordinator::new(invoker.clone(), Duration::from_millis(5));

        let zero_timeout = request().with_timeout_secs(0);
        let err = coordinator
            .execute_with_retry(&zero_timeout, &CancellationToken::new())
            .await
            .expect_err("zero timeout is invalid");
        assert_eq!(err.kind, FailureKind::InvalidRequest);
        assert_eq!(err.pipeline_id, "pipeline1_living_manual.py");
        assert!(err.message.contains("timeout_secs"));
        assert!(!err.is_retryable());

        let zero_retries = request().with_max_retries(0);
        let err = coordinator
            .execute_with_retry(&zero_retries, &CancellationToken::new())
            .await
            .expect_err("zero retries is invalid");
        assert_eq!(err.kind, FailureKind::InvalidRequest);

        assert!(invoker.calls().is_empty());
    }

    #[test]
    fn backoff_is_base_times_attempt() {
        let invoker = ScriptedInvoker::new(Vec::new());
        let coordinator = RetryCoordinator::new(invoker, Duration::from_millis(1000));
        assert_eq!(coordinator.backoff(1), Duration::from_millis(1000));
        assert_eq!(coordinator.backoff(3), Duration::from_millis(3000));
    }
}
