//! Launches one pipeline attempt as a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProcessConfig;
use crate::error::{FailureKind, ProcessingError};
use crate::request::AnalysisRequest;

/// Captured result of a process that exited with status 0
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed: Duration,
    /// stdout went past the configured cap and the rest was discarded
    pub stdout_truncated: bool,
}

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run one attempt. Non-zero exits, timeouts and cancellation are errors.
    async fn invoke(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessingError>;
}

#[derive(Debug, Clone)]
pub struct ScriptInvoker {
    executable: PathBuf,
    scripts_root: PathBuf,
    module_path_var: String,
    encoding_var: String,
    stdout_cap_bytes: usize,
    stderr_cap_bytes: usize,
}

impl ScriptInvoker {
    pub fn new(executable: impl Into<PathBuf>, scripts_root: impl Into<PathBuf>) -> Self {
        Self::from_config(&ProcessConfig {
            executable: executable.into(),
            scripts_root: scripts_root.into(),
            ..ProcessConfig::default()
        })
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            scripts_root: config.scripts_root.clone(),
            module_path_var: config.module_path_var.clone(),
            encoding_var: config.encoding_var.clone(),
            stdout_cap_bytes: config.stdout_cap_bytes,
            stderr_cap_bytes: config.stderr_cap_bytes,
        }
    }

    fn command(&self, request: &AnalysisRequest) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.kill_on_drop(true)
            .current_dir(&self.scripts_root)
            .env(&self.module_path_var, &self.scripts_root)
            .env(&self.encoding_var, "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .args(request.command_args());
        cmd
    }
}

#[async_trait]
impl Invoker for ScriptInvoker {
    async fn invoke(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessingError> {
        let cid = request.correlation_id();
        let started = Instant::now();

        debug!(
            "Starting pipeline process: {} {} (correlation_id: {})",
            self.executable.display(),
            request.script_id,
            cid
        );

        let mut child = self
            .command(request)
            .spawn()
            .map_err(|e| map_spawn_err(e, request))?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ProcessingError::new(FailureKind::Io, "stdout unavailable", cid)
                .with_pipeline(&request.script_id)
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            ProcessingError::new(FailureKind::Io, "stderr unavailable", cid)
                .with_pipeline(&request.script_id)
        })?;

        let deadline = tokio::time::sleep(request.timeout());
        tokio::pin!(deadline);

        let mut stdout_buf = Capture::new("stdout", self.stdout_cap_bytes);
        let mut stderr_buf = Capture::new("stderr", self.stderr_cap_bytes);
        let mut stdout_chunk = [0u8; 8192];
        let mut stderr_chunk = [0u8; 4096];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut exit_status = None;

        // Both pipes are drained while waiting; a child blocked on a full
        // stderr pipe would otherwise never exit.
        let status = loop {
            if let Some(status) = exit_status
                && !stdout_open
                && !stderr_open
            {
                break status;
            }

            tokio::select! {
                read = stdout.read(&mut stdout_chunk), if stdout_open => {
                    stdout_open = stdout_buf.absorb(read, &stdout_chunk, cid);
                }
                read = stderr.read(&mut stderr_chunk), if stderr_open => {
                    stderr_open = stderr_buf.absorb(read, &stderr_chunk, cid);
                }
                waited = child.wait(), if exit_status.is_none() => {
                    let status = waited.map_err(|e| {
                        ProcessingError::new(FailureKind::Io, format!("wait error: {e}"), cid)
                            .with_pipeline(&request.script_id)
                    })?;
                    exit_status = Some(status);
                }
                _ = &mut deadline => {
                    if let Some(status) = exit_status {
                        // Exited in time, but a grandchild still holds the pipes.
                        warn!(
                            "Pipeline output streams still open after exit; truncating (correlation_id: {})",
                            cid
                        );
                        break status;
                    }
                    warn!(
                        "Pipeline timeout after {}s, killing process (correlation_id: {})",
                        request.timeout_secs, cid
                    );
                    let _ = child.kill().await;
                    return Err(ProcessingError::timeout(request.timeout_secs, cid)
                        .with_pipeline(&request.script_id));
                }
                _ = cancel.cancelled() => {
                    warn!("Pipeline cancelled, killing process (correlation_id: {})", cid);
                    let _ = child.kill().await;
                    return Err(ProcessingError::cancelled(cid).with_pipeline(&request.script_id));
                }
            }
        };

        let elapsed = started.elapsed();
        let stdout = String::from_utf8_lossy(&stdout_buf.bytes).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf.bytes).to_string();
        // Killed by a signal: no code available.
        let exit_code = status.code().unwrap_or(crate::error::UNKNOWN_EXIT_CODE);

        debug!(
            "Pipeline process finished: exit_code={}, elapsed={}ms, stdout={}B (correlation_id: {})",
            exit_code,
            elapsed.as_millis(),
            stdout_buf.bytes.len(),
            cid
        );

        if !status.success() {
            return Err(ProcessingError::non_zero_exit(exit_code, &stderr, cid)
                .with_pipeline(&request.script_id));
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            elapsed,
            stdout_truncated: stdout_buf.truncated,
        })
    }
}

/// Bytes kept from one output stream, bounded by `cap`.
struct Capture {
    stream: &'static str,
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Capture {
    fn new(stream: &'static str, cap: usize) -> Self {
        Self {
            stream,
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a read result, dropping whatever exceeds the cap.
    /// Returns whether the stream is still open.
    fn absorb(&mut self, read: std::io::Result<usize>, chunk: &[u8], cid: &str) -> bool {
        match read {
            Ok(0) => false,
            Ok(n) => {
                let remaining = self.cap.saturating_sub(self.bytes.len());
                let kept = remaining.min(n);
                self.bytes.extend_from_slice(&chunk[..kept]);
                if kept < n && !self.truncated {
                    self.truncated = true;
                    warn!(
                        "Pipeline {} exceeded {} bytes, discarding the rest (correlation_id: {})",
                        self.stream, self.cap, cid
                    );
                }
                true
            }
            Err(e) => {
                warn!("{} read error (non-fatal): {}", self.stream, e);
                false
            }
        }
    }
}

fn map_spawn_err(err: std::io::Error, request: &AnalysisRequest) -> ProcessingError {
    let message = if err.kind() == std::io::ErrorKind::NotFound {
        format!("pipeline executable or scripts root not found: {err}")
    } else {
        format!("failed to launch pipeline process: {err}")
    };
    ProcessingError::launch(message, request.correlation_id()).with_pipeline(&request.script_id)
}
