//! Command execution on managed hosts.
//!
//! Every call returns an [`ExecutionResult`]; spawn errors, SSH failures,
//! non-zero exits and timeouts are all folded into `success: false`.
//!
//! # Security
//!
//! Commands are passed to a shell verbatim. Callers interpolate request
//! fields (paths, service names, raw commands) without an allow-list, so a
//! client holding the API key can run anything on any managed host. Only
//! transport quoting is applied (see [`wrap_remote_command`](crate::ssh::wrap_remote_command)).

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FleetError, Result};
use crate::registry::{Host, HostRegistry};
use crate::ssh::{push_capped, SshClient, SshConfig};

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes kept per output stream; the remainder is discarded.
pub const OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Universal result shape of a command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Display name of the host (the raw key when the host is unknown).
    #[serde(rename = "vm")]
    pub host: String,
    pub output: String,
    pub stderr: String,
    /// Present iff `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(host: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: true,
            host: host.into(),
            output: output.into(),
            stderr: String::new(),
            error: None,
            exit_code: Some(0),
            duration_ms: 0,
        }
    }

    /// A failed result. An empty `error` is replaced so the message is never blank.
    pub fn failure(host: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            host: host.into(),
            output: String::new(),
            stderr: String::new(),
            error: Some(if error.trim().is_empty() {
                "command failed".to_string()
            } else {
                error
            }),
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn with_streams(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.output = stdout.into();
        self.stderr = stderr.into();
        self
    }

    fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Runs shell commands against hosts by key.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn execute_with_timeout(
        &self,
        host_key: &str,
        command: &str,
        timeout: Duration,
    ) -> ExecutionResult;

    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    async fn execute(&self, host_key: &str, command: &str) -> ExecutionResult {
        self.execute_with_timeout(host_key, command, self.default_timeout())
            .await
    }
}

/// Raw process output before it is folded into an [`ExecutionResult`].
#[derive(Debug, Default)]
struct RawOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

/// Production executor: `sh -c` for the local host, russh for remote ones.
pub struct HostExecutor {
    registry: Arc<HostRegistry>,
    default_timeout: Duration,
    output_cap: usize,
}

impl HostExecutor {
    pub fn new(registry: Arc<HostRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
            output_cap: OUTPUT_CAP,
        }
    }

    #[cfg(test)]
    fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    async fn run_local(&self, command: &str, timeout: Duration) -> Result<RawOutput> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::Other(anyhow::anyhow!("Failed to spawn shell: {}", e)))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let collected = tokio::time::timeout(timeout, async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_capped(stdout_pipe, &mut stdout, self.output_cap),
                read_capped(stderr_pipe, &mut stderr, self.output_cap),
            );
            out?;
            err?;
            status
        })
        .await;

        let (exit_code, timed_out) = match collected {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                let _ = child.kill().await;
                (None, true)
            }
        };

        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            timed_out,
        })
    }

    async fn run_remote(&self, host: &Host, command: &str, timeout: Duration) -> Result<RawOutput> {
        let config = SshConfig::from(host);
        let remote = async {
            let client = SshClient::connect(&host.address, host.port, &config).await?;
            client.exec(command, self.output_cap).await
        };

        match tokio::time::timeout(timeout, remote).await {
            Ok(output) => {
                let output = output?;
                Ok(RawOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code.map(|c| c as i32),
                    timed_out: false,
                })
            }
            // The remote side keeps running; only our wait is bounded.
            Err(_) => Ok(RawOutput {
                timed_out: true,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Execute for HostExecutor {
    async fn execute_with_timeout(
        &self,
        host_key: &str,
        command: &str,
        timeout: Duration,
    ) -> ExecutionResult {
        let host = match self.registry.lookup(host_key) {
            Ok(host) => host,
            Err(e) => {
                tracing::warn!("exec rejected: {}", e);
                return ExecutionResult::failure(host_key, e.to_string());
            }
        };

        tracing::debug!(host = %host.key, cmd = %preview(command, 80), "exec");
        let start = Instant::now();

        let raw = if host.is_local() {
            self.run_local(command, timeout).await
        } else {
            self.run_remote(host, command, timeout).await
        };

        let result = match raw {
            Ok(raw) => fold_output(&host.name, raw, timeout),
            Err(e) => ExecutionResult::failure(&host.name, e.to_string()),
        };
        let result = result.with_duration(start.elapsed());

        if !result.success {
            tracing::warn!(
                host = %host.key,
                cmd = %preview(command, 80),
                error = result.error.as_deref().unwrap_or_default(),
                "exec failed"
            );
        }

        result
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn fold_output(host_name: &str, raw: RawOutput, timeout: Duration) -> ExecutionResult {
    let stdout = raw.stdout.trim().to_string();
    let stderr = raw.stderr.trim().to_string();

    if raw.timed_out {
        return ExecutionResult::failure(
            host_name,
            format!("Command timed out after {}ms", timeout.as_millis()),
        )
        .with_streams(stdout, stderr);
    }

    match raw.exit_code {
        Some(0) => ExecutionResult::success(host_name, "").with_streams(stdout, stderr),
        Some(code) => {
            let error = match stderr.lines().next() {
                Some(detail) => format!("Command failed with exit code {}: {}", code, detail),
                None => format!("Command failed with exit code {}", code),
            };
            ExecutionResult::failure(host_name, error)
                .with_streams(stdout, stderr)
                .with_exit_code(Some(code))
        }
        None => ExecutionResult::failure(host_name, "Command terminated without exit status")
            .with_streams(stdout, stderr),
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes in `buf`.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        push_capped(buf, &chunk[..n], cap);
    }
}

/// Single-line preview of a command for logs.
pub(crate) fn preview(s: &str, max_chars: usize) -> String {
    let flat = s.replace('\n', "\\n");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}
