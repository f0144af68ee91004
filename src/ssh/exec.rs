//! Remote command execution.
//!
//! Provides non-interactive command execution with stdout/stderr capture.

use russh::client::Handle;
use russh::ChannelMsg;

use crate::error::{FleetError, Result};
use crate::ssh::client::ClientHandler;

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,

    /// Standard error.
    pub stderr: String,

    /// Exit status reported by the server, if any.
    pub exit_code: Option<u32>,

    /// Whether the command succeeded (exit_code == 0).
    pub success: bool,
}

impl CommandOutput {
    fn new(stdout: String, stderr: String, exit_code: Option<u32>) -> Self {
        Self {
            stdout,
            stderr,
            success: exit_code == Some(0),
            exit_code,
        }
    }
}

/// Wrap a command for the remote login shell.
///
/// Single quotes are the only character that needs escaping inside a
/// single-quoted bash word. Multi-line content such as here-documents
/// survives unchanged.
pub fn wrap_remote_command(command: &str) -> String {
    format!(
        "bash --norc --noprofile -c '{}'",
        command.replace('\'', "'\\''")
    )
}

/// Append `data` to `buf` without letting it grow past `cap` bytes.
pub(crate) fn push_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

/// Execute a command on the remote host (non-interactive).
///
/// Each stream keeps at most `output_cap` bytes; the rest is drained and dropped.
pub async fn exec_command(
    session: &Handle<ClientHandler>,
    command: &str,
    output_cap: usize,
) -> Result<CommandOutput> {
    let wrapped_command = wrap_remote_command(command);

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| FleetError::Ssh(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, wrapped_command.as_bytes())
        .await
        .map_err(|e| FleetError::Ssh(format!("Failed to execute command: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                push_capped(&mut stdout, &data, output_cap);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    push_capped(&mut stderr, &data, output_cap);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status);
            }
            Some(ChannelMsg::Close) | None => {
                break;
            }
            _ => {}
        }
    }

    let stdout_str = String::from_utf8_lossy(&stdout).to_string();
    let stderr_str = String::from_utf8_lossy(&stderr).to_string();

    Ok(CommandOutput::new(stdout_str, stderr_str, exit_code))
}
