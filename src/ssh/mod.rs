//! Pure Rust SSH transport for remote hosts.
//!
//! ## Modules
//!
//! - [`client`] - SSH connection management and authentication
//! - [`config`] - Connection settings derived from a [`Host`](crate::registry::Host)
//! - [`exec`] - Remote command execution

mod client;
pub mod config;
mod exec;

pub use client::SshClient;
pub use config::SshConfig;
pub use exec::{wrap_remote_command, CommandOutput};
pub(crate) use exec::push_capped;

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::error::{FleetError, Result};

/// TCP-level reachability check of an SSH port.
///
/// Returns the connect latency. No SSH handshake is attempted.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> Result<Duration> {
    let addr = format!("{}:{}", host, port);
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(FleetError::Ssh(format!("Cannot reach {}: {}", addr, e))),
        Err(_) => Err(FleetError::Ssh(format!(
            "Timeout reaching {} after {}ms",
            addr,
            timeout.as_millis()
        ))),
    }
}
