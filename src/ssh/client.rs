//! SSH client implementation using russh.
//!
//! Provides connection management and authentication.

use std::net::ToSocketAddrs;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use tokio::net::UnixStream;

use crate::error::{FleetError, Result};
use crate::ssh::config::{HostKeyPolicy, SshConfig};
use crate::ssh::exec::CommandOutput;

/// SSH client wrapper over russh. One session per command batch.
pub struct SshClient {
    session: Handle<ClientHandler>,
    host: String,
}

impl SshClient {
    /// Connect and authenticate, bounded by `config.connect_timeout`.
    pub async fn connect(host: &str, port: u16, config: &SshConfig) -> Result<Self> {
        tokio::time::timeout(config.connect_timeout, Self::connect_inner(host, port, config))
            .await
            .map_err(|_| {
                FleetError::Ssh(format!(
                    "Connection to {}:{} timed out after {}s",
                    host,
                    port,
                    config.connect_timeout.as_secs()
                ))
            })?
    }

    async fn connect_inner(host: &str, port: u16, config: &SshConfig) -> Result<Self> {
        let russh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        // Resolve hostname to IP
        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()
            .map_err(|e| FleetError::Ssh(format!("Failed to resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| FleetError::Ssh(format!("No address found for {}", host)))?;

        let handler = ClientHandler {
            host_key_policy: config.host_key_policy,
        };

        let mut session = client::connect(russh_config, addr, handler)
            .await
            .map_err(|e| FleetError::Ssh(format!("Connection failed: {}", e)))?;

        Self::authenticate(&mut session, config).await?;

        Ok(Self {
            session,
            host: host.to_string(),
        })
    }

    /// Authenticate with the configured key file, falling back to the SSH agent.
    async fn authenticate(session: &mut Handle<ClientHandler>, config: &SshConfig) -> Result<()> {
        if config.key_path.is_some() {
            match Self::auth_with_key_file(session, config).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!("Key file authentication failed: {}", e),
            }
        }

        match Self::auth_with_agent(session, config).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FleetError::Ssh(format!(
                "Authentication failed for {}: server rejected all keys",
                config.user
            ))),
            Err(e) => Err(e),
        }
    }

    /// Authenticate using key file directly.
    async fn auth_with_key_file(
        session: &mut Handle<ClientHandler>,
        config: &SshConfig,
    ) -> Result<()> {
        let key_path = config
            .key_path
            .as_ref()
            .ok_or_else(|| FleetError::Ssh("No key file configured".to_string()))?;

        let key = russh_keys::load_secret_key(key_path, None)
            .map_err(|e| FleetError::Ssh(format!("Failed to load key {}: {}", key_path.display(), e)))?;

        let auth_result = session
            .authenticate_publickey(&config.user, Arc::new(key))
            .await
            .map_err(|e| FleetError::Ssh(format!("Authentication failed: {}", e)))?;

        if auth_result {
            Ok(())
        } else {
            Err(FleetError::Ssh(format!(
                "Server rejected key {}",
                key_path.display()
            )))
        }
    }

    /// Authenticate using SSH agent.
    async fn auth_with_agent(
        session: &mut Handle<ClientHandler>,
        config: &SshConfig,
    ) -> Result<bool> {
        let socket_path = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| FleetError::Ssh("Key authentication failed and SSH_AUTH_SOCK is not set".to_string()))?;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| FleetError::Ssh(format!("Failed to connect to agent: {}", e)))?;

        let mut agent = russh_keys::agent::client::AgentClient::connect(stream);

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| FleetError::Ssh(format!("Failed to get agent identities: {}", e)))?;

        for identity in identities {
            match session
                .authenticate_publickey_with(&config.user, identity, &mut agent)
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!("Agent auth error: {}", e);
                    continue;
                }
            }
        }

        Ok(false)
    }

    /// Execute a command on the remote host (non-interactive).
    pub async fn exec(&self, command: &str, output_cap: usize) -> Result<CommandOutput> {
        tracing::trace!("ssh exec on {}", self.host);
        crate::ssh::exec::exec_command(&self.session, command, output_cap).await
    }
}

/// Client handler for russh connection callbacks.
pub struct ClientHandler {
    pub host_key_policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = FleetError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.host_key_policy {
            HostKeyPolicy::AcceptAny => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_handler_accepts_keys() {
        let handler = ClientHandler {
            host_key_policy: HostKeyPolicy::AcceptAny,
        };
        assert!(matches!(handler.host_key_policy, HostKeyPolicy::AcceptAny));
    }

    #[tokio::test]
    async fn test_connect_refused_is_ssh_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = SshConfig::new("nobody", None);
        config.connect_timeout = Duration::from_secs(2);

        let result = SshClient::connect("127.0.0.1", port, &config).await;
        assert!(matches!(result, Err(FleetError::Ssh(_))));
    }
}
