//! SSH connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::Host;

/// Matches `ssh -o ConnectTimeout=10`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH connection configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// SSH username.
    pub user: String,

    /// Path to the private key file. `None` leaves only agent authentication.
    pub key_path: Option<PathBuf>,

    /// Host key verification policy.
    pub host_key_policy: HostKeyPolicy,

    /// Upper bound for TCP connect plus handshake.
    pub connect_timeout: Duration,
}

/// Host key verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key (matches OpenSSH StrictHostKeyChecking=no).
    #[default]
    AcceptAny,
}

impl SshConfig {
    /// Create a new SSH configuration.
    pub fn new(user: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path,
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl From<&Host> for SshConfig {
    fn from(host: &Host) -> Self {
        Self::new(&host.user, host.key_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::registry::HostRegistry;

    #[test]
    fn test_ssh_config_from_host() {
        let registry = HostRegistry::from_config(&sample());
        let config = SshConfig::from(registry.lookup("vm1").unwrap());

        assert_eq!(config.user, "ubuntu");
        assert_eq!(config.key_path, Some(PathBuf::from("/home/ubuntu/.ssh/vm1_key")));
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptAny);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
