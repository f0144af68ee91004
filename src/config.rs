use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::registry::{ConnectionMode, HostRole};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "FLEET_AGENT_CONFIG";
/// Environment variable that overrides `api_key`.
pub const API_KEY_ENV: &str = "FLEET_AGENT_API_KEY";
/// Environment variable that overrides the listen port.
pub const PORT_ENV: &str = "FLEET_AGENT_PORT";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared secret expected in `X-API-Key` or `?key=`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    /// Services on the hub whose name starts with this prefix are managed by
    /// the OS service manager instead of the process supervisor.
    #[serde(default = "default_reserved_prefix")]
    pub reserved_prefix: String,
    #[serde(default = "default_diagnose_script")]
    pub diagnose_script: String,
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub key: String,
    pub name: String,
    pub mode: ConnectionMode,
    #[serde(default)]
    pub role: HostRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_command: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_command_timeout() -> String {
    "30s".to_string()
}

fn default_reserved_prefix() -> String {
    "grok".to_string()
}

fn default_diagnose_script() -> String {
    "~/auto_diagnose.sh".to_string()
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl AgentConfig {
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("fleet-agent"))
            .ok_or_else(|| FleetError::Config("Cannot determine config directory".to_string()))
    }

    /// Resolve the config path: explicit flag, then `FLEET_AGENT_CONFIG`, then
    /// the per-user config directory.
    pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(expand_path(&path.to_string_lossy()));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(expand_path(&path));
        }
        Ok(Self::config_dir()?.join("config.yaml"))
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::config_path(explicit)?;

        if !path.exists() {
            return Err(FleetError::Config(format!(
                "Config file not found: {}. Pass --config or set {}.",
                path.display(),
                CONFIG_ENV
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| FleetError::Config(format!("Invalid config: {}", e)))
    }

    /// Apply `FLEET_AGENT_*` overrides through `lookup` (the process
    /// environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.is_empty()) {
            self.api_key = key;
        }

        if let Some(port) = lookup(PORT_ENV).and_then(|p| p.trim().parse::<u16>().ok()) {
            let host = self
                .listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.listen = format!("{}:{}", host, port);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(FleetError::Config(format!(
                "api_key is empty. Set it in the config file or via {}",
                API_KEY_ENV
            )));
        }

        if parse_duration(&self.command_timeout).is_none() {
            return Err(FleetError::Config(format!(
                "Invalid command_timeout '{}'. Use format like '30s', '2m', or '45'",
                self.command_timeout
            )));
        }

        self.listen_addr()?;

        if self.hosts.is_empty() {
            return Err(FleetError::Config("No hosts configured".to_string()));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.key.trim().is_empty() {
                return Err(FleetError::Config("Host with empty key".to_string()));
            }
            if !seen.insert(host.key.as_str()) {
                return Err(FleetError::Config(format!("Duplicate host key '{}'", host.key)));
            }
            if host.mode == ConnectionMode::Remote {
                if host.address.trim().is_empty() {
                    return Err(FleetError::Config(format!(
                        "Remote host '{}' needs an address",
                        host.key
                    )));
                }
                if host.key_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    return Err(FleetError::Config(format!(
                        "Remote host '{}' needs a key_path",
                        host.key
                    )));
                }
            }
        }

        let local_hosts = self
            .hosts
            .iter()
            .filter(|h| h.mode == ConnectionMode::Local)
            .count();
        if local_hosts > 1 {
            return Err(FleetError::Config(format!(
                "Only one local host is allowed, found {}",
                local_hosts
            )));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| FleetError::Config(format!("Invalid listen address '{}': {}", self.listen, e)))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else if let Some(minutes) = s.strip_suffix('m') {
        let m = minutes.parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(seconds) = s.strip_suffix('s') {
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
listen: 127.0.0.1:8080
api_key: secret
reserved_prefix: grok
hosts:
  - key: vm1
    name: main
    mode: remote
    address: 10.0.0.5
    key_path: /home/ubuntu/.ssh/vm1_key
    services: [grok-admin-api, grok-voice]
    reboot_command: ~/reboot_vm1.sh
  - key: vm2
    name: hub
    mode: local
    role: hub
    services: [nginx, transcriber, todo-api, grok-bridge]
    os_services: [nginx]
"#;

    pub(crate) fn sample() -> AgentConfig {
        AgentConfig::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("2x"), None);
    }

    #[test]
    fn test_parse_duration_overflow_is_invalid() {
        assert_eq!(parse_duration("9999999999999999999h"), None);
        assert_eq!(parse_duration("9999999999999999999m"), None);
        assert_eq!(
            parse_duration("18446744073709551615s"),
            Some(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn test_sample_defaults() {
        let config = sample();
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.diagnose_script, "~/auto_diagnose.sh");
        assert_eq!(config.hosts[0].user, "ubuntu");
        assert_eq!(config.hosts[0].port, 22);
        assert_eq!(config.hosts[0].role, HostRole::Member);
        assert_eq!(config.hosts[1].role, HostRole::Hub);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = sample();
        config.apply_overrides(|name| match name {
            API_KEY_ENV => Some("from-env".to_string()),
            PORT_ENV => Some("9090".to_string()),
            _ => None,
        });
        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.listen, "127.0.0.1:9090");
    }

    #[test]
    fn test_env_override_ignores_bad_port() {
        let mut config = sample();
        config.apply_overrides(|name| (name == PORT_ENV).then(|| "http".to_string()));
        assert_eq!(config.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_requires_api_key() {
        let mut config = sample();
        config.api_key = " ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_validate_duplicate_keys() {
        let mut config = sample();
        let dup = config.hosts[0].clone();
        config.hosts.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate host key"));
    }

    #[test]
    fn test_validate_remote_needs_key_path() {
        let mut config = sample();
        config.hosts[0].key_path = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_path"));
    }

    #[test]
    fn test_validate_single_local_host() {
        let mut config = sample();
        let mut second = config.hosts[1].clone();
        second.key = "vm3".to_string();
        config.hosts.push(second);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Only one local host"));
    }

    #[test]
    fn test_validate_bad_timeout() {
        let mut config = sample();
        config.command_timeout = "forever".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].services.len(), 4);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config =
            AgentConfig::from_yaml(include_str!("../fleet-agent.example.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.hosts[0].reboot_command.as_deref(), Some("~/reboot_vm1.sh"));
        assert_eq!(config.hosts[1].os_services, vec!["nginx".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent.yaml");
        let err = AgentConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
