use std::net::{IpAddr, SocketAddr};

use crate::agent;
use crate::config::AgentConfig;
use crate::error::{FleetError, Result};

pub async fn execute(config: &AgentConfig, bind: Option<String>, port: Option<u16>) -> Result<()> {
    let addr = resolve_addr(config, bind.as_deref(), port)?;
    agent::serve(config, addr).await
}

/// `--bind` replaces the IP of `listen`, `--port` its port.
fn resolve_addr(config: &AgentConfig, bind: Option<&str>, port: Option<u16>) -> Result<SocketAddr> {
    let mut addr = config.listen_addr()?;

    if let Some(bind) = bind {
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| FleetError::Config(format!("Invalid bind address '{}': {}", bind, e)))?;
        addr.set_ip(ip);
    }
    if let Some(port) = port {
        addr.set_port(port);
    }

    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;

    #[test]
    fn test_resolve_addr_defaults_to_listen() {
        let addr = resolve_addr(&sample(), None, None).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_resolve_addr_overrides() {
        let addr = resolve_addr(&sample(), Some("0.0.0.0"), Some(9000)).unwrap();
        assert_eq!(addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn test_resolve_addr_rejects_bad_bind() {
        let err = resolve_addr(&sample(), Some("not-an-ip"), None).unwrap_err();
        assert!(err.to_string().contains("Invalid bind address"));
    }
}
