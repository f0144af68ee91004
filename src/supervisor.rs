//! Service supervision: which mechanism manages a service, and the command
//! shapes for status, restart and logs under each mechanism.

use serde::{Deserialize, Serialize};

use crate::executor::Execute;
use crate::registry::{Host, HostRegistry};

/// Substrings taken as proof that a service is running.
pub const HEALTHY_TOKENS: [&str; 2] = ["online", "active"];

/// Placeholder reported by the listing probe when a service is absent.
const NOT_FOUND: &str = "not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceManager {
    /// User-space process supervisor (pm2).
    Supervisor,
    /// OS service manager (systemd).
    OsService,
}

impl ServiceManager {
    /// On the hub, services outside the reserved prefix (and not pinned as OS
    /// services) belong to the process supervisor. Everything else is systemd.
    pub fn classify(host: &Host, service: &str, reserved_prefix: &str) -> Self {
        let pinned = host.os_services.iter().any(|s| s == service);
        if host.is_hub() && !service.starts_with(reserved_prefix) && !pinned {
            ServiceManager::Supervisor
        } else {
            ServiceManager::OsService
        }
    }

    pub fn for_service(registry: &HostRegistry, host: &Host, service: &str) -> Self {
        Self::classify(host, service, registry.reserved_prefix())
    }

    pub fn status_command(self, service: &str) -> String {
        match self {
            ServiceManager::Supervisor => format!(
                "pm2 show {s} | grep status || systemctl is-active {s}",
                s = service
            ),
            ServiceManager::OsService => format!("systemctl is-active {}", service),
        }
    }

    /// One-word status used by the service listing.
    pub fn summary_command(self, service: &str) -> String {
        match self {
            ServiceManager::Supervisor => format!(
                "pm2 show {} 2>/dev/null | grep status | awk '{{print $4}}' || echo '{}'",
                service, NOT_FOUND
            ),
            ServiceManager::OsService => format!(
                "systemctl is-active {} 2>/dev/null || echo '{}'",
                service, NOT_FOUND
            ),
        }
    }

    pub fn restart_command(self, service: &str) -> String {
        match self {
            ServiceManager::Supervisor => format!(
                "pm2 restart {s} 2>&1 || sudo systemctl restart {s}",
                s = service
            ),
            ServiceManager::OsService => format!("sudo systemctl restart {}", service),
        }
    }

    pub fn logs_command(self, service: &str, lines: usize) -> String {
        match self {
            ServiceManager::Supervisor => format!(
                "pm2 logs {s} --nostream --lines {n} 2>&1 || journalctl -u {s} -n {n} --no-pager",
                s = service,
                n = lines
            ),
            ServiceManager::OsService => {
                format!("journalctl -u {} -n {} --no-pager", service, lines)
            }
        }
    }

    /// Prints the service's working directory.
    pub fn working_dir_command(self, service: &str) -> String {
        match self {
            ServiceManager::Supervisor => format!(
                "dirname \"$(pm2 show {} | grep 'script path' | awk '{{print $5}}')\"",
                service
            ),
            ServiceManager::OsService => format!(
                "systemctl show -p WorkingDirectory --value {}",
                service
            ),
        }
    }
}

/// Normalized result of a status probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceProbe {
    pub manager: ServiceManager,
    /// Trimmed probe output; unrecognised text passes through unchanged.
    pub status: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// True when any healthy token occurs in the probe output.
///
/// This is a plain case-sensitive substring test, so `inactive` and
/// `activating` also count as healthy. Callers needing a stricter verdict
/// should read [`ServiceProbe::status`] directly.
pub fn is_healthy(output: &str) -> bool {
    HEALTHY_TOKENS.iter().any(|token| output.contains(token))
}

/// Query a service's status with the mechanism that manages it.
pub async fn probe_status(
    exec: &dyn Execute,
    host: &Host,
    manager: ServiceManager,
    service: &str,
) -> ServiceProbe {
    let result = exec
        .execute(&host.key, &manager.status_command(service))
        .await;
    let status = result.output.trim().to_string();

    ServiceProbe {
        manager,
        healthy: is_healthy(&status),
        status,
        error: result.error,
    }
}

/// One row of the per-host service listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: String,
}

/// Status of every registered service on `host`, in registry order.
pub async fn list_services(
    exec: &dyn Execute,
    registry: &HostRegistry,
    host: &Host,
) -> Vec<ServiceStatus> {
    let probes = host.services.iter().map(|service| async move {
        let manager = ServiceManager::for_service(registry, host, service);
        let result = exec
            .execute(&host.key, &manager.summary_command(service))
            .await;
        let status = result.output.trim();
        ServiceStatus {
            name: service.clone(),
            status: if status.is_empty() {
                "unknown".to_string()
            } else {
                status.to_string()
            },
        }
    });

    futures::future::join_all(probes).await
}
