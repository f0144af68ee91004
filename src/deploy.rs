//! Resource-gated file deployment.
//!
//! resource check -> backup -> write -> (restart -> settle -> verify).
//! The first blocking failure ends the run; a failed backup never blocks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::executor::Execute;
use crate::registry::HostRegistry;
use crate::resources::{check_resources, ResourceSnapshot};
use crate::supervisor::{probe_status, ServiceManager};

/// Wait between issuing a restart and probing the service.
pub const RESTART_SETTLE: Duration = Duration::from_millis(2000);

/// Request body for `POST /agent/deploy`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    #[serde(rename = "vm", alias = "host", default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default = "default_true")]
    pub restart: bool,
}

fn default_true() -> bool {
    true
}

impl DeployRequest {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.path.is_empty() || self.content.is_empty() {
            return Err(FleetError::Validation("vm, path, content required".to_string()));
        }
        if !self.path.starts_with('/') {
            return Err(FleetError::Validation(format!(
                "path must be absolute: {}",
                self.path
            )));
        }
        Ok(())
    }

    fn restart_target(&self) -> Option<&str> {
        self.service
            .as_deref()
            .filter(|s| self.restart && !s.is_empty())
    }
}

/// Where the pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    Resources,
    Write,
    RestartFailed,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub success: bool,
    pub step: DeployStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_output: Option<String>,
}

impl DeployOutcome {
    fn stopped(step: DeployStep, error: Option<String>) -> Self {
        Self {
            success: false,
            step,
            error,
            resources: None,
            deployed: None,
            service: None,
            status: None,
            restart_output: None,
        }
    }

    fn complete(path: &str) -> Self {
        Self {
            success: true,
            step: DeployStep::Complete,
            deployed: Some(path.to_string()),
            ..Self::stopped(DeployStep::Complete, None)
        }
    }
}

/// `cp` the current file to `<path>.bak`; a missing file is not an error.
pub fn backup_command(path: &str) -> String {
    format!("cp \"{p}\" \"{p}.bak\" 2>/dev/null || true", p = path)
}

/// Here-document write into a sibling temp file, renamed over `path` once
/// complete. The quoted delimiter disables expansion inside the content.
pub fn write_command(path: &str, content: &str) -> String {
    let delimiter = heredoc_delimiter(content);
    format!(
        "cat > \"{p}.deploy-tmp\" << '{d}' && mv -f \"{p}.deploy-tmp\" \"{p}\"\n{c}\n{d}",
        p = path,
        d = delimiter,
        c = content
    )
}

fn heredoc_delimiter(content: &str) -> String {
    loop {
        let candidate = format!("FLEET_EOF_{}", uuid::Uuid::new_v4().simple());
        if !content.contains(&candidate) {
            return candidate;
        }
    }
}

pub struct DeployPipeline<'a> {
    exec: &'a dyn Execute,
    registry: &'a HostRegistry,
}

impl<'a> DeployPipeline<'a> {
    pub fn new(exec: &'a dyn Execute, registry: &'a HostRegistry) -> Self {
        Self { exec, registry }
    }

    /// Run the pipeline. Only an unknown host is an `Err`; every other
    /// failure is reported in the outcome.
    pub async fn run(&self, req: &DeployRequest) -> Result<DeployOutcome> {
        let host = self.registry.lookup(&req.host)?;

        let resources = check_resources(self.exec, &host.key).await;
        if !resources.ok {
            tracing::warn!(host = %host.key, path = %req.path, "deploy blocked: {}", resources.message);
            return Ok(DeployOutcome {
                resources: Some(resources.clone()),
                ..DeployOutcome::stopped(DeployStep::Resources, Some(resources.message))
            });
        }

        let backup = self.exec.execute(&host.key, &backup_command(&req.path)).await;
        if !backup.success {
            tracing::debug!(host = %host.key, "backup skipped: {:?}", backup.error);
        }

        let write = self
            .exec
            .execute(&host.key, &write_command(&req.path, &req.content))
            .await;
        if !write.success {
            tracing::warn!(host = %host.key, path = %req.path, "deploy write failed");
            return Ok(DeployOutcome::stopped(DeployStep::Write, write.error));
        }
        tracing::info!(host = %host.key, path = %req.path, bytes = req.content.len(), "deployed");

        let Some(service) = req.restart_target() else {
            return Ok(DeployOutcome::complete(&req.path));
        };

        let manager = ServiceManager::for_service(self.registry, host, service);
        let restart = self
            .exec
            .execute(&host.key, &manager.restart_command(service))
            .await;

        tokio::time::sleep(RESTART_SETTLE).await;
        let probe = probe_status(self.exec, host, manager, service).await;

        let step = if probe.healthy {
            DeployStep::Complete
        } else {
            DeployStep::RestartFailed
        };
        tracing::info!(host = %host.key, service, ?step, status = %probe.status, "restart verified");

        Ok(DeployOutcome {
            success: probe.healthy,
            step,
            error: None,
            resources: None,
            deployed: Some(req.path.clone()),
            service: Some(service.to_string()),
            status: Some(probe.status),
            restart_output: Some(restart.output),
        })
    }
}
