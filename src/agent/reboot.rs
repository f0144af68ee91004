//! Reboot planning for `/agent/reboot/:target`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::executor::Execute;
use crate::registry::{Host, HostRegistry};

/// Delay between answering a self-reboot request and issuing the reboot, so
/// the response leaves the socket first.
pub const REBOOT_GRACE: Duration = Duration::from_secs(1);

pub const SELF_REBOOT_COMMAND: &str = "sudo reboot";

#[derive(Debug, Clone, PartialEq)]
pub enum RebootPlan<'a> {
    /// The agent's own machine; rebooted after the response is sent.
    SelfReboot { host: &'a Host },
    /// Run `command` on `via` to reboot `target`.
    Delegated {
        target: &'a Host,
        via: &'a Host,
        command: String,
    },
}

impl<'a> RebootPlan<'a> {
    /// A remote host with a `reboot_command` is rebooted by running that
    /// command on the local host (typically an out-of-band reset script).
    /// Without one it is asked to reboot itself over SSH.
    pub fn for_target(registry: &'a HostRegistry, target: &'a Host) -> Self {
        if target.is_local() {
            return RebootPlan::SelfReboot { host: target };
        }

        match (&target.reboot_command, registry.local()) {
            (Some(command), Some(local)) => RebootPlan::Delegated {
                target,
                via: local,
                command: format!("{} 2>&1", command),
            },
            _ => RebootPlan::Delegated {
                target,
                via: target,
                command: SELF_REBOOT_COMMAND.to_string(),
            },
        }
    }
}

/// Issue the local reboot once [`REBOOT_GRACE`] has elapsed.
pub fn schedule_self_reboot(executor: Arc<dyn Execute>, host_key: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(REBOOT_GRACE).await;
        tracing::warn!(host = %host_key, "rebooting");
        let result = executor.execute(&host_key, SELF_REBOOT_COMMAND).await;
        if !result.success {
            tracing::error!(host = %host_key, "reboot failed: {:?}", result.error);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::executor::fake::FakeExecutor;

    #[test]
    fn test_local_target_reboots_self() {
        let registry = HostRegistry::from_config(&sample());
        let hub = registry.lookup("vm2").unwrap();
        assert_eq!(
            RebootPlan::for_target(&registry, hub),
            RebootPlan::SelfReboot { host: hub }
        );
    }

    #[test]
    fn test_remote_target_uses_reset_script_on_local_host() {
        let registry = HostRegistry::from_config(&sample());
        let main = registry.lookup("vm1").unwrap();

        match RebootPlan::for_target(&registry, main) {
            RebootPlan::Delegated { via, command, .. } => {
                assert_eq!(via.key, "vm2");
                assert_eq!(command, "~/reboot_vm1.sh 2>&1");
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn test_remote_target_without_script_reboots_over_ssh() {
        let mut config = sample();
        config.hosts[0].reboot_command = None;
        let registry = HostRegistry::from_config(&config);
        let main = registry.lookup("vm1").unwrap();

        match RebootPlan::for_target(&registry, main) {
            RebootPlan::Delegated { via, command, .. } => {
                assert_eq!(via.key, "vm1");
                assert_eq!(command, SELF_REBOOT_COMMAND);
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_reboot_waits_for_grace() {
        let exec = Arc::new(FakeExecutor::new());
        let handle = schedule_self_reboot(exec.clone(), "vm2".to_string());

        tokio::task::yield_now().await;
        assert_eq!(exec.count(SELF_REBOOT_COMMAND), 0);

        handle.await.unwrap();
        assert_eq!(exec.count(SELF_REBOOT_COMMAND), 1);
    }
}
