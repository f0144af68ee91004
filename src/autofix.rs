//! Bounded log-driven repair loop.
//!
//! Each attempt reads the service's recent log, picks at most one [`Remedy`]
//! from a fixed rule table, applies it, restarts the service and re-probes.
//! The loop ends on the first healthy probe or after `max_retries` attempts.

use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::executor::Execute;
use crate::registry::{Host, HostRegistry};
use crate::supervisor::{probe_status, ServiceManager};

/// Wait between restarting a service and probing it.
pub const FIX_SETTLE: Duration = Duration::from_millis(3000);
/// Log lines inspected per attempt.
pub const LOG_LINES: usize = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// One shell action addressing a known failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remedy {
    /// Kill whatever holds the TCP port.
    FreePort { port: u16 },
    /// `npm install` the module in the service's working directory.
    InstallModule { module: String },
    /// Copy the newest `*.bak` back over its original name.
    RestoreBackup,
}

impl Remedy {
    pub fn command(&self, manager: ServiceManager, service: &str) -> String {
        match self {
            Remedy::FreePort { port } => format!("fuser -k {}/tcp 2>/dev/null || true", port),
            Remedy::InstallModule { module } => format!(
                "cd \"$({})\" && npm install {}",
                manager.working_dir_command(service),
                module
            ),
            Remedy::RestoreBackup => format!(
                "cd \"$({})\" 2>/dev/null; f=$(ls -t *.bak 2>/dev/null | head -1); \
                 [ -n \"$f\" ] && cp \"$f\" \"${{f%.bak}}\" || true",
                manager.working_dir_command(service)
            ),
        }
    }
}

struct Rule {
    markers: &'static [&'static str],
    build: fn(&str) -> Option<Remedy>,
}

impl Rule {
    fn matches(&self, log: &str) -> bool {
        self.markers.iter().any(|m| log.contains(m))
    }
}

/// Evaluated in order; the first rule whose markers appear owns the log, even
/// when its builder cannot extract a remedy.
const RULES: &[Rule] = &[
    Rule {
        markers: &["EADDRINUSE", "Address already in use"],
        build: port_in_use,
    },
    Rule {
        markers: &["Cannot find module", "MODULE_NOT_FOUND"],
        build: missing_module,
    },
    Rule {
        markers: &["ENOENT", "no such file"],
        build: missing_file,
    },
];

static PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)port\s*(\d+)").expect("valid regex")
});

static MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"Cannot find module '([^']+)'").expect("valid regex")
});

fn port_in_use(log: &str) -> Option<Remedy> {
    let port = PORT_RE.captures(log)?.get(1)?.as_str().parse().ok()?;
    Some(Remedy::FreePort { port })
}

fn missing_module(log: &str) -> Option<Remedy> {
    let module = MODULE_RE.captures(log)?.get(1)?.as_str().to_string();
    Some(Remedy::InstallModule { module })
}

fn missing_file(_log: &str) -> Option<Remedy> {
    Some(Remedy::RestoreBackup)
}

/// Pick the remedy for a block of log text, if any rule applies.
pub fn classify(log: &str) -> Option<Remedy> {
    RULES
        .iter()
        .find(|rule| rule.matches(log))
        .and_then(|rule| (rule.build)(log))
}

/// Request body for `POST /agent/fix`.
#[derive(Debug, Clone, Deserialize)]
pub struct FixRequest {
    #[serde(rename = "vm", alias = "host", default)]
    pub host: String,
    #[serde(default)]
    pub service: String,
    #[serde(alias = "maxRetries", default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl FixRequest {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.service.is_empty() {
            return Err(FleetError::Validation("vm and service required".to_string()));
        }
        if !(1..=MAX_RETRIES_LIMIT).contains(&self.max_retries) {
            return Err(FleetError::Validation(format!(
                "max_retries must be between 1 and {}",
                MAX_RETRIES_LIMIT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixState {
    Attempting(u32),
    Fixed,
    Exhausted,
}

impl FixState {
    fn next(self, healthy: bool, max_retries: u32) -> Self {
        match self {
            FixState::Attempting(_) if healthy => FixState::Fixed,
            FixState::Attempting(i) if i >= max_retries => FixState::Exhausted,
            FixState::Attempting(i) => FixState::Attempting(i + 1),
            terminal => terminal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixAttempt {
    pub attempt: u32,
    pub remedy: Option<Remedy>,
    pub fix_action: Option<String>,
    pub status: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub success: bool,
    pub message: String,
    pub attempts: Vec<FixAttempt>,
}

pub struct AutoFix<'a> {
    exec: &'a dyn Execute,
    registry: &'a HostRegistry,
}

impl<'a> AutoFix<'a> {
    pub fn new(exec: &'a dyn Execute, registry: &'a HostRegistry) -> Self {
        Self { exec, registry }
    }

    /// Run the repair loop. Only an unknown host is an `Err`.
    ///
    /// A `max_retries` of zero makes no attempts.
    pub async fn run(&self, host_key: &str, service: &str, max_retries: u32) -> Result<FixOutcome> {
        let host = self.registry.lookup(host_key)?;
        if max_retries == 0 {
            return Ok(FixOutcome {
                success: false,
                message: "Failed after 0 attempts".to_string(),
                attempts: Vec::new(),
            });
        }
        let manager = ServiceManager::for_service(self.registry, host, service);

        let mut attempts = Vec::new();
        let mut state = FixState::Attempting(1);

        while let FixState::Attempting(i) = state {
            let attempt = self.attempt(host, manager, service, i).await;
            state = state.next(attempt.success, max_retries);
            tracing::info!(
                host = %host.key,
                service,
                attempt = i,
                remedy = ?attempt.remedy,
                ?state,
                "fix attempt"
            );
            attempts.push(attempt);
        }

        let outcome = match state {
            FixState::Fixed => FixOutcome {
                success: true,
                message: format!("Fixed after {} attempt(s)", attempts.len()),
                attempts,
            },
            _ => FixOutcome {
                success: false,
                message: format!("Failed after {} attempts", max_retries),
                attempts,
            },
        };
        Ok(outcome)
    }

    async fn attempt(
        &self,
        host: &Host,
        manager: ServiceManager,
        service: &str,
        attempt: u32,
    ) -> FixAttempt {
        let logs = self
            .exec
            .execute(&host.key, &manager.logs_command(service, LOG_LINES))
            .await;

        let remedy = classify(&logs.output);
        let fix_action = remedy.as_ref().map(|r| r.command(manager, service));

        if let Some(action) = &fix_action {
            let applied = self.exec.execute(&host.key, action).await;
            if !applied.success {
                tracing::debug!(host = %host.key, service, "remedy failed: {:?}", applied.error);
            }
        }

        self.exec
            .execute(&host.key, &manager.restart_command(service))
            .await;
        tokio::time::sleep(FIX_SETTLE).await;

        let probe = probe_status(self.exec, host, manager, service).await;
        FixAttempt {
            attempt,
            remedy,
            fix_action,
            success: probe.healthy,
            status: probe.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::executor::fake::FakeExecutor;
    use proptest::prelude::*;

    #[test]
    fn test_classify_port_in_use() {
        let log = "Error: listen EADDRINUSE: address already in use\n  port 3000 busy";
        assert_eq!(classify(log), Some(Remedy::FreePort { port: 3000 }));
    }

    #[test]
    fn test_classify_port_marker_without_port_yields_nothing() {
        assert_eq!(classify("Address already in use :::"), None);
        assert_eq!(classify("EADDRINUSE port 99999"), None);
    }

    #[test]
    fn test_classify_precedence_port_beats_module() {
        let log = "Error: Cannot find module 'express'\nEADDRINUSE on port 8080";
        assert_eq!(classify(log), Some(Remedy::FreePort { port: 8080 }));
    }

    #[test]
    fn test_classify_missing_module() {
        let log = "Error: Cannot find module 'dotenv'\nRequire stack:\n- /srv/app/index.js";
        assert_eq!(
            classify(log),
            Some(Remedy::InstallModule {
                module: "dotenv".to_string()
            })
        );
        assert_eq!(classify("code: 'MODULE_NOT_FOUND'"), None);
    }

    #[test]
    fn test_classify_missing_file() {
        assert_eq!(
            classify("ENOENT: no such file or directory, open 'config.json'"),
            Some(Remedy::RestoreBackup)
        );
        assert_eq!(classify("cat: x: no such file"), Some(Remedy::RestoreBackup));
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify("Segmentation fault (core dumped)"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_remedy_commands() {
        assert_eq!(
            Remedy::FreePort { port: 3000 }.command(ServiceManager::Supervisor, "jarvis"),
            "fuser -k 3000/tcp 2>/dev/null || true"
        );

        let install = Remedy::InstallModule {
            module: "dotenv".to_string(),
        }
        .command(ServiceManager::Supervisor, "jarvis");
        assert!(install.starts_with("cd \"$(dirname"));
        assert!(install.contains("pm2 show jarvis"));
        assert!(install.ends_with("&& npm install dotenv"));

        let restore = Remedy::RestoreBackup.command(ServiceManager::OsService, "grok-voice");
        assert!(restore.contains("WorkingDirectory --value grok-voice"));
        assert!(restore.contains("cp \"$f\" \"${f%.bak}\""));
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(FixState::Attempting(1).next(true, 3), FixState::Fixed);
        assert_eq!(FixState::Attempting(1).next(false, 3), FixState::Attempting(2));
        assert_eq!(FixState::Attempting(3).next(false, 3), FixState::Exhausted);
        assert_eq!(FixState::Fixed.next(false, 3), FixState::Fixed);
        assert_eq!(FixState::Exhausted.next(true, 3), FixState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_exhausts_retries() {
        let registry = HostRegistry::from_config(&sample());
        let exec = FakeExecutor::new()
            .on("journalctl", "grok-voice.service: Main process exited, status=1")
            .on("systemctl is-active", "failed");

        let outcome = AutoFix::new(&exec, &registry)
            .run("vm1", "grok-voice", 3)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.message, "Failed after 3 attempts");
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts.iter().all(|a| a.remedy.is_none()));
        assert_eq!(exec.count("sudo systemctl restart grok-voice"), 3);
        assert_eq!(
            outcome.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_healthy_probe() {
        let registry = HostRegistry::from_config(&sample());
        let exec = FakeExecutor::new()
            .on("pm2 logs", "Error: listen EADDRINUSE: address already in use port 3000")
            .on_sequence("pm2 show todo-api | grep status", &["│ status │ errored │", "│ status │ online │"]);

        let outcome = AutoFix::new(&exec, &registry)
            .run("vm2", "todo-api", 5)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.message, "Fixed after 2 attempt(s)");
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
        assert_eq!(
            outcome.attempts[0].fix_action.as_deref(),
            Some("fuser -k 3000/tcp 2>/dev/null || true")
        );
        assert_eq!(exec.count("pm2 restart todo-api"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remedy_runs_before_restart_and_failure_is_not_fatal() {
        let registry = HostRegistry::from_config(&sample());
        let exec = FakeExecutor::new()
            .on("journalctl", "ENOENT: no such file or directory")
            .fail_on("ls -t *.bak", "permission denied")
            .on("systemctl is-active", "active");

        let outcome = AutoFix::new(&exec, &registry)
            .run("vm1", "grok-voice", 3)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].remedy, Some(Remedy::RestoreBackup));

        let calls = exec.calls();
        let remedy = calls.iter().position(|c| c.contains("ls -t *.bak")).unwrap();
        let restart = calls.iter().position(|c| c.contains("systemctl restart")).unwrap();
        assert!(remedy < restart);
    }

    #[tokio::test]
    async fn test_zero_retries_makes_no_attempts() {
        let registry = HostRegistry::from_config(&sample());
        let exec = FakeExecutor::new().on("systemctl is-active", "active");

        let outcome = AutoFix::new(&exec, &registry)
            .run("vm1", "grok-voice", 0)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.attempts.is_empty());
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_patterns_compile() {
        assert!(PORT_RE.is_match("listening on PORT 80"));
        assert!(MODULE_RE.is_match("Error: Cannot find module 'x'"));
    }

    #[tokio::test]
    async fn test_unknown_host_is_error() {
        let registry = HostRegistry::from_config(&sample());
        let exec = FakeExecutor::new();
        let err = AutoFix::new(&exec, &registry)
            .run("vm7", "jarvis", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownHost(_)));
    }

    #[test]
    fn test_fix_request_validation() {
        let req: FixRequest =
            serde_json::from_str(r#"{"vm":"vm2","service":"jarvis"}"#).unwrap();
        assert_eq!(req.max_retries, 3);
        assert!(req.validate().is_ok());

        let req: FixRequest =
            serde_json::from_str(r#"{"vm":"vm2","service":"jarvis","maxRetries":0}"#).unwrap();
        assert!(req.validate().is_err());

        let req: FixRequest =
            serde_json::from_str(r#"{"vm":"vm2","service":"jarvis","max_retries":11}"#).unwrap();
        assert!(req.validate().is_err());

        let req: FixRequest = serde_json::from_str(r#"{"vm":"vm2"}"#).unwrap();
        assert_eq!(req.validate().unwrap_err().to_string(), "vm and service required");
    }

    proptest! {
        /// Attempts made is min(first healthy attempt, max_retries).
        #[test]
        fn prop_attempt_count(max_retries in 1u32..=10, first_healthy in 1u32..=15) {
            let mut state = FixState::Attempting(1);
            let mut made = 0;
            while let FixState::Attempting(i) = state {
                made += 1;
                state = state.next(i == first_healthy, max_retries);
            }
            prop_assert_eq!(made, first_healthy.min(max_retries));
            prop_assert_eq!(state == FixState::Fixed, first_healthy <= max_retries);
        }
    }
}
