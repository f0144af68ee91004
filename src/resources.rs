//! Pre-deploy resource gate.
//!
//! Samples disk usage, available memory and load on a host with three shell
//! probes and turns them into a go/no-go verdict. Nothing is cached.

use serde::{Deserialize, Serialize};

use crate::executor::Execute;

/// Root filesystem usage, integer percent.
pub const DISK_PROBE: &str = "df / | tail -1 | awk '{print int($5)}'";
/// Available memory as an integer percent of total.
pub const MEMORY_PROBE: &str = "free -m | grep Mem | awk '{print int($7/$2*100)}'";
/// One-minute load average.
pub const LOAD_PROBE: &str = "cat /proc/loadavg | cut -d' ' -f1";

/// Deploys are refused at or above this disk usage.
pub const DISK_USAGE_LIMIT: i64 = 90;
/// Deploys are refused at or below this free-memory percentage.
pub const MEMORY_FREE_FLOOR: i64 = 10;
/// Load at or above this is flagged, but never blocks.
pub const LOAD_WARN: f64 = 4.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStatus {
    pub usage: i64,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub free: i64,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatus {
    pub value: f64,
    pub ok: bool,
}

/// One sample of host resources and the resulting verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub ok: bool,
    pub disk: DiskStatus,
    pub memory: MemoryStatus,
    pub load: LoadStatus,
    pub message: String,
}

impl ResourceSnapshot {
    /// Compute the verdict. Load never affects `ok`.
    pub fn evaluate(disk_usage: i64, mem_free: i64, load: f64) -> Self {
        let disk_ok = disk_usage < DISK_USAGE_LIMIT;
        let mem_ok = mem_free > MEMORY_FREE_FLOOR;
        let load_ok = load < LOAD_WARN;

        let message = if !disk_ok {
            "Disk full!"
        } else if !mem_ok {
            "Memory low!"
        } else {
            "Resources OK"
        };

        Self {
            ok: disk_ok && mem_ok,
            disk: DiskStatus {
                usage: disk_usage,
                ok: disk_ok,
            },
            memory: MemoryStatus {
                free: mem_free,
                ok: mem_ok,
            },
            load: LoadStatus {
                value: load,
                ok: load_ok,
            },
            message: message.to_string(),
        }
    }
}

/// Run the three probes on `host_key` and evaluate them.
///
/// Failed or non-numeric probes count as zero.
pub async fn check_resources(exec: &dyn Execute, host_key: &str) -> ResourceSnapshot {
    let disk = exec.execute(host_key, DISK_PROBE).await;
    let memory = exec.execute(host_key, MEMORY_PROBE).await;
    let load = exec.execute(host_key, LOAD_PROBE).await;

    let snapshot = ResourceSnapshot::evaluate(
        parse_leading_int(&disk.output),
        parse_leading_int(&memory.output),
        parse_leading_float(&load.output),
    );

    tracing::info!(
        host = host_key,
        disk = snapshot.disk.usage,
        mem_free = snapshot.memory.free,
        load = snapshot.load.value,
        ok = snapshot.ok,
        "resource check"
    );

    snapshot
}

/// Integer prefix of `s` (after leading whitespace), or 0.
fn parse_leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().unwrap_or(0)
}

/// Decimal prefix of `s` (after leading whitespace), or 0.0.
fn parse_leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let mut seen_dot = false;
    let end = s
        .char_indices()
        .find(|&(i, c)| match c {
            '0'..='9' => false,
            '-' | '+' if i == 0 => false,
            '.' if !seen_dot => {
                seen_dot = true;
                false
            }
            _ => true,
        })
        .map_or(s.len(), |(i, _)| i);
    let value: f64 = s[..end].parse().unwrap_or(0.0);
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::FakeExecutor;
    use proptest::prelude::*;

    #[test]
    fn test_evaluate_ok() {
        let snapshot = ResourceSnapshot::evaluate(40, 55, 0.3);
        assert!(snapshot.ok);
        assert_eq!(snapshot.message, "Resources OK");
    }

    #[test]
    fn test_evaluate_disk_checked_before_memory() {
        let snapshot = ResourceSnapshot::evaluate(95, 5, 0.3);
        assert!(!snapshot.ok);
        assert!(!snapshot.disk.ok);
        assert!(!snapshot.memory.ok);
        assert_eq!(snapshot.message, "Disk full!");
    }

    #[test]
    fn test_evaluate_boundaries() {
        assert!(!ResourceSnapshot::evaluate(90, 50, 0.0).ok);
        assert!(ResourceSnapshot::evaluate(89, 50, 0.0).ok);
        assert!(!ResourceSnapshot::evaluate(10, 10, 0.0).ok);
        assert_eq!(ResourceSnapshot::evaluate(10, 10, 0.0).message, "Memory low!");
        assert!(ResourceSnapshot::evaluate(10, 11, 0.0).ok);
    }

    #[test]
    fn test_high_load_only_annotates() {
        let snapshot = ResourceSnapshot::evaluate(10, 50, 12.5);
        assert!(snapshot.ok);
        assert!(!snapshot.load.ok);
    }

    #[test]
    fn test_parse_leading_int() {
        assert_eq!(parse_leading_int("87"), 87);
        assert_eq!(parse_leading_int("  42\n"), 42);
        assert_eq!(parse_leading_int("87%"), 87);
        assert_eq!(parse_leading_int("-3"), -3);
        assert_eq!(parse_leading_int("abc"), 0);
        assert_eq!(parse_leading_int(""), 0);
    }

    #[test]
    fn test_parse_leading_float() {
        assert_eq!(parse_leading_float("0.52"), 0.52);
        assert_eq!(parse_leading_float("1.25 0.9 0.8"), 1.25);
        assert_eq!(parse_leading_float("3"), 3.0);
        assert_eq!(parse_leading_float("n/a"), 0.0);
    }

    #[tokio::test]
    async fn test_check_resources_parses_probes() {
        let exec = FakeExecutor::new()
            .on("df /", "95")
            .on("free -m", "40")
            .on("loadavg", "0.75");

        let snapshot = check_resources(&exec, "vm1").await;
        assert!(!snapshot.ok);
        assert_eq!(snapshot.disk.usage, 95);
        assert_eq!(snapshot.memory.free, 40);
        assert_eq!(snapshot.load.value, 0.75);
        assert_eq!(snapshot.message, "Disk full!");
        assert_eq!(exec.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_check_resources_failed_probes_default_to_zero() {
        let exec = FakeExecutor::new()
            .fail_on("df /", "ssh down")
            .fail_on("free -m", "ssh down")
            .fail_on("loadavg", "ssh down");

        let snapshot = check_resources(&exec, "vm1").await;
        assert_eq!(snapshot.disk.usage, 0);
        assert_eq!(snapshot.memory.free, 0);
        assert!(!snapshot.ok);
        assert_eq!(snapshot.message, "Memory low!");
    }

    proptest! {
        /// The verdict depends on disk and memory only.
        #[test]
        fn prop_ok_iff_disk_and_memory(disk in -10i64..200, mem in -10i64..200, load in 0.0f64..64.0) {
            let snapshot = ResourceSnapshot::evaluate(disk, mem, load);
            prop_assert_eq!(snapshot.ok, disk < 90 && mem > 10);
            prop_assert_eq!(snapshot.load.ok, load < 4.0);
        }

        #[test]
        fn prop_message_names_first_failure(disk in 0i64..100, mem in 0i64..100) {
            let snapshot = ResourceSnapshot::evaluate(disk, mem, 0.0);
            let expected = if disk >= 90 { "Disk full!" } else if mem <= 10 { "Memory low!" } else { "Resources OK" };
            prop_assert_eq!(snapshot.message.as_str(), expected);
        }
    }
}
