//! Signal Sources
//!
//! The trigger layer observes the host through this seam: a metrics
//! snapshot, systemd unit state, and a cursor-based journal reader. The
//! production implementation shells out to systemd and reads sysinfo; tests
//! substitute scripted sources.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::debug;

/// Point-in-time view of host resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_avg_1min: f64,
    pub load_avg_5min: f64,
    pub load_avg_15min: f64,
    pub load_per_cpu: f64,
}

/// State of a systemd unit, as reported by `systemctl is-active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub unit: String,
    pub active_state: String,
}

impl UnitStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.active_state.as_str(), "active" | "activating")
    }
}

/// One journal record, already narrowed to the fields the trigger layer uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Syslog priority, 0 (emerg) through 7 (debug).
    pub priority: u8,
    pub unit: String,
    pub message: String,
}

/// A batch of records strictly after the given cursor.
#[derive(Debug, Clone, Default)]
pub struct JournalBatch {
    pub new_cursor: Option<String>,
    pub records: Vec<JournalRecord>,
}

/// Abstract host observation surface.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot>;

    /// Current state of a unit, or `None` when the unit does not exist on
    /// this host.
    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>>;

    /// Records strictly after `cursor`. On first run (`None`) the source
    /// yields roughly the last five minutes.
    async fn journal_after(&self, cursor: Option<&str>) -> Result<JournalBatch>;
}

/// Production source: sysinfo for resources, systemctl/journalctl for the
/// rest.
pub struct SystemdSignalSource {
    root_mount: String,
}

impl SystemdSignalSource {
    pub fn new() -> Self {
        Self {
            root_mount: "/".to_string(),
        }
    }
}

impl Default for SystemdSignalSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalSource for SystemdSignalSource {
    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let root_mount = self.root_mount.clone();
        // sysinfo needs two CPU refreshes separated by a short interval for
        // a meaningful usage figure.
        let snapshot = tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_cpu_usage();
            std::thread::sleep(Duration::from_millis(200));
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let cpu_percent = sys.global_cpu_usage() as f64;
            let memory_percent = if sys.total_memory() > 0 {
                (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0
            } else {
                0.0
            };

            let disks = Disks::new_with_refreshed_list();
            let disk_percent = disks
                .iter()
                .find(|d| d.mount_point().to_string_lossy() == root_mount)
                .map(|d| {
                    let total = d.total_space();
                    if total > 0 {
                        ((total - d.available_space()) as f64 / total as f64) * 100.0
                    } else {
                        0.0
                    }
                })
                .unwrap_or(0.0);

            let load = System::load_average();
            let cpu_count = sys.cpus().len().max(1) as f64;

            MetricsSnapshot {
                cpu_percent,
                memory_percent,
                disk_percent,
                load_avg_1min: load.one,
                load_avg_5min: load.five,
                load_avg_15min: load.fifteen,
                load_per_cpu: load.one / cpu_count,
            }
        })
        .await
        .context("metrics snapshot task failed")?;

        Ok(snapshot)
    }

    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>> {
        let service = if unit.ends_with(".service") {
            unit.to_string()
        } else {
            format!("{}.service", unit)
        };

        let listed = run_command(
            "systemctl",
            &["list-unit-files", &service],
            Duration::from_secs(5),
        )
        .await?;
        if !listed.stdout.contains(&service) {
            return Ok(None);
        }

        let status = run_command("systemctl", &["is-active", unit], Duration::from_secs(5)).await?;
        Ok(Some(UnitStatus {
            unit: unit.to_string(),
            active_state: status.stdout.trim().to_string(),
        }))
    }

    async fn journal_after(&self, cursor: Option<&str>) -> Result<JournalBatch> {
        let mut args: Vec<String> = vec![
            "-n".into(),
            "100".into(),
            "--output=json".into(),
            "--no-pager".into(),
        ];
        match cursor {
            Some(c) => {
                args.push("--after-cursor".into());
                args.push(c.to_string());
            }
            None => {
                args.push("--since".into());
                args.push("5 minutes ago".into());
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = run_command("journalctl", &arg_refs, Duration::from_secs(10)).await?;

        let mut batch = JournalBatch::default();
        for line in output.stdout.lines() {
            let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if let Some(cursor) = entry.get("__CURSOR").and_then(|c| c.as_str()) {
                batch.new_cursor = Some(cursor.to_string());
            }
            let priority = entry
                .get("PRIORITY")
                .and_then(|p| p.as_str())
                .and_then(|p| p.parse::<u8>().ok())
                .unwrap_or(6);
            batch.records.push(JournalRecord {
                priority,
                unit: entry
                    .get("SYSLOG_IDENTIFIER")
                    .and_then(|u| u.as_str())
                    .unwrap_or("")
                    .to_string(),
                message: entry
                    .get("MESSAGE")
                    .and_then(|m| m.as_str())
                    .unwrap_or("")
                    .to_string(),
            });
        }

        debug!("journal_after: {} records", batch.records.len());
        Ok(batch)
    }
}

/// Output of a probe command.
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .with_context(|| format!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("failed to spawn {}", program))?;

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Best-effort System Activity Report probe. Entirely optional: when the
/// sysstat tools are not installed the context window simply omits the
/// section.
pub struct SarProbe;

impl SarProbe {
    pub async fn available() -> bool {
        run_command("which", &["sar"], Duration::from_secs(5))
            .await
            .map(|o| o.status == 0)
            .unwrap_or(false)
    }

    /// One-shot CPU and memory snapshot formatted for the context window.
    pub async fn snapshot() -> Option<String> {
        let cpu = run_command("sar", &["-u", "1", "1"], Duration::from_secs(15))
            .await
            .ok()?;
        if cpu.status != 0 {
            return None;
        }
        let mem = run_command("sar", &["-r", "1", "1"], Duration::from_secs(15))
            .await
            .ok();

        let mut lines = vec!["System Activity Report (snapshot):".to_string(), String::new()];
        lines.push(crate::utils::truncate_middle(cpu.stdout.trim(), 1200));
        if let Some(mem) = mem {
            if mem.status == 0 {
                lines.push(String::new());
                lines.push(crate::utils::truncate_middle(mem.stdout.trim(), 1200));
            }
        }
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_status_health() {
        let active = UnitStatus {
            unit: "nginx".into(),
            active_state: "active".into(),
        };
        let failed = UnitStatus {
            unit: "nginx".into(),
            active_state: "failed".into(),
        };
        let activating = UnitStatus {
            unit: "nginx".into(),
            active_state: "activating".into(),
        };
        assert!(active.is_healthy());
        assert!(activating.is_healthy());
        assert!(!failed.is_healthy());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let out = run_command("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        assert!(
            run_command("definitely-not-a-command-xyz", &[], Duration::from_secs(5))
                .await
                .is_err()
        );
    }
}
