//! Safety-Gated Action Executor
//!
//! Gates proposals by autonomy level and risk, dispatches approved ones
//! through per-action-type handlers, archives outcomes, and owns the
//! approval queue. All host interaction goes through the `HostRunner` seam.

mod approval;

pub use approval::{jaccard_similarity, ApprovalEntry, ApprovalQueue, Decision, DEDUP_THRESHOLD};

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::safety::{investigation_allowed, is_protected_unit};
use crate::signals::{run_command, CommandOutput};

/// Ceiling on what may run without human consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyLevel {
    Observe,
    Suggest,
    AutoSafe,
    AutoFull,
}

impl std::str::FromStr for AutonomyLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "observe" => Ok(AutonomyLevel::Observe),
            "suggest" => Ok(AutonomyLevel::Suggest),
            "auto-safe" => Ok(AutonomyLevel::AutoSafe),
            "auto-full" => Ok(AutonomyLevel::AutoFull),
            other => anyhow::bail!("unknown autonomy level: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SystemdRestart,
    Cleanup,
    NixRebuild,
    ConfigChange,
    Investigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub file: String,
    pub change: String,
}

/// A structured remediation produced by review or meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default)]
    pub proposed_action: String,
    pub action_type: ActionType,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub config_changes: Option<ConfigChange>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub rollback_plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Dispatched,
    QueuedForApproval,
    Blocked,
    DryRun,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub executed: bool,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ExecutionResult {
    fn new(status: ExecutionStatus, executed: bool, output: impl Into<String>) -> Self {
        Self {
            executed,
            status,
            success: None,
            output: output.into(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// What the gate decided for a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Auto,
    Queue,
    Block,
}

/// The autonomy ladder. `high` risk is never auto-executed.
pub fn gate(level: AutonomyLevel, action_type: ActionType, risk: RiskLevel) -> (GateDecision, &'static str) {
    if level == AutonomyLevel::Observe {
        return (GateDecision::Block, "autonomy level set to observe-only");
    }
    if risk == RiskLevel::High {
        return (GateDecision::Queue, "high risk actions always require approval");
    }

    match level {
        AutonomyLevel::Observe => unreachable!(),
        AutonomyLevel::Suggest => {
            if action_type == ActionType::Investigation && risk == RiskLevel::Low {
                (GateDecision::Auto, "auto-approved: low-risk information gathering")
            } else {
                (GateDecision::Queue, "autonomy level requires manual approval")
            }
        }
        AutonomyLevel::AutoSafe => {
            if risk == RiskLevel::Low {
                (GateDecision::Auto, "auto-executing safe action")
            } else {
                (GateDecision::Queue, "action requires higher autonomy level")
            }
        }
        AutonomyLevel::AutoFull => (GateDecision::Auto, "auto-executing approved action"),
    }
}

/// Seam for host commands, so the gate and handlers are observable in
/// tests without touching the service manager.
#[async_trait]
pub trait HostRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

pub struct SystemRunner;

#[async_trait]
impl HostRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_command(program, args, timeout).await
    }

    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        run_command("sh", &["-c", command], timeout).await
    }
}

/// Entry point the executor calls after a successful action so the meta
/// layer can distill knowledge from it. Implemented by the meta layer;
/// errors are swallowed at the call site.
#[async_trait]
pub trait Reflection: Send + Sync {
    async fn reflect(&self, situation: &str, action: &str, outcome: &str) -> Result<()>;
}

/// Host-rebuild settings; the two-phase build semantics are invariant.
#[derive(Debug, Clone, Default)]
pub struct RebuildConfig {
    pub flake_ref: Option<String>,
}

pub struct Executor {
    state_dir: PathBuf,
    autonomy: AutonomyLevel,
    dry_run: bool,
    protected_units: Vec<String>,
    runner: Arc<dyn HostRunner>,
    approval: ApprovalQueue,
    rebuild: RebuildConfig,
    reflection: Option<Arc<dyn Reflection>>,
}

impl Executor {
    pub fn new(state_dir: impl Into<PathBuf>, autonomy: AutonomyLevel) -> Self {
        let state_dir = state_dir.into();
        let approval = ApprovalQueue::new(state_dir.join("approval_queue.json"));
        Self {
            state_dir,
            autonomy,
            dry_run: false,
            protected_units: crate::safety::default_protected_units(),
            runner: Arc::new(SystemRunner),
            approval,
            rebuild: RebuildConfig::default(),
            reflection: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn HostRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_protected_units(mut self, units: Vec<String>) -> Self {
        self.protected_units = units;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_rebuild(mut self, rebuild: RebuildConfig) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn with_reflection(mut self, reflection: Arc<dyn Reflection>) -> Self {
        self.reflection = Some(reflection);
        self
    }

    pub fn autonomy(&self) -> AutonomyLevel {
        self.autonomy
    }

    pub fn approval_queue(&self) -> &ApprovalQueue {
        &self.approval
    }

    /// Gate and (when permitted) execute a proposal.
    pub async fn execute(&self, proposal: Proposal, context: Value) -> ExecutionResult {
        let (decision, reason) = gate(self.autonomy, proposal.action_type, proposal.risk_level);

        let result = match decision {
            GateDecision::Block => ExecutionResult::new(ExecutionStatus::Blocked, false, reason),
            GateDecision::Queue => match self.approval.enqueue(proposal.clone(), context) {
                Ok(_admitted) => {
                    // Suppressed duplicates report the same status; the
                    // queue is simply unchanged.
                    ExecutionResult::new(ExecutionStatus::QueuedForApproval, false, reason)
                }
                Err(e) => {
                    let mut result =
                        ExecutionResult::new(ExecutionStatus::Failed, false, "could not queue");
                    result.error = Some(format!("{:#}", e));
                    result
                }
            },
            GateDecision::Auto => {
                if self.dry_run {
                    ExecutionResult::new(
                        ExecutionStatus::DryRun,
                        false,
                        "Dry run mode - no actual changes made",
                    )
                } else {
                    self.dispatch(&proposal).await
                }
            }
        };

        self.log_action(&proposal, &result);

        if result.success == Some(true) {
            self.run_reflection(&proposal, &result).await;
        }

        result
    }

    async fn run_reflection(&self, proposal: &Proposal, result: &ExecutionResult) {
        let Some(reflection) = &self.reflection else {
            return;
        };
        if let Err(e) = reflection
            .reflect(&proposal.diagnosis, &proposal.proposed_action, &result.output)
            .await
        {
            warn!("post-success reflection failed: {:#}", e);
        }
    }

    /// Run the handler for an already-approved proposal.
    async fn dispatch(&self, proposal: &Proposal) -> ExecutionResult {
        let outcome = match proposal.action_type {
            ActionType::SystemdRestart => self.restart_services(proposal).await,
            ActionType::Cleanup => self.perform_cleanup(proposal).await,
            ActionType::Investigation => self.run_investigation(proposal).await,
            ActionType::NixRebuild => self.host_rebuild().await,
            ActionType::ConfigChange => self.suggest_config_change(proposal),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                let mut result =
                    ExecutionResult::new(ExecutionStatus::Failed, true, String::new());
                result.success = Some(false);
                result.error = Some(format!("{:#}", e));
                result
            }
        }
    }

    async fn restart_services(&self, proposal: &Proposal) -> Result<ExecutionResult> {
        let mut lines = Vec::new();
        let mut any_dispatched = false;
        let mut all_ok = true;

        for command in &proposal.commands {
            let Some(unit) = command.strip_prefix("systemctl restart ") else {
                continue;
            };
            let unit = unit.trim();

            if is_protected_unit(unit, &self.protected_units) {
                lines.push(format!("BLOCKED: {} is protected", unit));
                continue;
            }

            any_dispatched = true;
            match self
                .runner
                .run("systemctl", &["restart", unit], Duration::from_secs(30))
                .await
            {
                Ok(output) if output.status == 0 => {
                    lines.push(format!("✓ Restarted {}", unit));
                }
                Ok(output) => {
                    all_ok = false;
                    lines.push(format!("✗ Failed to restart {}: {}", unit, output.stderr.trim()));
                }
                Err(e) => {
                    all_ok = false;
                    lines.push(format!("✗ Failed to restart {}: {:#}", unit, e));
                }
            }
        }

        // Every target protected (or nothing actionable): the proposal is
        // rejected in place, and the service manager was never invoked.
        if !any_dispatched {
            let mut result =
                ExecutionResult::new(ExecutionStatus::Blocked, false, lines.join("\n"));
            result.success = Some(false);
            return Ok(result);
        }

        let mut result = ExecutionResult::new(ExecutionStatus::Dispatched, true, lines.join("\n"));
        result.success = Some(all_ok);
        Ok(result)
    }

    /// Fixed cleanup sequence; partial failures never abort the rest.
    async fn perform_cleanup(&self, proposal: &Proposal) -> Result<ExecutionResult> {
        let mut lines = Vec::new();

        if proposal.proposed_action.to_lowercase().contains("nix") {
            match self
                .runner
                .run(
                    "nix-collect-garbage",
                    &["--delete-old"],
                    Duration::from_secs(300),
                )
                .await
            {
                Ok(output) => lines.push(format!("Nix cleanup: {}", output.stdout.trim())),
                Err(e) => lines.push(format!("Nix cleanup failed: {:#}", e)),
            }
        }

        match self
            .runner
            .run("journalctl", &["--vacuum-time=7d"], Duration::from_secs(60))
            .await
        {
            Ok(output) => lines.push(format!("Journal cleanup: {}", output.stdout.trim())),
            Err(e) => lines.push(format!("Journal cleanup failed: {:#}", e)),
        }

        let mut result = ExecutionResult::new(ExecutionStatus::Dispatched, true, lines.join("\n"));
        result.success = Some(true);
        Ok(result)
    }

    async fn run_investigation(&self, proposal: &Proposal) -> Result<ExecutionResult> {
        let mut lines = Vec::new();

        for command in &proposal.commands {
            if !investigation_allowed(command) {
                lines.push(format!("BLOCKED unsafe command: {}", command));
                continue;
            }

            match self.runner.run_shell(command, Duration::from_secs(30)).await {
                Ok(output) => {
                    lines.push(format!("$ {}", command));
                    lines.push(output.stdout.trim().to_string());
                }
                Err(e) => lines.push(format!("Error running {}: {:#}", command, e)),
            }
        }

        let mut result = ExecutionResult::new(ExecutionStatus::Dispatched, true, lines.join("\n"));
        result.success = Some(true);
        Ok(result)
    }

    /// Two-phase rebuild: a dry build gates the switch.
    async fn host_rebuild(&self) -> Result<ExecutionResult> {
        let mut dry_args = vec!["dry-build".to_string()];
        let mut switch_args = vec!["switch".to_string()];
        if let Some(flake) = &self.rebuild.flake_ref {
            for args in [&mut dry_args, &mut switch_args] {
                args.push("--flake".to_string());
                args.push(flake.clone());
            }
        }

        let dry_refs: Vec<&str> = dry_args.iter().map(|s| s.as_str()).collect();
        let dry = self
            .runner
            .run("nixos-rebuild", &dry_refs, Duration::from_secs(600))
            .await
            .context("dry build failed to start")?;

        if dry.status != 0 {
            let mut result = ExecutionResult::new(
                ExecutionStatus::Failed,
                true,
                format!("Dry build failed:\n{}", dry.stderr.trim()),
            );
            result.success = Some(false);
            return Ok(result);
        }

        let mut lines = vec!["✓ Dry build successful".to_string()];
        let switch_refs: Vec<&str> = switch_args.iter().map(|s| s.as_str()).collect();
        let switch = self
            .runner
            .run("nixos-rebuild", &switch_refs, Duration::from_secs(1200))
            .await
            .context("rebuild switch failed to start")?;
        lines.push(switch.stdout.trim().to_string());

        let mut result = ExecutionResult::new(ExecutionStatus::Dispatched, true, lines.join("\n"));
        result.success = Some(switch.status == 0);
        if switch.status != 0 {
            result.error = Some(switch.stderr.trim().to_string());
        }
        Ok(result)
    }

    /// Configuration is never written directly; the change is described in
    /// a patch file for manual review.
    fn suggest_config_change(&self, proposal: &Proposal) -> Result<ExecutionResult> {
        let Some(change) = &proposal.config_changes else {
            let mut result = ExecutionResult::new(
                ExecutionStatus::Failed,
                true,
                "No file specified in config_changes",
            );
            result.success = Some(false);
            return Ok(result);
        };

        let patch_path = self
            .state_dir
            .join(format!("suggested_patch_{}.txt", Utc::now().timestamp()));
        let body = format!(
            "Suggested change to {}:\n\n{}\n\nReasoning: {}",
            change.file,
            change.change,
            if proposal.reasoning.is_empty() {
                "No reasoning provided"
            } else {
                &proposal.reasoning
            }
        );
        std::fs::write(&patch_path, body)
            .with_context(|| format!("cannot write patch file {:?}", patch_path))?;

        let mut result = ExecutionResult::new(
            ExecutionStatus::Dispatched,
            true,
            format!(
                "Config change suggestion saved to {}\nThis requires manual review and application.",
                patch_path.display()
            ),
        );
        result.success = Some(true);
        Ok(result)
    }

    /// Approve a queued proposal: execute, archive, remove. The entry
    /// leaves the queue whether or not execution succeeded.
    pub async fn approve(&self, index: usize) -> Result<Option<ExecutionResult>> {
        let Some(entry) = self.approval.take(index)? else {
            return Ok(None);
        };

        let result = self.dispatch(&entry.proposal).await;
        let archive_path = self.state_dir.join("approved_actions.jsonl");
        if let Err(e) = self.approval.archive(
            &archive_path,
            &entry,
            &serde_json::to_value(&result).unwrap_or(Value::Null),
        ) {
            warn!("failed to archive approved action: {:#}", e);
        }

        self.log_action(&entry.proposal, &result);
        if result.success == Some(true) {
            self.run_reflection(&entry.proposal, &result).await;
        }
        info!("approved action {} executed: {:?}", index, result.status);
        Ok(Some(result))
    }

    pub fn reject(&self, index: usize) -> Result<bool> {
        Ok(self.approval.take(index)?.is_some())
    }

    /// One JSON line per execution.
    fn log_action(&self, proposal: &Proposal, result: &ExecutionResult) {
        let path = self.state_dir.join("actions.jsonl");
        let record = json!({
            "timestamp": result.timestamp,
            "action": proposal,
            "result": result,
        });
        let write = || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{}", record)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("could not write action log: {:#}", e);
        }
    }
}
