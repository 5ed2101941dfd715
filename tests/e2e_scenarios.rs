//! End-to-end pipeline scenarios driven through mock seams: a scripted
//! signal source, a scripted inference backend, and a recording host
//! runner. No test here touches the real host or a real model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use hostwarden::backend::{ChatOutcome, GenerateRequest, InferenceBackend, Message};
use hostwarden::config::{Config, Thresholds};
use hostwarden::context::{ContextManager, TokenCounter};
use hostwarden::event::{EventKind, Severity};
use hostwarden::executor::{
    ActionType, AutonomyLevel, ExecutionStatus, Executor, HostRunner, Proposal, RiskLevel,
};
use hostwarden::orchestrator::Orchestrator;
use hostwarden::queue::{LlmQueue, Priority, QueueStatus, QueueWorker, RequestKind};
use hostwarden::signals::{CommandOutput, JournalBatch, MetricsSnapshot, SignalSource, UnitStatus};
use hostwarden::store::TimeSeriesStore;
use hostwarden::tracker::{IssueStatus, IssueTracker};
use hostwarden::trigger::TriggerMonitor;

// ---- mock seams ----

struct MockSource {
    snapshots: Mutex<Vec<MetricsSnapshot>>,
    default_snapshot: MetricsSnapshot,
    units: Mutex<HashMap<String, UnitStatus>>,
}

impl MockSource {
    fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
            default_snapshot: snapshot(10.0),
            units: Mutex::new(HashMap::new()),
        }
    }

    fn push_cpu(&self, cpu: f64) {
        self.snapshots.lock().unwrap().push(snapshot(cpu));
    }
}

fn snapshot(cpu: f64) -> MetricsSnapshot {
    MetricsSnapshot {
        cpu_percent: cpu,
        memory_percent: 40.0,
        disk_percent: 50.0,
        load_avg_1min: 0.4,
        load_avg_5min: 0.4,
        load_avg_15min: 0.4,
        load_per_cpu: 0.1,
    }
}

#[async_trait]
impl SignalSource for MockSource {
    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let mut snapshots = self.snapshots.lock().unwrap();
        Ok(if snapshots.is_empty() {
            self.default_snapshot.clone()
        } else {
            snapshots.remove(0)
        })
    }

    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>> {
        Ok(self.units.lock().unwrap().get(unit).cloned())
    }

    async fn journal_after(&self, _cursor: Option<&str>) -> Result<JournalBatch> {
        Ok(JournalBatch::default())
    }
}

struct MockBackend {
    responses: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("{}".to_string())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        _tools: &[Value],
        _model: &str,
        _temperature: f32,
    ) -> Result<ChatOutcome> {
        self.prompts
            .lock()
            .unwrap()
            .push(messages.last().map(|m| m.content.clone()).unwrap_or_default());
        let mut responses = self.responses.lock().unwrap();
        let content = if responses.is_empty() {
            "done".to_string()
        } else {
            responses.remove(0)
        };
        Ok(ChatOutcome {
            message: Message::assistant(content),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", program, args.join(" ")));
        Ok(CommandOutput {
            status: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        })
    }

    async fn run_shell(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        Ok(CommandOutput {
            status: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        })
    }
}

fn restart_proposal(risk: RiskLevel, unit: &str) -> Proposal {
    Proposal {
        diagnosis: format!("{} is not responding to requests", unit),
        proposed_action: format!("restart the {} service", unit),
        action_type: ActionType::SystemdRestart,
        risk_level: risk,
        commands: vec![format!("systemctl restart {}", unit)],
        config_changes: None,
        reasoning: String::new(),
        rollback_plan: String::new(),
    }
}

// ---- S1: CPU breach ----

#[tokio::test]
async fn s1_cpu_breach_emits_single_event_and_grows_context() {
    let source = Arc::new(MockSource::new());
    source.push_cpu(91.0);
    source.push_cpu(92.0);
    source.push_cpu(93.0);

    let mut monitor = TriggerMonitor::new(
        source.clone(),
        Thresholds {
            cpu_percent: 90.0,
            ..Thresholds::default()
        },
        vec![],
    );

    let dir = tempfile::tempdir().unwrap();
    let mut context = ContextManager::new(100_000, dir.path(), "testhost", TokenCounter::Heuristic);

    let mut all_events = Vec::new();
    for _ in 0..3 {
        all_events.extend(monitor.check_all().await);
    }

    // Exactly one metric_threshold event, carrying the first breach value.
    let metric_events: Vec<_> = all_events
        .iter()
        .filter(|e| e.kind == EventKind::MetricThreshold)
        .collect();
    assert_eq!(metric_events.len(), 1);
    assert!((metric_events[0].payload["value"].as_f64().unwrap() - 91.0).abs() < 0.001);

    let tokens_before = context.current_tokens();
    assert!(context.add_event(metric_events[0].clone()).await);
    assert!(context.current_tokens() > tokens_before);
}

// ---- S2: suggest + medium risk queues ----

#[tokio::test]
async fn s2_suggest_medium_risk_queues_for_approval() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let executor = Executor::new(dir.path(), AutonomyLevel::Suggest).with_runner(runner.clone());

    let result = executor
        .execute(restart_proposal(RiskLevel::Medium, "foo"), Value::Null)
        .await;

    assert_eq!(result.status, ExecutionStatus::QueuedForApproval);
    assert!(!result.executed);
    assert_eq!(executor.approval_queue().len(), 1);
    assert!(runner.calls.lock().unwrap().is_empty());
}

// ---- S3: duplicate proposal suppressed ----

#[tokio::test]
async fn s3_duplicate_proposal_leaves_queue_length_one() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Executor::new(dir.path(), AutonomyLevel::Suggest)
        .with_runner(Arc::new(RecordingRunner::new()));
    let proposal = restart_proposal(RiskLevel::Medium, "foo");

    executor.execute(proposal.clone(), Value::Null).await;
    let second = executor.execute(proposal, Value::Null).await;

    assert_eq!(second.status, ExecutionStatus::QueuedForApproval);
    assert_eq!(executor.approval_queue().len(), 1);
}

// ---- S4: protected restart blocked, no side effects ----

#[tokio::test]
async fn s4_protected_restart_blocked_without_system_calls() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let executor = Executor::new(dir.path(), AutonomyLevel::AutoFull).with_runner(runner.clone());

    let result = executor
        .execute(restart_proposal(RiskLevel::Low, "sshd"), Value::Null)
        .await;

    assert_eq!(result.status, ExecutionStatus::Blocked);
    assert!(result.output.contains("BLOCKED"));
    assert!(runner.calls.lock().unwrap().is_empty());
}

// ---- S5: auto-resolution ----

#[tokio::test]
async fn s5_issue_auto_resolves_when_no_longer_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = IssueTracker::new(dir.path()).unwrap();

    let id = tracker
        .create(
            "macha",
            "nginx not running",
            "nginx service is down",
            Severity::High,
            "review",
        )
        .await
        .unwrap();

    let resolved = tracker
        .auto_resolve_if_fixed("macha", &["disk 91%".to_string()])
        .await
        .unwrap();

    assert_eq!(resolved, 1);
    assert_eq!(tracker.get(&id).unwrap().status, IssueStatus::Resolved);
}

// ---- S6: escalation drives the meta layer exactly once ----

#[tokio::test]
async fn s6_review_escalation_invokes_meta_once() {
    let dir = tempfile::tempdir().unwrap();

    let review_response = r#"{
        "status": "degraded",
        "summary": "multiple services degrading together",
        "issues": [],
        "patterns": [],
        "safe_actions": [],
        "should_escalate": true,
        "escalation_reason": "cascade"
    }"#;
    let meta_response = r#"{
        "analysis": "cascading failure rooted in storage latency",
        "root_cause": "slow disk",
        "recommended_actions": [],
        "preventive_measures": []
    }"#;

    let backend = Arc::new(MockBackend::new(vec![review_response, meta_response]));
    let source = Arc::new(MockSource::new());

    let mut config = Config::default();
    config.state_dir = dir.path().to_path_buf();
    config.use_trigger_model = false;
    config.semantic_embeddings = false;

    let mut orchestrator = Orchestrator::build(config, source, backend.clone())
        .await
        .unwrap();
    let result = orchestrator.run_once().await.unwrap();

    assert_eq!(result["review_ran"], json!(true));
    assert_eq!(result["escalated"], json!(true));
    assert_eq!(result["escalation_reason"], json!("cascade"));

    // The meta layer saw exactly one escalation prompt.
    let meta_prompts: Vec<String> = backend
        .prompts()
        .into_iter()
        .filter(|p| p.contains("ESCALATION REASON"))
        .collect();
    assert_eq!(meta_prompts.len(), 1);
    assert!(meta_prompts[0].contains("cascade"));

    // The analysis was folded back into the context buffer.
    let checkpoint: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("context_buffer.json")).unwrap(),
    )
    .unwrap();
    let kinds: Vec<String> = checkpoint["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap_or("").to_string())
        .collect();
    assert!(kinds.contains(&"meta_analysis".to_string()));
}

// ---- queue priority-FIFO property ----

#[tokio::test]
async fn queue_serves_priority_then_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let queue = LlmQueue::open(dir.path()).unwrap();
    let backend = Arc::new(MockBackend::new(vec!["r1", "r2", "r3"]));

    // Submitted lowest-priority first; service order must still be
    // interactive, autonomous, batch.
    let batch_id = queue
        .submit(
            RequestKind::Generate,
            json!({"prompt": "batch work", "model": "m"}),
            Priority::Batch,
        )
        .unwrap();
    let autonomous_id = queue
        .submit(
            RequestKind::Generate,
            json!({"prompt": "autonomous work", "model": "m"}),
            Priority::Autonomous,
        )
        .unwrap();
    let interactive_id = queue
        .submit(
            RequestKind::Generate,
            json!({"prompt": "interactive work", "model": "m"}),
            Priority::Interactive,
        )
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = QueueWorker::new(queue.clone(), backend.clone());
    let handle = tokio::spawn(worker.run(shutdown_rx));

    for id in [&interactive_id, &autonomous_id, &batch_id] {
        queue
            .wait(id, Duration::from_secs(10), Duration::from_millis(20), None)
            .await
            .unwrap();
    }
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    assert_eq!(
        backend.prompts(),
        vec!["interactive work", "autonomous work", "batch work"]
    );

    for id in [&interactive_id, &autonomous_id, &batch_id] {
        assert!(matches!(queue.status(id), QueueStatus::Completed(_)));
    }
}

// ---- context -> time-series write-through property ----

#[tokio::test]
async fn metric_threshold_event_writes_one_metric_sample() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        TimeSeriesStore::open(dir.path().join("ts.db"))
            .await
            .unwrap(),
    );
    let mut context = ContextManager::new(100_000, dir.path(), "testhost", TokenCounter::Heuristic)
        .with_timeseries(store.clone());

    let event = hostwarden::event::Event::new(
        EventKind::MetricThreshold,
        Severity::Medium,
        hostwarden::event::EventSource::Trigger,
        json!({"trigger_type": "cpu_high", "value": 92.5, "message": "cpu high"}),
    );
    assert!(context.add_event(event).await);

    let latest = store.latest_metrics("testhost", None).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert!((latest["cpu_high"].value - 92.5).abs() < f64::EPSILON);
}
