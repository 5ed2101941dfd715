//! Trigger Layer
//!
//! Lightweight continuous watchers: metric thresholds, critical unit
//! health, and journal pattern scans. Each check pass yields typed events
//! (deduplicated per-key by debounce) and a verdict on whether the batch
//! warrants waking the review layer.

mod patterns;

pub use patterns::{default_patterns, LogPattern};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::GenerateRequest;
use crate::config::Thresholds;
use crate::event::{Event, EventKind, EventSource, Severity};
use crate::queue::{LlmClient, Priority};
use crate::signals::{JournalRecord, SignalSource};
use crate::utils::extract_json_object;

const DEFAULT_DEBOUNCE_SECS: i64 = 300;
const LOG_PATTERN_DEBOUNCE_SECS: i64 = 60;
/// Consecutive failures before a probe is considered persistently broken.
const PROBE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerStats {
    pub checks_performed: u64,
    pub triggers_fired: u64,
    pub patterns_matched: u64,
    pub model_classifications: u64,
}

/// Optional small-model classification of matched log lines.
pub struct LogClassifier {
    client: Arc<LlmClient>,
    model: String,
}

impl LogClassifier {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Classify a log line. Failures are swallowed; the base event is
    /// preserved either way.
    pub async fn classify(&self, message: &str, unit: &str, priority: u8) -> Option<Value> {
        let prompt = format!(
            "Analyze this system log entry and provide:\n\
             1. Severity (critical/high/medium/low)\n\
             2. Category (system/service/security/network/disk/other)\n\
             3. Brief summary (one line)\n\
             4. Recommended action (if any)\n\n\
             Log entry:\nUnit: {}\nPriority: {}\nMessage: {}\n\n\
             Respond in JSON format with keys severity, category, summary, recommended_action.",
            unit,
            priority,
            crate::utils::truncate_tail(message, 500)
        );

        let request = GenerateRequest::new(prompt, &self.model)
            .with_temperature(0.3)
            .with_max_tokens(200);

        match self.client.generate(request, Priority::Batch).await {
            Ok(response) => extract_json_object(&response)
                .or_else(|| {
                    Some(json!({
                        "raw_response": crate::utils::truncate_tail(&response, 200),
                        "model": self.model.clone(),
                    }))
                }),
            Err(e) => {
                debug!("log classification failed: {:#}", e);
                None
            }
        }
    }
}

pub struct TriggerMonitor {
    source: Arc<dyn SignalSource>,
    thresholds: Thresholds,
    patterns: Vec<LogPattern>,
    critical_units: Vec<String>,
    classifier: Option<LogClassifier>,
    last_fired: HashMap<String, DateTime<Utc>>,
    probe_failures: HashMap<String, u32>,
    journal_cursor: Option<String>,
    cursor_warned: bool,
    stats: TriggerStats,
}

impl TriggerMonitor {
    pub fn new(
        source: Arc<dyn SignalSource>,
        thresholds: Thresholds,
        critical_units: Vec<String>,
    ) -> Self {
        Self {
            source,
            thresholds,
            patterns: default_patterns(),
            critical_units,
            classifier: None,
            last_fired: HashMap::new(),
            probe_failures: HashMap::new(),
            journal_cursor: None,
            cursor_warned: false,
            stats: TriggerStats::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: LogClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn stats(&self) -> &TriggerStats {
        &self.stats
    }

    /// One full check pass: metrics, services, journal.
    pub async fn check_all(&mut self) -> Vec<Event> {
        self.stats.checks_performed += 1;
        let mut events = Vec::new();

        events.extend(self.check_metrics().await);
        events.extend(self.check_services().await);
        events.extend(self.check_journal().await);

        self.stats.triggers_fired += events.len() as u64;
        events
    }

    async fn check_metrics(&mut self) -> Vec<Event> {
        let snapshot = match self.source.metrics_snapshot().await {
            Ok(snapshot) => {
                self.probe_failures.remove("metrics");
                snapshot
            }
            Err(e) => {
                warn!("metrics probe failed: {:#}", e);
                return self.record_probe_failure("metrics", &e).into_iter().collect();
            }
        };

        let mut events = Vec::new();
        let checks: [(&str, f64, f64, Severity); 4] = [
            (
                "cpu_high",
                snapshot.cpu_percent,
                self.thresholds.cpu_percent,
                Severity::Medium,
            ),
            (
                "memory_high",
                snapshot.memory_percent,
                self.thresholds.memory_percent,
                Severity::Medium,
            ),
            (
                "disk_high",
                snapshot.disk_percent,
                self.thresholds.disk_percent,
                Severity::High,
            ),
            (
                "load_high",
                snapshot.load_per_cpu,
                self.thresholds.load_per_cpu,
                Severity::Medium,
            ),
        ];

        for (trigger_type, value, threshold, severity) in checks {
            if value > threshold && self.should_fire(trigger_type, DEFAULT_DEBOUNCE_SECS) {
                events.push(Event::new(
                    EventKind::MetricThreshold,
                    severity,
                    EventSource::Trigger,
                    json!({
                        "trigger_type": trigger_type,
                        "value": value,
                        "threshold": threshold,
                        "message": format!(
                            "{} {:.1} exceeds threshold {:.1}",
                            trigger_type, value, threshold
                        ),
                    }),
                ));
            }
        }
        events
    }

    async fn check_services(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        let units = self.critical_units.clone();

        for unit in units {
            let status = match self.source.unit_status(&unit).await {
                Ok(status) => {
                    self.probe_failures.remove(&format!("unit_{}", unit));
                    status
                }
                Err(e) => {
                    warn!("unit status probe failed for {}: {:#}", unit, e);
                    if let Some(event) = self.record_probe_failure(&format!("unit_{}", unit), &e) {
                        events.push(event);
                    }
                    continue;
                }
            };

            // Units absent from this host are silently skipped.
            let Some(status) = status else {
                continue;
            };

            if !status.is_healthy() {
                let key = format!("service_{}_failed", unit);
                if self.should_fire(&key, DEFAULT_DEBOUNCE_SECS) {
                    events.push(Event::new(
                        EventKind::ServiceFailure,
                        Severity::Critical,
                        EventSource::Trigger,
                        json!({
                            "trigger_type": "service_failed",
                            "service": unit,
                            "status": status.active_state,
                            "message": format!(
                                "Critical service {} is {}",
                                unit, status.active_state
                            ),
                        }),
                    ));
                }
            }
        }
        events
    }

    async fn check_journal(&mut self) -> Vec<Event> {
        let batch = match self.source.journal_after(self.journal_cursor.as_deref()).await {
            Ok(batch) => {
                self.probe_failures.remove("journal");
                batch
            }
            Err(e) => {
                // Cursor loss policy: warn once, restart from "5 minutes ago".
                if self.journal_cursor.is_some() {
                    if !self.cursor_warned {
                        warn!("journal cursor lost ({:#}), restarting from 5 minutes ago", e);
                        self.cursor_warned = true;
                    }
                    self.journal_cursor = None;
                    return Vec::new();
                }
                warn!("journal probe failed: {:#}", e);
                return self.record_probe_failure("journal", &e).into_iter().collect();
            }
        };

        // Cursor advances past every record, matched or not.
        if batch.new_cursor.is_some() {
            self.journal_cursor = batch.new_cursor.clone();
            self.cursor_warned = false;
        }

        let mut events = Vec::new();
        for record in &batch.records {
            if let Some(event) = self.match_patterns(record) {
                events.push(event);
            }
        }

        // Classification is attached after matching so a backend outage
        // cannot suppress the base events.
        if let Some(classifier) = &self.classifier {
            for event in &mut events {
                if event.kind != EventKind::LogPattern {
                    continue;
                }
                let message = event.message().unwrap_or("").to_string();
                let unit = event
                    .payload
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if let Some(classification) = classifier.classify(&message, &unit, 6).await {
                    self.stats.model_classifications += 1;
                    event.payload["ai_classification"] = classification;
                }
            }
        }

        let error_count = batch.records.iter().filter(|r| r.priority <= 3).count();
        if error_count as f64 > self.thresholds.error_log_rate
            && self.should_fire("error_rate_high", DEFAULT_DEBOUNCE_SECS)
        {
            events.push(Event::new(
                EventKind::ErrorRate,
                Severity::Medium,
                EventSource::Trigger,
                json!({
                    "trigger_type": "high_error_rate",
                    "error_count": error_count,
                    "threshold": self.thresholds.error_log_rate,
                    "message": format!(
                        "High error rate: {} errors in recent logs",
                        error_count
                    ),
                }),
            ));
        }

        events
    }

    fn match_patterns(&mut self, record: &JournalRecord) -> Option<Event> {
        for idx in 0..self.patterns.len() {
            if !self.patterns[idx].regex.is_match(&record.message) {
                continue;
            }
            self.stats.patterns_matched += 1;

            let pattern_text = self.patterns[idx].regex.as_str().to_string();
            let key = format!(
                "pattern_{}",
                &pattern_text[..pattern_text.len().min(20)]
            );
            if !self.should_fire(&key, LOG_PATTERN_DEBOUNCE_SECS) {
                return None;
            }

            let pattern = &self.patterns[idx];
            return Some(Event::new(
                EventKind::LogPattern,
                pattern.severity,
                EventSource::Trigger,
                json!({
                    "trigger_type": "pattern_match",
                    "pattern": pattern.regex.as_str(),
                    "description": pattern.description,
                    "message": crate::utils::truncate_tail(&record.message, 200),
                    "unit": record.unit,
                }),
            ));
        }
        None
    }

    fn record_probe_failure(&mut self, probe: &str, error: &anyhow::Error) -> Option<Event> {
        let count = {
            let count = self.probe_failures.entry(probe.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count < PROBE_FAILURE_THRESHOLD {
            return None;
        }

        let key = format!("probe_{}", probe);
        if !self.should_fire(&key, DEFAULT_DEBOUNCE_SECS) {
            return None;
        }

        Some(Event::new(
            EventKind::ProbeFailure,
            Severity::Medium,
            EventSource::Trigger,
            json!({
                "trigger_type": "probe_failure",
                "probe": probe,
                "failures": count,
                "message": format!("Probe {} failing persistently: {:#}", probe, error),
            }),
        ))
    }

    /// Per-key debounce: at most one emission per window.
    fn should_fire(&mut self, key: &str, window_secs: i64) -> bool {
        let now = Utc::now();
        match self.last_fired.get(key) {
            Some(last) if (now - *last).num_seconds() < window_secs => false,
            _ => {
                self.last_fired.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Review-worthiness verdict: any critical, or >=2 high, or >=3 medium.
    pub fn should_trigger_review(events: &[Event]) -> bool {
        if events.is_empty() {
            return false;
        }
        let count = |severity: Severity| events.iter().filter(|e| e.severity == severity).count();

        count(Severity::Critical) > 0 || count(Severity::High) >= 2 || count(Severity::Medium) >= 3
    }

    /// Render a batch for context and notifications, grouped by severity.
    pub fn format_triggers(events: &[Event]) -> String {
        if events.is_empty() {
            return "No triggers detected.".to_string();
        }

        let mut lines = vec![format!("Detected {} trigger(s):", events.len()), String::new()];
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let matching: Vec<&Event> =
                events.iter().filter(|e| e.severity == severity).collect();
            if matching.is_empty() {
                continue;
            }
            lines.push(format!(
                "{} ({}):",
                severity.as_str().to_uppercase(),
                matching.len()
            ));
            for event in matching.iter().take(5) {
                lines.push(format!("  - {}", event.message().unwrap_or("No message")));
            }
            if matching.len() > 5 {
                lines.push(format!("  ... and {} more", matching.len() - 5));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{JournalBatch, MetricsSnapshot, UnitStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedSource {
        snapshots: Mutex<Vec<MetricsSnapshot>>,
        unit_state: Mutex<HashMap<String, UnitStatus>>,
        journal: Mutex<Vec<JournalBatch>>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                snapshots: Mutex::new(Vec::new()),
                unit_state: Mutex::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
            }
        }

        fn push_snapshot(&self, cpu: f64) {
            self.snapshots.lock().unwrap().push(MetricsSnapshot {
                cpu_percent: cpu,
                memory_percent: 40.0,
                disk_percent: 50.0,
                load_avg_1min: 0.5,
                load_avg_5min: 0.5,
                load_avg_15min: 0.5,
                load_per_cpu: 0.1,
            });
        }
    }

    #[async_trait]
    impl SignalSource for ScriptedSource {
        async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.is_empty() {
                anyhow::bail!("no snapshot scripted");
            }
            Ok(snapshots.remove(0))
        }

        async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>> {
            Ok(self.unit_state.lock().unwrap().get(unit).cloned())
        }

        async fn journal_after(&self, _cursor: Option<&str>) -> Result<JournalBatch> {
            let mut journal = self.journal.lock().unwrap();
            if journal.is_empty() {
                Ok(JournalBatch::default())
            } else {
                Ok(journal.remove(0))
            }
        }
    }

    fn monitor_with(source: Arc<ScriptedSource>) -> TriggerMonitor {
        TriggerMonitor::new(source, Thresholds::default(), vec!["sshd".to_string()])
    }

    #[tokio::test]
    async fn test_cpu_breach_fires_once_within_debounce() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(91.0);
        source.push_snapshot(92.0);
        source.push_snapshot(93.0);
        let mut monitor = monitor_with(source.clone());

        let first = monitor.check_all().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, EventKind::MetricThreshold);
        let value = first[0].payload["value"].as_f64().unwrap();
        assert!((value - 91.0).abs() < 0.001);

        // Two more breaching snapshots inside the debounce window: silence.
        assert!(monitor.check_all().await.is_empty());
        assert!(monitor.check_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_service_failure_emits_critical() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(10.0);
        source.unit_state.lock().unwrap().insert(
            "sshd".to_string(),
            UnitStatus {
                unit: "sshd".into(),
                active_state: "failed".into(),
            },
        );
        let mut monitor = monitor_with(source);

        let events = monitor.check_all().await;
        let failure = events
            .iter()
            .find(|e| e.kind == EventKind::ServiceFailure)
            .unwrap();
        assert_eq!(failure.severity, Severity::Critical);
        assert_eq!(failure.payload["service"], "sshd");
    }

    #[tokio::test]
    async fn test_missing_unit_silently_skipped() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(10.0);
        let mut monitor = monitor_with(source);
        assert!(monitor.check_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_journal_pattern_match_and_cursor_advance() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(10.0);
        source.journal.lock().unwrap().push(JournalBatch {
            new_cursor: Some("cursor-1".into()),
            records: vec![
                JournalRecord {
                    priority: 6,
                    unit: "nginx".into(),
                    message: "Failed to start nginx.service".into(),
                },
                JournalRecord {
                    priority: 6,
                    unit: "app".into(),
                    message: "all good".into(),
                },
            ],
        });
        let mut monitor = monitor_with(source);

        let events = monitor.check_all().await;
        let log = events
            .iter()
            .find(|e| e.kind == EventKind::LogPattern)
            .unwrap();
        assert_eq!(log.severity, Severity::High);
        assert_eq!(log.payload["description"], "Service failed to start");
        assert_eq!(monitor.journal_cursor.as_deref(), Some("cursor-1"));
    }

    #[tokio::test]
    async fn test_error_rate_event() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(10.0);
        let records = (0..15)
            .map(|i| JournalRecord {
                priority: 3,
                unit: "app".into(),
                message: format!("plain error line {}", i),
            })
            .collect();
        source.journal.lock().unwrap().push(JournalBatch {
            new_cursor: Some("c".into()),
            records,
        });
        let mut monitor = monitor_with(source);

        let events = monitor.check_all().await;
        let rate = events
            .iter()
            .find(|e| e.kind == EventKind::ErrorRate)
            .unwrap();
        assert_eq!(rate.payload["error_count"], 15);
    }

    #[tokio::test]
    async fn test_persistent_probe_failure_is_emittable() {
        let source = Arc::new(ScriptedSource::new());
        // No snapshots scripted: every metrics probe errors.
        let mut monitor = monitor_with(source);

        let mut probe_events = Vec::new();
        for _ in 0..4 {
            probe_events.extend(
                monitor
                    .check_all()
                    .await
                    .into_iter()
                    .filter(|e| e.kind == EventKind::ProbeFailure),
            );
        }
        assert_eq!(probe_events.len(), 1);
        assert_eq!(probe_events[0].payload["probe"], "metrics");
    }

    #[test]
    fn test_review_verdict_thresholds() {
        let event = |severity| {
            Event::new(
                EventKind::MetricThreshold,
                severity,
                EventSource::Trigger,
                json!({}),
            )
        };

        assert!(!TriggerMonitor::should_trigger_review(&[]));
        assert!(TriggerMonitor::should_trigger_review(&[event(
            Severity::Critical
        )]));
        assert!(!TriggerMonitor::should_trigger_review(&[event(Severity::High)]));
        assert!(TriggerMonitor::should_trigger_review(&[
            event(Severity::High),
            event(Severity::High)
        ]));
        assert!(!TriggerMonitor::should_trigger_review(&[
            event(Severity::Medium),
            event(Severity::Medium)
        ]));
        assert!(TriggerMonitor::should_trigger_review(&[
            event(Severity::Medium),
            event(Severity::Medium),
            event(Severity::Medium)
        ]));
    }

    #[test]
    fn test_format_triggers_groups_by_severity() {
        let events = vec![
            Event::new(
                EventKind::ServiceFailure,
                Severity::Critical,
                EventSource::Trigger,
                json!({"message": "sshd down"}),
            ),
            Event::new(
                EventKind::MetricThreshold,
                Severity::Medium,
                EventSource::Trigger,
                json!({"message": "cpu high"}),
            ),
        ];
        let text = TriggerMonitor::format_triggers(&events);
        assert!(text.contains("CRITICAL (1):"));
        assert!(text.contains("sshd down"));
        assert!(text.contains("MEDIUM (1):"));
    }
}
