//! Context Layer
//!
//! A token-budgeted rolling window over recent events. Admission never
//! exceeds the budget: old entries are compressed to rule-based summaries
//! first, and only dropped when compression cannot free enough space.
//! Every admitted event is also written through to the time-series store.

mod tokens;

pub use tokens::TokenCounter;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::event::{Event, EventKind, Severity};
use crate::signals::SarProbe;
use crate::store::{MetricSample, MetricStats, SearchHit, TimeSeriesStore, VectorStore};
use crate::store::Collection;

/// Minimum age before an entry becomes eligible for compression.
const COMPRESSION_MIN_AGE_SECS: i64 = 600;

/// An admitted event plus its bookkeeping. Serialises flat, so the
/// checkpoint entries match the event schema collaborators see:
/// `{timestamp, kind, severity, source, payload, token_count, compressed}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
    pub token_count: usize,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    pub total_compressions: u64,
    pub tokens_saved: usize,
    pub entries_compressed: u64,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    entries: Vec<ContextEntry>,
    token_count: usize,
    stats: CompressionStats,
    saved_at: String,
}

pub struct ContextManager {
    capacity: usize,
    counter: TokenCounter,
    entries: VecDeque<ContextEntry>,
    current_tokens: usize,
    next_seq: u64,
    stats: CompressionStats,
    hostname: String,
    state_dir: PathBuf,
    timeseries: Option<Arc<TimeSeriesStore>>,
    vectors: Option<Arc<VectorStore>>,
}

impl ContextManager {
    pub fn new(
        capacity: usize,
        state_dir: impl Into<PathBuf>,
        hostname: impl Into<String>,
        counter: TokenCounter,
    ) -> Self {
        let mut manager = Self {
            capacity,
            counter,
            entries: VecDeque::new(),
            current_tokens: 0,
            next_seq: 0,
            stats: CompressionStats::default(),
            hostname: hostname.into(),
            state_dir: state_dir.into(),
            timeseries: None,
            vectors: None,
        };
        manager.load_checkpoint();
        manager
    }

    pub fn with_timeseries(mut self, store: Arc<TimeSeriesStore>) -> Self {
        self.timeseries = Some(store);
        self
    }

    pub fn with_vectors(mut self, store: Arc<VectorStore>) -> Self {
        self.vectors = Some(store);
        self
    }

    pub fn current_tokens(&self) -> usize {
        self.current_tokens
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    fn measure(&self, entry: &ContextEntry) -> usize {
        let text = serde_json::to_string(&entry.event).unwrap_or_default();
        self.counter.count(&text)
    }

    /// Admit an event. Compresses (and as a last resort evicts) older
    /// entries so the budget holds; a `critical` event is never refused.
    pub async fn add_event(&mut self, event: Event) -> bool {
        let mut entry = ContextEntry {
            seq: self.next_seq,
            event,
            token_count: 0,
            compressed: false,
        };
        entry.token_count = self.measure(&entry);

        if self.current_tokens + entry.token_count > self.capacity {
            self.compress_entries(self.capacity / 2);
        }

        // Compression may not be enough; shed oldest entries, non-critical
        // first. Only a critical event may displace other critical entries.
        while self.current_tokens + entry.token_count > self.capacity && !self.entries.is_empty() {
            let victim = self
                .entries
                .iter()
                .position(|e| e.event.severity != Severity::Critical)
                .or_else(|| {
                    if entry.event.severity == Severity::Critical {
                        Some(0)
                    } else {
                        None
                    }
                });
            match victim {
                Some(idx) => {
                    if let Some(removed) = self.entries.remove(idx) {
                        self.current_tokens -= removed.token_count;
                        debug!("evicted context entry {} to make room", removed.seq);
                    }
                }
                None => break,
            }
        }

        if self.current_tokens + entry.token_count > self.capacity {
            if entry.event.severity == Severity::Critical {
                warn!("critical event exceeds remaining budget, admitting anyway");
            } else {
                warn!("event of {} tokens does not fit context budget, dropped", entry.token_count);
                return false;
            }
        }

        self.next_seq += 1;
        self.current_tokens += entry.token_count;
        let event = entry.event.clone();
        self.entries.push_back(entry);

        self.write_through(&event).await;
        true
    }

    pub async fn add_events(&mut self, events: Vec<Event>) -> usize {
        let mut admitted = 0;
        for event in events {
            if self.add_event(event).await {
                admitted += 1;
            }
        }
        admitted
    }

    /// Dual-store write-through. Failures here never block admission.
    async fn write_through(&self, event: &Event) {
        let Some(ts) = &self.timeseries else {
            return;
        };

        match event.kind {
            EventKind::MetricThreshold => {
                let name = event
                    .payload
                    .get("trigger_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let value = event.payload.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                let sample = MetricSample {
                    name: name.to_string(),
                    value,
                    unit: String::new(),
                    metadata: Value::Null,
                    timestamp: event.timestamp,
                };
                if let Err(e) = ts.store_metrics(&self.hostname, vec![sample]).await {
                    debug!("metric write-through failed: {:#}", e);
                }
            }
            EventKind::LogPattern => {
                let message = event.message().unwrap_or("");
                let unit = event.payload.get("unit").and_then(Value::as_str).unwrap_or("");
                if let Err(e) = ts
                    .store_log_event(
                        &self.hostname,
                        event.severity.as_str(),
                        message,
                        unit,
                        Value::Null,
                        event.timestamp,
                    )
                    .await
                {
                    debug!("log write-through failed: {:#}", e);
                }
            }
            _ => {}
        }

        if let Err(e) = ts
            .store_trigger_event(
                &self.hostname,
                event.kind.as_str(),
                event.message().unwrap_or(""),
                json!({"source": event.source, "event": event}),
                event.timestamp,
            )
            .await
        {
            debug!("trigger write-through failed: {:#}", e);
        }
    }

    /// Compress eligible entries until the running total is at or below
    /// `target`. Entries are summarised in place; nothing is deleted.
    pub fn compress_entries(&mut self, target: usize) {
        if self.current_tokens <= target {
            return;
        }
        let tokens_to_free = self.current_tokens - target;
        debug!("compressing context: need to free {} tokens", tokens_to_free);

        let now = Utc::now();
        let mut freed = 0usize;
        let mut compressed_count = 0u64;

        for idx in 0..self.entries.len() {
            if freed >= tokens_to_free {
                break;
            }
            let entry = &self.entries[idx];
            if entry.compressed {
                continue;
            }
            // Critical context keeps its full payload.
            if entry.event.severity == Severity::Critical {
                continue;
            }
            if (now - entry.event.timestamp).num_seconds() < COMPRESSION_MIN_AGE_SECS {
                continue;
            }

            let summary = summarise_event(&self.entries[idx].event);
            let entry = &mut self.entries[idx];
            let original_tokens = entry.token_count;
            entry.event.payload = json!({"summary": summary});
            entry.compressed = true;

            let new_tokens = {
                let text = serde_json::to_string(&entry.event).unwrap_or_default();
                self.counter.count(&text)
            };
            self.entries[idx].token_count = new_tokens;

            let saved = original_tokens.saturating_sub(new_tokens);
            self.current_tokens -= saved;
            freed += saved;
            compressed_count += 1;
            self.stats.tokens_saved += saved;
            self.stats.entries_compressed += 1;
        }

        if compressed_count > 0 {
            self.stats.total_compressions += 1;
            info!(
                "compressed {} context entries, freed {} tokens",
                compressed_count, freed
            );
        }
    }

    /// Render the window: header, optional metrics summary, optional SAR
    /// snapshot, the recent-events tail (newest first), statistics footer.
    pub async fn get_window(
        &self,
        include_sar: bool,
        include_metrics: bool,
        max_tokens: Option<usize>,
    ) -> String {
        let max_tokens = max_tokens.unwrap_or(self.capacity);
        let mut sections = Vec::new();
        let mut used = 0usize;

        let header = format!(
            "=== Host Administration Context ===\nHostname: {}\nTimestamp: {}\nContext Window: {}/{} tokens\nActive Entries: {}\n",
            self.hostname,
            Utc::now().to_rfc3339(),
            self.current_tokens,
            self.capacity,
            self.entries.len()
        );
        used += self.counter.count(&header);
        sections.push(header);

        if include_metrics {
            if let Some(section) = self.metrics_summary().await {
                let cost = self.counter.count(&section);
                if used + cost < max_tokens {
                    sections.push(section);
                    used += cost;
                }
            }
        }

        if include_sar && SarProbe::available().await {
            if let Some(section) = SarProbe::snapshot().await {
                let cost = self.counter.count(&section);
                if used + cost < max_tokens {
                    sections.push(section);
                    used += cost;
                }
            }
        }

        let mut event_lines = vec!["Recent Events:".to_string(), String::new()];
        let mut remaining = max_tokens.saturating_sub(used);
        for entry in self.entries.iter().rev() {
            if entry.token_count > remaining {
                break;
            }
            let body = if entry.compressed {
                entry
                    .event
                    .payload
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or("compressed event")
                    .to_string()
            } else {
                serde_json::to_string(&entry.event.payload).unwrap_or_default()
            };
            event_lines.push(format!(
                "[{}] [{}] {}",
                entry.event.timestamp.to_rfc3339(),
                entry.event.source.as_str(),
                body
            ));
            event_lines.push(String::new());
            remaining -= entry.token_count;
        }
        sections.push(event_lines.join("\n"));

        let utilisation = if self.capacity > 0 {
            (self.current_tokens as f64 / self.capacity as f64) * 100.0
        } else {
            0.0
        };
        sections.push(format!(
            "=== Context Statistics ===\nTotal entries: {}\nCurrent tokens: {}\nMax tokens: {}\nUtilization: {:.1}%\nCompressions performed: {}\nTokens saved: {}",
            self.entries.len(),
            self.current_tokens,
            self.capacity,
            utilisation,
            self.stats.total_compressions,
            self.stats.tokens_saved
        ));

        sections.join("\n\n")
    }

    async fn metrics_summary(&self) -> Option<String> {
        let ts = self.timeseries.as_ref()?;
        match ts.latest_metrics(&self.hostname, None).await {
            Ok(latest) if !latest.is_empty() => {
                let mut lines = vec!["Recent System Metrics:".to_string()];
                let mut names: Vec<_> = latest.keys().cloned().collect();
                names.sort();
                for name in names {
                    let metric = &latest[&name];
                    let age = (Utc::now() - metric.time).num_seconds().max(0);
                    lines.push(format!(
                        "  {}: {:.1}{} ({}s ago)",
                        name, metric.value, metric.unit, age
                    ));
                }
                Some(lines.join("\n"))
            }
            Ok(_) => Some("Recent Metrics: No data available".to_string()),
            Err(e) => Some(format!("Recent Metrics: Error retrieving data - {:#}", e)),
        }
    }

    /// Semantic recall over past issues.
    pub async fn query_similar(&self, description: &str, k: usize) -> Vec<SearchHit> {
        let Some(vectors) = &self.vectors else {
            return Vec::new();
        };
        vectors
            .query(Collection::Issues, description, k, &[])
            .await
            .unwrap_or_default()
    }

    pub async fn metric_trends(&self, metric_name: &str, hours: i64) -> Option<MetricStats> {
        let ts = self.timeseries.as_ref()?;
        ts.metric_statistics(&self.hostname, metric_name, hours)
            .await
            .ok()
            .flatten()
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("context_buffer.json")
    }

    /// Checkpoint the buffer to disk (clean shutdown and on demand).
    pub fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            entries: self.entries.iter().cloned().collect(),
            token_count: self.current_tokens,
            stats: self.stats.clone(),
            saved_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(
            self.checkpoint_path(),
            serde_json::to_string_pretty(&checkpoint)?,
        )?;
        Ok(())
    }

    fn load_checkpoint(&mut self) {
        let path = self.checkpoint_path();
        if !path.exists() {
            return;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read context checkpoint: {}", e);
                return;
            }
        };
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                self.next_seq = checkpoint
                    .entries
                    .iter()
                    .map(|e| e.seq + 1)
                    .max()
                    .unwrap_or(0);
                self.entries = checkpoint.entries.into();
                self.current_tokens = checkpoint.token_count;
                self.stats = checkpoint.stats;
                info!(
                    "restored context: {} entries, {} tokens",
                    self.entries.len(),
                    self.current_tokens
                );
            }
            Err(e) => {
                warn!("corrupt context checkpoint ({}), starting empty", e);
                self.entries.clear();
                self.current_tokens = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_tokens = 0;
        let _ = self.save_checkpoint();
    }

    #[cfg(test)]
    pub fn entries(&self) -> &VecDeque<ContextEntry> {
        &self.entries
    }
}

fn summarise_event(event: &Event) -> String {
    match event.kind {
        EventKind::MetricThreshold => {
            let trigger_type = event
                .payload
                .get("trigger_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let value = event.payload.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            format!("{}: {:.1}", trigger_type, value)
        }
        EventKind::LogPattern => {
            let description = event
                .payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("Log: {} - {}", event.severity, description)
        }
        EventKind::ServiceFailure => {
            let service = event
                .payload
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let status = event
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("Service {}: {}", service, status)
        }
        _ => match event.message() {
            Some(message) => crate::utils::truncate_tail(message, 100),
            None => format!("{} event", event.kind.as_str()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;

    fn manager(capacity: usize) -> (tempfile::TempDir, ContextManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ContextManager::new(capacity, dir.path(), "testhost", TokenCounter::Heuristic);
        (dir, manager)
    }

    fn metric_event(value: f64) -> Event {
        Event::new(
            EventKind::MetricThreshold,
            Severity::Medium,
            EventSource::Trigger,
            json!({
                "trigger_type": "cpu_high",
                "value": value,
                "threshold": 90.0,
                "message": format!("CPU usage {:.1}% exceeds threshold 90.0%", value),
            }),
        )
    }

    fn old_metric_event(value: f64) -> Event {
        let mut event = metric_event(value);
        event.timestamp = Utc::now() - ChronoDuration::minutes(30);
        event
    }

    #[tokio::test]
    async fn test_token_conservation() {
        let (_dir, mut manager) = manager(100_000);
        for i in 0..20 {
            assert!(manager.add_event(metric_event(90.0 + i as f64)).await);
        }

        let sum: usize = manager.entries().iter().map(|e| e.token_count).sum();
        assert_eq!(sum, manager.current_tokens());
        assert!(manager.current_tokens() <= manager.capacity());
    }

    #[tokio::test]
    async fn test_compression_reduces_tokens_without_deleting() {
        let (_dir, mut manager) = manager(100_000);
        for i in 0..10 {
            manager.add_event(old_metric_event(90.0 + i as f64)).await;
        }

        let entries_before = manager.entry_count();
        let tokens_before = manager.current_tokens();

        manager.compress_entries(tokens_before / 2);

        assert_eq!(manager.entry_count(), entries_before);
        assert!(manager.current_tokens() <= tokens_before);
        assert!(manager.stats().tokens_saved > 0);
        assert!(manager.entries().iter().any(|e| e.compressed));

        let sum: usize = manager.entries().iter().map(|e| e.token_count).sum();
        assert_eq!(sum, manager.current_tokens());
    }

    #[tokio::test]
    async fn test_recent_entries_not_compressed() {
        let (_dir, mut manager) = manager(100_000);
        manager.add_event(metric_event(95.0)).await;
        manager.compress_entries(0);
        assert!(!manager.entries()[0].compressed);
    }

    #[tokio::test]
    async fn test_critical_entries_exempt_from_compression() {
        let (_dir, mut manager) = manager(100_000);
        let mut critical = Event::new(
            EventKind::ServiceFailure,
            Severity::Critical,
            EventSource::Trigger,
            json!({"service": "sshd", "status": "failed", "message": "sshd failed"}),
        );
        critical.timestamp = Utc::now() - ChronoDuration::minutes(30);
        manager.add_event(critical).await;
        manager.add_event(old_metric_event(95.0)).await;

        manager.compress_entries(0);

        assert!(!manager.entries()[0].compressed);
        assert!(manager.entries()[1].compressed);
    }

    #[tokio::test]
    async fn test_admission_evicts_when_compression_insufficient() {
        let (_dir, mut manager) = manager(150);
        // Entries are too young to compress, so overflow must evict.
        for i in 0..10 {
            manager.add_event(metric_event(90.0 + i as f64)).await;
        }
        assert!(manager.current_tokens() <= manager.capacity());
        assert!(manager.entry_count() < 10);
    }

    #[tokio::test]
    async fn test_window_contains_events_and_stats() {
        let (_dir, mut manager) = manager(100_000);
        manager.add_event(metric_event(92.5)).await;

        let window = manager.get_window(false, false, None).await;
        assert!(window.contains("Hostname: testhost"));
        assert!(window.contains("Recent Events:"));
        assert!(window.contains("cpu_high"));
        assert!(window.contains("=== Context Statistics ==="));
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut manager =
                ContextManager::new(100_000, dir.path(), "testhost", TokenCounter::Heuristic);
            manager.add_event(metric_event(91.0)).await;
            manager.save_checkpoint().unwrap();
        }

        let restored =
            ContextManager::new(100_000, dir.path(), "testhost", TokenCounter::Heuristic);
        assert_eq!(restored.entry_count(), 1);
        assert!(restored.current_tokens() > 0);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("context_buffer.json"), "{broken").unwrap();

        let manager =
            ContextManager::new(100_000, dir.path(), "testhost", TokenCounter::Heuristic);
        assert_eq!(manager.entry_count(), 0);
        assert_eq!(manager.current_tokens(), 0);
    }

    #[test]
    fn test_summaries_follow_kind_rules() {
        let metric = metric_event(92.5);
        assert_eq!(summarise_event(&metric), "cpu_high: 92.5");

        let log = Event::new(
            EventKind::LogPattern,
            Severity::High,
            EventSource::Trigger,
            json!({"description": "Service failed to start", "message": "..."}),
        );
        assert_eq!(summarise_event(&log), "Log: high - Service failed to start");

        let service = Event::new(
            EventKind::ServiceFailure,
            Severity::Critical,
            EventSource::Trigger,
            json!({"service": "nginx", "status": "failed"}),
        );
        assert_eq!(summarise_event(&service), "Service nginx: failed");
    }
}
