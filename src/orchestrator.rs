//! Orchestrator
//!
//! Owns the two tickers (trigger, review), composes the four layers, and
//! demand-triggers meta escalations. Exactly one orchestrator instance
//! runs per host. Any error escaping a cycle is logged and followed by a
//! 60-second back-off; fatal errors exist only at initialisation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{InferenceBackend, OllamaBackend, OpenAiCompatBackend};
use crate::config::Config;
use crate::context::{ContextManager, TokenCounter};
use crate::event::{Event, EventKind, EventSource, Severity};
use crate::executor::{Executor, RebuildConfig};
use crate::meta::MetaLayer;
use crate::notify::{self, Notifier, PRIORITY_HIGH};
use crate::queue::{LlmClient, LlmQueue, QueueWorker};
use crate::review::ReviewLayer;
use crate::signals::{MetricsSnapshot, SignalSource, SystemdSignalSource};
use crate::store::{MetricSample, TimeSeriesStore, VectorStore};
use crate::tools::ToolSurface;
use crate::tracker::IssueTracker;
use crate::trigger::{LogClassifier, TriggerMonitor};

/// Minimum interval between escalations for the same reason.
const ESCALATION_DEBOUNCE_SECS: i64 = 300;
/// Back-off after an orchestration cycle error.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    config: Config,
    hostname: String,
    source: Arc<dyn SignalSource>,
    backend: Arc<dyn InferenceBackend>,
    queue: Option<LlmQueue>,
    context: ContextManager,
    trigger: TriggerMonitor,
    review: ReviewLayer,
    meta: Arc<MetaLayer>,
    executor: Arc<Executor>,
    tracker: IssueTracker,
    notifier: Arc<dyn Notifier>,
    timeseries: Option<Arc<TimeSeriesStore>>,
    escalations_fired: HashMap<String, DateTime<Utc>>,
    consecutive_review_errors: u32,
    last_trigger_check: Option<Instant>,
    last_review_check: Option<Instant>,
    cycle_count: u64,
}

impl Orchestrator {
    /// Build the whole stack with production seams. Errors out of this
    /// function are fatal (exit non-zero from main).
    pub async fn new(config: Config) -> Result<Self> {
        let backend: Arc<dyn InferenceBackend> = if config.inference.backend_url.contains("/v1") {
            Arc::new(OpenAiCompatBackend::new(config.inference.backend_url.clone(), None))
        } else {
            Arc::new(OllamaBackend::new(config.inference.backend_url.clone()))
        };
        Self::build(config, Arc::new(SystemdSignalSource::new()), backend).await
    }

    /// Build with explicit signal-source and backend seams. Stores are
    /// constructed first, then the layers; nothing here keeps a
    /// back-reference to the orchestrator.
    pub async fn build(
        config: Config,
        source: Arc<dyn SignalSource>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self> {
        config.ensure_state_dir().context("fatal: state directory unusable")?;

        let hostname = System::host_name().unwrap_or_else(|| "localhost".to_string());
        let state_dir = config.state_dir.clone();

        // Stores first.
        let timeseries = match TimeSeriesStore::open(state_dir.join("timeseries.db")).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("time-series store unavailable ({:#}), continuing degraded", e);
                None
            }
        };
        let vectors_dir = state_dir.join("vectors");
        let vectors = if config.semantic_embeddings {
            VectorStore::open(&vectors_dir)
        } else {
            VectorStore::open_with_embedder(&vectors_dir, None)
        };
        let vectors = match vectors {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("vector store unavailable ({:#}), continuing degraded", e);
                None
            }
        };

        let queue = match LlmQueue::open(state_dir.join("queues/ollama")) {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!("llm queue unavailable ({:#}), falling back to direct dispatch", e);
                None
            }
        };
        let client = Arc::new(LlmClient::new(queue.clone(), backend.clone()));

        // Context layer, clamped to the model capacity.
        let counter = TokenCounter::from_path(config.inference.tokenizer_path.as_deref());
        let mut context = ContextManager::new(
            config.effective_context_size(),
            &state_dir,
            hostname.clone(),
            counter,
        );
        if let Some(ts) = &timeseries {
            context = context.with_timeseries(ts.clone());
        }
        if let Some(v) = &vectors {
            context = context.with_vectors(v.clone());
        }

        // Trigger layer.
        let mut trigger = TriggerMonitor::new(
            source.clone(),
            config.thresholds.clone(),
            config.critical_services.clone(),
        );
        if config.use_trigger_model {
            trigger = trigger.with_classifier(LogClassifier::new(
                client.clone(),
                config.inference.trigger_model.clone(),
            ));
        }

        // Notifier and tool surface.
        let notifier: Arc<dyn Notifier> = notify::from_config(&config.notify).into();
        let tools = Arc::new(
            ToolSurface::new(state_dir.join("tool_cache")).with_notifier(notifier.clone()),
        );

        // Meta layer, then the executor wired to its reflection hook.
        let mut meta = MetaLayer::new(
            config.inference.meta_model.clone(),
            client.clone(),
            &state_dir,
            tools,
            &hostname,
        );
        if let Some(v) = &vectors {
            meta = meta.with_vectors(v.clone());
        }
        let meta = Arc::new(meta);

        let executor = Arc::new(
            Executor::new(&state_dir, config.autonomy_level)
                .with_protected_units(config.protected_services.clone())
                .with_rebuild(RebuildConfig::default())
                .with_reflection(meta.clone()),
        );

        let review = ReviewLayer::new(
            config.inference.review_model.clone(),
            client.clone(),
            &state_dir,
        );

        let mut tracker = IssueTracker::new(&state_dir)?;
        if let Some(v) = &vectors {
            tracker = tracker.with_vectors(v.clone());
        }

        info!(
            "orchestrator initialised for {} (autonomy {:?})",
            hostname, config.autonomy_level
        );

        Ok(Self {
            config,
            hostname,
            source,
            backend,
            queue,
            context,
            trigger,
            review,
            meta,
            executor,
            tracker,
            notifier,
            timeseries,
            escalations_fired: HashMap::new(),
            consecutive_review_errors: 0,
            last_trigger_check: None,
            last_review_check: None,
            cycle_count: 0,
        })
    }

    pub fn executor(&self) -> Arc<Executor> {
        self.executor.clone()
    }

    /// Start the single queue worker. Returns the shutdown handle; the
    /// worker finishes its in-flight request before stopping.
    fn start_worker(&self) -> Option<(tokio::task::JoinHandle<()>, watch::Sender<bool>)> {
        let queue = self.queue.clone()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = QueueWorker::new(queue, self.backend.clone());
        let handle = tokio::spawn(worker.run(shutdown_rx));
        Some((handle, shutdown_tx))
    }

    /// One orchestration cycle. `force` runs both layers regardless of
    /// ticker state (used by `run --mode once`).
    pub async fn run_cycle(&mut self, force: bool) -> Value {
        self.cycle_count += 1;
        let now = Instant::now();
        let mut result = json!({
            "cycle": self.cycle_count,
            "timestamp": Utc::now().to_rfc3339(),
            "trigger_ran": false,
            "review_ran": false,
            "escalated": false,
        });

        let trigger_due = force
            || self
                .last_trigger_check
                .map(|t| t.elapsed() >= Duration::from_secs(self.config.trigger_interval))
                .unwrap_or(true);

        let mut review_worthy = false;
        if trigger_due {
            self.last_trigger_check = Some(now);
            let events = self.trigger.check_all().await;
            result["trigger_ran"] = json!(true);
            result["trigger_events"] = json!(events.len());

            if !events.is_empty() {
                info!("trigger pass: {} event(s)", events.len());
                review_worthy = TriggerMonitor::should_trigger_review(&events);

                for event in &events {
                    if event.severity == Severity::Critical {
                        let _ = self
                            .notifier
                            .send(
                                "Critical trigger",
                                event.message().unwrap_or("critical event"),
                                PRIORITY_HIGH,
                            )
                            .await;
                    }
                }
                self.context.add_events(events).await;
            }

            self.store_current_metrics().await;
        }

        let review_due = force
            || review_worthy
            || self
                .last_review_check
                .map(|t| t.elapsed() >= Duration::from_secs(self.config.review_interval))
                .unwrap_or(true);

        if review_due {
            self.last_review_check = Some(now);
            result["review_ran"] = json!(true);
            let triggered_by = if review_worthy { "triggers" } else { "periodic" };

            if let Some(escalation) = self.run_review(triggered_by).await {
                result["escalated"] = json!(true);
                result["escalation_reason"] = json!(escalation);
            }
            if self.consecutive_review_errors > 0 {
                // Surfaced so the continuous loop backs off before retrying.
                result["error"] = json!("review pass failed");
            }
        }

        result
    }

    /// Run the review layer; returns the escalation reason when a meta
    /// escalation was performed this cycle.
    async fn run_review(&mut self, triggered_by: &str) -> Option<String> {
        let analysis = match self
            .review
            .review(&mut self.context, &self.executor, triggered_by)
            .await
        {
            Ok(analysis) => {
                self.consecutive_review_errors = 0;
                analysis
            }
            Err(e) => {
                self.consecutive_review_errors += 1;
                warn!(
                    "review pass failed ({} consecutive): {:#}",
                    self.consecutive_review_errors, e
                );
                // The review layer failing repeatedly is itself an
                // escalation-worthy situation.
                if self.consecutive_review_errors >= 2 {
                    self.consecutive_review_errors = 0;
                    let reason = "review layer errored twice in a row".to_string();
                    if self.escalate(&reason).await {
                        return Some(reason);
                    }
                }
                return None;
            }
        };

        info!(
            "review: status={}, issues={}, escalate={}",
            analysis.status,
            analysis.issues.len(),
            analysis.should_escalate
        );

        // Fold the review's findings into the tracker.
        let detected: Vec<String> = analysis
            .issues
            .iter()
            .map(|issue| issue.description.clone())
            .collect();

        for issue in &analysis.issues {
            let severity = match issue.severity.as_str() {
                "critical" => Severity::Critical,
                "high" => Severity::High,
                "low" => Severity::Low,
                _ => Severity::Medium,
            };
            if severity >= Severity::High {
                let hostname = self.hostname.clone();
                if let Err(e) = self
                    .tracker
                    .track(&hostname, &issue.description, &issue.description, severity, "review")
                    .await
                {
                    warn!("issue tracking failed: {:#}", e);
                }
            }
        }

        match self
            .tracker
            .auto_resolve_if_fixed(&self.hostname.clone(), &detected)
            .await
        {
            Ok(resolved) if resolved > 0 => {
                info!("auto-resolved {} issue(s) no longer detected", resolved)
            }
            Ok(_) => {}
            Err(e) => warn!("auto-resolve failed: {:#}", e),
        }

        if analysis.should_escalate {
            let reason = analysis
                .escalation_reason
                .clone()
                .unwrap_or_else(|| "Complex issue detected".to_string());
            if self.escalate(&reason).await {
                return Some(reason);
            }
        }
        None
    }

    /// Demand-trigger the meta layer. Debounced per reason so a persistent
    /// condition cannot thrash the large model.
    async fn escalate(&mut self, reason: &str) -> bool {
        let now = Utc::now();
        if let Some(last) = self.escalations_fired.get(reason) {
            if (now - *last).num_seconds() < ESCALATION_DEBOUNCE_SECS {
                info!("escalation '{}' debounced", reason);
                return false;
            }
        }
        self.escalations_fired.insert(reason.to_string(), now);

        info!("escalating to meta layer: {}", reason);
        let window = self.context.get_window(true, true, None).await;
        let analysis = self.meta.analyze_escalation(reason, &window).await;

        let summary = analysis
            .get("analysis")
            .and_then(Value::as_str)
            .map(|s| crate::utils::truncate_tail(s, 200))
            .unwrap_or_else(|| "analysis complete".to_string());

        self.context
            .add_event(Event::new(
                EventKind::MetaAnalysis,
                Severity::Medium,
                EventSource::Meta,
                json!({
                    "escalation_reason": reason,
                    "summary": summary,
                    "message": format!("Meta analysis: {}", summary),
                }),
            ))
            .await;

        let _ = self
            .notifier
            .send(
                "Meta analysis",
                &format!("Escalation: {}\n\n{}", reason, summary),
                PRIORITY_HIGH,
            )
            .await;

        // When the analysis names concrete actions, turn them into a gated
        // proposal.
        let has_actions = analysis
            .get("recommended_actions")
            .and_then(Value::as_array)
            .map(|actions| !actions.is_empty())
            .unwrap_or(false);
        if has_actions {
            let proposal = self.meta.propose_fix(reason, &analysis).await;
            let result = self.executor.execute(proposal, analysis.clone()).await;
            info!("escalation proposal outcome: {:?}", result.status);
        }

        true
    }

    async fn store_current_metrics(&self) {
        let Some(ts) = &self.timeseries else {
            return;
        };
        let snapshot = match self.source.metrics_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };

        let samples = metric_samples(&snapshot);
        if let Err(e) = ts.store_metrics(&self.hostname, samples).await {
            warn!("could not store metrics: {:#}", e);
        }
    }

    /// One complete cycle, for `run --mode once` and tests.
    pub async fn run_once(&mut self) -> Result<Value> {
        let worker = self.start_worker();

        let result = self.run_cycle(true).await;

        if let Some((handle, shutdown)) = worker {
            let _ = shutdown.send(true);
            let _ = handle.await;
        }
        if let Err(e) = self.context.save_checkpoint() {
            warn!("could not checkpoint context: {:#}", e);
        }
        Ok(result)
    }

    /// The continuous loop: 1-second heartbeat, both tickers derived from
    /// elapsed time, graceful SIGTERM/SIGINT shutdown.
    pub async fn run_continuous(&mut self) -> Result<()> {
        info!("starting orchestrator (4-layer pipeline)");
        info!("  autonomy: {:?}", self.config.autonomy_level);
        info!("  trigger interval: {}s", self.config.trigger_interval);
        info!("  review interval: {}s", self.config.review_interval);
        info!("  state dir: {:?}", self.config.state_dir);

        let worker = self.start_worker();

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("cannot install SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let cycle = self.run_cycle(false).await;
                    if cycle.get("error").is_some() {
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
            }
        }

        if let Some((handle, shutdown)) = worker {
            let _ = shutdown.send(true);
            let _ = handle.await;
        }
        if let Err(e) = self.context.save_checkpoint() {
            error!("could not checkpoint context on shutdown: {:#}", e);
        }
        info!("orchestrator stopped");
        Ok(())
    }
}

fn metric_samples(snapshot: &MetricsSnapshot) -> Vec<MetricSample> {
    vec![
        MetricSample::now("cpu_percent", snapshot.cpu_percent, "%"),
        MetricSample::now("memory_percent", snapshot.memory_percent, "%"),
        MetricSample::now("disk_percent", snapshot.disk_percent, "%"),
        MetricSample::now("load_avg_1min", snapshot.load_avg_1min, ""),
        MetricSample::now("load_avg_5min", snapshot.load_avg_5min, ""),
        MetricSample::now("load_avg_15min", snapshot.load_avg_15min, ""),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_samples_cover_snapshot() {
        let snapshot = MetricsSnapshot {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            load_avg_1min: 1.0,
            load_avg_5min: 2.0,
            load_avg_15min: 3.0,
            load_per_cpu: 0.25,
        };
        let samples = metric_samples(&snapshot);
        assert_eq!(samples.len(), 6);
        assert!(samples.iter().any(|s| s.name == "cpu_percent" && s.value == 10.0));
        assert!(samples.iter().any(|s| s.name == "load_avg_15min" && s.value == 3.0));
    }
}
