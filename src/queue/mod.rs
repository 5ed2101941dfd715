//! LLM Request Queue
//!
//! Serialises all inference calls so exactly one generation is in flight
//! per backend. Requests live as JSON files in four directories (pending,
//! processing, completed, failed); a single worker drains them in
//! priority-then-submission order. Callers that cannot write the queue
//! directory fall back to direct backend dispatch, silently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{ChatOutcome, GenerateRequest, InferenceBackend, Message};

/// Request priority; lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Interactive = 0,
    Autonomous = 1,
    Batch = 2,
}

impl Priority {
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Priority::Interactive),
            1 => Some(Priority::Autonomous),
            2 => Some(Priority::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Generate,
    Chat,
    ChatWithTools,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The on-disk request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub id: String,
    pub kind: RequestKind,
    pub payload: Value,
    pub priority: Priority,
    pub submitted_at: String,
    pub status: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Observable state of a submitted request.
#[derive(Debug, Clone)]
pub enum QueueStatus {
    Pending { position: usize },
    Processing,
    Completed(Value),
    Failed(String),
    NotFound,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request {0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("request {id} failed: {error}")]
    Failed { id: String, error: String },
    #[error("request {0} not found")]
    NotFound(String),
    #[error("an autonomous request is already in progress")]
    AlreadyInProgress,
}

// Submission ids must be strictly increasing even within one microsecond.
static LAST_SUBMIT_US: AtomicI64 = AtomicI64::new(0);

fn next_submit_us() -> i64 {
    let now = Utc::now().timestamp_micros();
    LAST_SUBMIT_US
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}

/// File-based queue rooted at `<state_dir>/queues/ollama`.
#[derive(Clone)]
pub struct LlmQueue {
    root: PathBuf,
}

impl LlmQueue {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["pending", "processing", "completed", "failed"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("cannot create queue directory {:?}", root.join(sub)))?;
        }
        Ok(Self { root })
    }

    fn dir(&self, state: RequestState) -> PathBuf {
        match state {
            RequestState::Pending => self.root.join("pending"),
            RequestState::Processing => self.root.join("processing"),
            RequestState::Completed => self.root.join("completed"),
            RequestState::Failed => self.root.join("failed"),
        }
    }

    /// Submit a request; returns its id. `{submit_us}_{priority}` so the
    /// worker can recover both sort keys from the filename alone.
    pub fn submit(&self, kind: RequestKind, payload: Value, priority: Priority) -> Result<String> {
        let id = format!("{}_{}", next_submit_us(), priority as u8);
        let request = LlmRequest {
            id: id.clone(),
            kind,
            payload,
            priority,
            submitted_at: Utc::now().to_rfc3339(),
            status: RequestState::Pending,
            result: None,
            error: None,
        };

        let path = self.dir(RequestState::Pending).join(format!("{}.json", id));
        std::fs::write(&path, serde_json::to_string_pretty(&request)?)
            .with_context(|| format!("cannot write queue request {:?}", path))?;
        debug!("queued llm request {} ({:?})", id, priority);
        Ok(id)
    }

    /// Pending ids sorted by (priority, submission time).
    fn sorted_pending(&self) -> Vec<String> {
        let mut ids: Vec<(u8, i64, String)> = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.dir(RequestState::Pending)) else {
            return Vec::new();
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some((us, prio)) = parse_id(stem) {
                ids.push((prio, us, stem.to_string()));
            }
        }
        ids.sort();
        ids.into_iter().map(|(_, _, id)| id).collect()
    }

    pub fn status(&self, id: &str) -> QueueStatus {
        let file = format!("{}.json", id);

        if self.dir(RequestState::Pending).join(&file).exists() {
            let position = self
                .sorted_pending()
                .iter()
                .position(|p| p == id)
                .map(|p| p + 1)
                .unwrap_or(0);
            return QueueStatus::Pending { position };
        }
        if self.dir(RequestState::Processing).join(&file).exists() {
            return QueueStatus::Processing;
        }
        if let Ok(content) = std::fs::read_to_string(self.dir(RequestState::Completed).join(&file)) {
            if let Ok(request) = serde_json::from_str::<LlmRequest>(&content) {
                return QueueStatus::Completed(request.result.unwrap_or(Value::Null));
            }
        }
        if let Ok(content) = std::fs::read_to_string(self.dir(RequestState::Failed).join(&file)) {
            if let Ok(request) = serde_json::from_str::<LlmRequest>(&content) {
                return QueueStatus::Failed(request.error.unwrap_or_else(|| "unknown".into()));
            }
        }
        QueueStatus::NotFound
    }

    /// Whether any pending or processing request carries this priority.
    pub fn has_priority_in_flight(&self, priority: Priority) -> bool {
        for state in [RequestState::Pending, RequestState::Processing] {
            let Ok(entries) = std::fs::read_dir(self.dir(state)) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Some((_, prio)) = parse_id(stem) {
                        if prio == priority as u8 {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Poll until the request completes or the deadline passes. Status
    /// transitions are reported through the optional progress callback.
    pub async fn wait(
        &self,
        id: &str,
        timeout: Duration,
        poll_interval: Duration,
        progress: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<Value, QueueError> {
        let started = std::time::Instant::now();
        let mut last_report = String::new();

        while started.elapsed() < timeout {
            match self.status(id) {
                QueueStatus::Completed(result) => return Ok(result),
                QueueStatus::Failed(error) => {
                    return Err(QueueError::Failed {
                        id: id.to_string(),
                        error,
                    })
                }
                QueueStatus::NotFound => return Err(QueueError::NotFound(id.to_string())),
                QueueStatus::Pending { position } => {
                    let report = format!("Queued (position {})", position);
                    if report != last_report {
                        if let Some(progress) = progress {
                            progress(&report);
                        }
                        last_report = report;
                    }
                }
                QueueStatus::Processing => {
                    if last_report != "Processing..." {
                        if let Some(progress) = progress {
                            progress("Processing...");
                        }
                        last_report = "Processing...".to_string();
                    }
                }
            }
            tokio::time::sleep(poll_interval).await;
        }

        Err(QueueError::Timeout(id.to_string(), timeout))
    }

    /// Remove completed/failed requests older than `max_age`. The worker
    /// runs this once on startup.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let cutoff_us = Utc::now().timestamp_micros() - max_age.as_micros() as i64;
        let mut removed = 0;

        for state in [RequestState::Completed, RequestState::Failed] {
            let Ok(entries) = std::fs::read_dir(self.dir(state)) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(stem) = name.strip_suffix(".json") else {
                    continue;
                };
                if let Some((us, _)) = parse_id(stem) {
                    if us < cutoff_us && std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            info!("evicted {} old queue requests", removed);
        }
        removed
    }

    pub fn stats(&self) -> Value {
        let count = |state: RequestState| {
            std::fs::read_dir(self.dir(state))
                .map(|entries| entries.count())
                .unwrap_or(0)
        };
        json!({
            "pending": count(RequestState::Pending),
            "processing": count(RequestState::Processing),
            "completed": count(RequestState::Completed),
            "failed": count(RequestState::Failed),
        })
    }

    /// Take the highest-priority pending request into `processing/`.
    fn claim_next(&self) -> Option<LlmRequest> {
        let next_id = self.sorted_pending().into_iter().next()?;
        let pending_path = self
            .dir(RequestState::Pending)
            .join(format!("{}.json", next_id));
        let processing_path = self
            .dir(RequestState::Processing)
            .join(format!("{}.json", next_id));

        let content = std::fs::read_to_string(&pending_path).ok()?;
        let mut request: LlmRequest = serde_json::from_str(&content).ok()?;
        request.status = RequestState::Processing;

        // Atomic rename claims the file; a lost race just means another
        // worker (or a restart) got there first.
        if std::fs::rename(&pending_path, &processing_path).is_err() {
            return None;
        }
        let _ = std::fs::write(
            &processing_path,
            serde_json::to_string_pretty(&request).ok()?,
        );
        Some(request)
    }

    fn finish(&self, mut request: LlmRequest, outcome: Result<Value, String>) {
        let processing_path = self
            .dir(RequestState::Processing)
            .join(format!("{}.json", request.id));

        let final_state = match outcome {
            Ok(result) => {
                request.status = RequestState::Completed;
                request.result = Some(result);
                RequestState::Completed
            }
            Err(error) => {
                request.status = RequestState::Failed;
                request.error = Some(error);
                RequestState::Failed
            }
        };

        let final_path = self.dir(final_state).join(format!("{}.json", request.id));
        if let Ok(content) = serde_json::to_string_pretty(&request) {
            let _ = std::fs::write(&final_path, content);
        }
        let _ = std::fs::remove_file(&processing_path);
    }
}

fn parse_id(stem: &str) -> Option<(i64, u8)> {
    let (us, prio) = stem.split_once('_')?;
    Some((us.parse().ok()?, prio.parse().ok()?))
}

/// The single worker draining the queue against one backend.
pub struct QueueWorker {
    queue: LlmQueue,
    backend: Arc<dyn InferenceBackend>,
    retention: Duration,
}

impl QueueWorker {
    pub fn new(queue: LlmQueue, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            queue,
            backend,
            retention: Duration::from_secs(3600),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Run until the shutdown signal flips. The in-flight request is always
    /// finished before stopping.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("llm queue worker started");
        self.queue.evict_older_than(self.retention);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(request) = self.queue.claim_next() {
                let id = request.id.clone();
                debug!("processing llm request {}", id);
                let outcome = self.dispatch(&request).await.map_err(|e| format!("{:#}", e));
                self.queue.finish(request, outcome);
                debug!("finished llm request {}", id);
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("llm queue worker stopped");
    }

    async fn dispatch(&self, request: &LlmRequest) -> Result<Value> {
        match request.kind {
            RequestKind::Generate => {
                let payload = &request.payload;
                let mut generate = GenerateRequest::new(
                    payload["prompt"].as_str().unwrap_or(""),
                    payload["model"].as_str().unwrap_or(""),
                );
                if let Some(system) = payload["system"].as_str() {
                    generate = generate.with_system(system);
                }
                if let Some(temperature) = payload["temperature"].as_f64() {
                    generate = generate.with_temperature(temperature as f32);
                }
                if let Some(max_tokens) = payload["max_tokens"].as_u64() {
                    generate = generate.with_max_tokens(max_tokens as u32);
                }
                let text = self.backend.generate(generate).await?;
                Ok(json!({"response": text}))
            }
            RequestKind::Chat | RequestKind::ChatWithTools => {
                let messages: Vec<Message> =
                    serde_json::from_value(request.payload["messages"].clone())
                        .context("chat payload missing messages")?;
                let tools: Vec<Value> = request.payload["tools"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let model = request.payload["model"].as_str().unwrap_or("");
                let temperature = request.payload["temperature"].as_f64().unwrap_or(0.3) as f32;

                let outcome = self
                    .backend
                    .chat_with_tools(&messages, &tools, model, temperature)
                    .await?;
                Ok(json!({"message": outcome.message}))
            }
        }
    }
}

/// Facade the reasoning layers talk to: queue when possible, direct backend
/// when the queue directory is unwritable (unprivileged operator chat).
pub struct LlmClient {
    queue: Option<LlmQueue>,
    backend: Arc<dyn InferenceBackend>,
    wait_timeout: Duration,
    poll_interval: Duration,
    degraded_logged: AtomicBool,
}

impl LlmClient {
    pub fn new(queue: Option<LlmQueue>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            queue,
            backend,
            wait_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            degraded_logged: AtomicBool::new(false),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    fn note_degraded(&self) {
        if !self.degraded_logged.swap(true, Ordering::SeqCst) {
            warn!("llm queue unavailable, dispatching directly to backend");
        }
    }

    /// Text completion through the queue. Autonomous submissions are
    /// coalesced: a second one while the first is in flight is refused with
    /// `QueueError::AlreadyInProgress`.
    pub async fn generate(&self, request: GenerateRequest, priority: Priority) -> Result<String> {
        let Some(queue) = &self.queue else {
            self.note_degraded();
            return self.backend.generate(request).await;
        };

        if priority == Priority::Autonomous && queue.has_priority_in_flight(priority) {
            return Err(QueueError::AlreadyInProgress.into());
        }

        let payload = json!({
            "prompt": request.prompt.clone(),
            "model": request.model.clone(),
            "system": request.system.clone(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let submitted = queue.submit(RequestKind::Generate, payload, priority);
        let id = match submitted {
            Ok(id) => id,
            Err(e) => {
                debug!("queue submit failed ({:#}), falling back", e);
                self.note_degraded();
                return self.backend.generate(request).await;
            }
        };

        let result = queue
            .wait(&id, self.wait_timeout, self.poll_interval, None)
            .await?;
        result["response"]
            .as_str()
            .map(|s| s.to_string())
            .context("queue result missing response text")
    }

    /// Tool-calling chat through the queue, with the same degradation path.
    pub async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        temperature: f32,
        priority: Priority,
    ) -> Result<ChatOutcome> {
        let Some(queue) = &self.queue else {
            self.note_degraded();
            return self
                .backend
                .chat_with_tools(messages, tools, model, temperature)
                .await;
        };

        let payload = json!({
            "messages": messages,
            "tools": tools,
            "model": model,
            "temperature": temperature,
        });

        let kind = if tools.is_empty() {
            RequestKind::Chat
        } else {
            RequestKind::ChatWithTools
        };

        let id = match queue.submit(kind, payload, priority) {
            Ok(id) => id,
            Err(e) => {
                debug!("queue submit failed ({:#}), falling back", e);
                self.note_degraded();
                return self
                    .backend
                    .chat_with_tools(messages, tools, model, temperature)
                    .await;
            }
        };

        let result = queue
            .wait(&id, self.wait_timeout, self.poll_interval, None)
            .await?;
        let message: Message = serde_json::from_value(result["message"].clone())
            .context("queue result missing chat message")?;
        Ok(ChatOutcome { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_ids_are_strictly_increasing() {
        let a = next_submit_us();
        let b = next_submit_us();
        let c = next_submit_us();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_priority_then_submission_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LlmQueue::open(dir.path()).unwrap();

        let batch = queue
            .submit(RequestKind::Generate, json!({}), Priority::Batch)
            .unwrap();
        let autonomous = queue
            .submit(RequestKind::Generate, json!({}), Priority::Autonomous)
            .unwrap();
        let interactive = queue
            .submit(RequestKind::Generate, json!({}), Priority::Interactive)
            .unwrap();

        let order = queue.sorted_pending();
        assert_eq!(order, vec![interactive, autonomous, batch]);
    }

    #[test]
    fn test_status_reports_queue_position() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LlmQueue::open(dir.path()).unwrap();

        let first = queue
            .submit(RequestKind::Generate, json!({}), Priority::Interactive)
            .unwrap();
        let second = queue
            .submit(RequestKind::Generate, json!({}), Priority::Interactive)
            .unwrap();

        assert!(matches!(
            queue.status(&first),
            QueueStatus::Pending { position: 1 }
        ));
        assert!(matches!(
            queue.status(&second),
            QueueStatus::Pending { position: 2 }
        ));
        assert!(matches!(queue.status("123_0"), QueueStatus::NotFound));
    }

    #[test]
    fn test_autonomous_dedup_detection() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LlmQueue::open(dir.path()).unwrap();

        assert!(!queue.has_priority_in_flight(Priority::Autonomous));
        queue
            .submit(RequestKind::Generate, json!({}), Priority::Autonomous)
            .unwrap();
        assert!(queue.has_priority_in_flight(Priority::Autonomous));
        assert!(!queue.has_priority_in_flight(Priority::Interactive));
    }

    #[test]
    fn test_claim_and_finish_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LlmQueue::open(dir.path()).unwrap();

        let id = queue
            .submit(RequestKind::Generate, json!({"prompt": "x"}), Priority::Interactive)
            .unwrap();

        let claimed = queue.claim_next().unwrap();
        assert_eq!(claimed.id, id);
        assert!(matches!(queue.status(&id), QueueStatus::Processing));

        queue.finish(claimed, Ok(json!({"response": "hello"})));
        match queue.status(&id) {
            QueueStatus::Completed(result) => assert_eq!(result["response"], "hello"),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_eviction_removes_old_requests() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LlmQueue::open(dir.path()).unwrap();

        let id = queue
            .submit(RequestKind::Generate, json!({}), Priority::Batch)
            .unwrap();
        let claimed = queue.claim_next().unwrap();
        queue.finish(claimed, Err("boom".into()));

        assert_eq!(queue.evict_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(queue.evict_older_than(Duration::from_nanos(0)), 1);
        assert!(matches!(queue.status(&id), QueueStatus::NotFound));
    }
}
