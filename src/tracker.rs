//! Issue Tracker
//!
//! Deduplicates problem reports into stable issues and tracks their
//! lifecycle: open -> investigating -> fixing -> resolved -> closed.
//! Closed issues are archived to an append-only log and evicted from the
//! live store.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::Severity;
use crate::store::{Collection, VectorRecord, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Investigating,
    Fixing,
    Resolved,
    Closed,
}

impl IssueStatus {
    fn rank(&self) -> u8 {
        match self {
            IssueStatus::Open => 0,
            IssueStatus::Investigating => 1,
            IssueStatus::Fixing => 2,
            IssueStatus::Resolved => 3,
            IssueStatus::Closed => 4,
        }
    }

    /// Transitions are monotonic; `closed` is terminal and only reachable
    /// through `close()`.
    pub fn can_transition_to(&self, next: IssueStatus) -> bool {
        if *self == IssueStatus::Closed {
            return false;
        }
        if next == IssueStatus::Closed {
            return *self == IssueStatus::Resolved;
        }
        next.rank() >= self.rank()
    }
}

/// A time-stamped investigation or action record on an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueNote {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub host: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub investigations: Vec<IssueNote>,
    #[serde(default)]
    pub actions: Vec<IssueNote>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

pub struct IssueTracker {
    live_path: PathBuf,
    archive_path: PathBuf,
    issues: HashMap<String, Issue>,
    vectors: Option<Arc<VectorStore>>,
}

impl IssueTracker {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        let log_dir = state_dir.join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("cannot create tracker log dir {:?}", log_dir))?;

        let live_path = state_dir.join("issues.json");
        let issues = if live_path.exists() {
            let content = std::fs::read_to_string(&live_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("corrupt issue store ({}), starting empty", e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            live_path,
            archive_path: log_dir.join("closed_issues.jsonl"),
            issues,
            vectors: None,
        })
    }

    pub fn with_vectors(mut self, vectors: Arc<VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    fn persist(&self) -> Result<()> {
        std::fs::write(&self.live_path, serde_json::to_string_pretty(&self.issues)?)?;
        Ok(())
    }

    /// Mirror the issue into the vector store for semantic recall. Failures
    /// never abort the tracker operation.
    async fn mirror(&self, issue: &Issue) {
        let Some(vectors) = &self.vectors else {
            return;
        };
        let record = VectorRecord {
            id: issue.id.clone(),
            document: format!("{}\n{}", issue.title, issue.description),
            metadata: serde_json::to_value(issue).unwrap_or(Value::Null),
            embedding: None,
        };
        if let Err(e) = vectors.upsert(Collection::Issues, record).await {
            warn!("issue mirror failed: {:#}", e);
        }
    }

    pub async fn create(
        &mut self,
        host: &str,
        title: &str,
        description: &str,
        severity: Severity,
        source: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let issue = Issue {
            id: id.clone(),
            host: host.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            severity,
            status: IssueStatus::Open,
            created_at: now,
            updated_at: now,
            source: source.to_string(),
            investigations: Vec::new(),
            actions: Vec::new(),
            resolution: None,
            closed_at: None,
        };

        self.mirror(&issue).await;
        self.issues.insert(id.clone(), issue);
        self.persist()?;
        info!("opened issue {} ({})", id, title);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn list(&self, host: Option<&str>, status: Option<IssueStatus>) -> Vec<&Issue> {
        self.issues
            .values()
            .filter(|issue| host.map(|h| issue.host == h).unwrap_or(true))
            .filter(|issue| status.map(|s| issue.status == s).unwrap_or(true))
            .collect()
    }

    /// Find an open issue whose title overlaps the candidate title: more
    /// than half the candidate's tokens must appear in the existing title.
    pub fn find_similar(&self, host: &str, title: &str) -> Option<&Issue> {
        let title_lower = title.to_lowercase();
        let candidate_tokens: Vec<&str> = title_lower.split_whitespace().collect();
        if candidate_tokens.is_empty() {
            return None;
        }

        self.list(Some(host), Some(IssueStatus::Open))
            .into_iter()
            .find(|issue| {
                let existing = issue.title.to_lowercase();
                let existing_tokens: std::collections::HashSet<&str> =
                    existing.split_whitespace().collect();
                let matched = candidate_tokens
                    .iter()
                    .filter(|t| existing_tokens.contains(**t))
                    .count();
                matched as f64 / candidate_tokens.len() as f64 > 0.5
            })
    }

    /// Update status and/or append a time-stamped investigation or action.
    pub async fn update(
        &mut self,
        id: &str,
        status: Option<IssueStatus>,
        investigation: Option<Value>,
        action: Option<Value>,
    ) -> Result<bool> {
        let Some(issue) = self.issues.get_mut(id) else {
            return Ok(false);
        };

        if let Some(next) = status {
            if !issue.status.can_transition_to(next) {
                anyhow::bail!(
                    "invalid status transition {:?} -> {:?} for issue {}",
                    issue.status,
                    next,
                    id
                );
            }
            issue.status = next;
        }

        let now = Utc::now();
        if let Some(detail) = investigation {
            issue.investigations.push(IssueNote {
                timestamp: now,
                detail,
            });
        }
        if let Some(detail) = action {
            issue.actions.push(IssueNote {
                timestamp: now,
                detail,
            });
        }
        issue.updated_at = now;

        let snapshot = issue.clone();
        self.mirror(&snapshot).await;
        self.persist()?;
        Ok(true)
    }

    pub async fn resolve(&mut self, id: &str, note: &str) -> Result<bool> {
        let Some(issue) = self.issues.get_mut(id) else {
            return Ok(false);
        };
        if !issue.status.can_transition_to(IssueStatus::Resolved) {
            anyhow::bail!("issue {} cannot be resolved from {:?}", id, issue.status);
        }

        issue.status = IssueStatus::Resolved;
        issue.resolution = Some(note.to_string());
        issue.updated_at = Utc::now();

        let snapshot = issue.clone();
        self.mirror(&snapshot).await;
        self.persist()?;
        info!("resolved issue {}: {}", id, note);
        Ok(true)
    }

    /// Close a resolved issue: stamp, archive, evict from the live store.
    /// Archive failures are logged but never abort the closure.
    pub async fn close(&mut self, id: &str) -> Result<bool> {
        let Some(issue) = self.issues.get(id) else {
            return Ok(false);
        };
        if issue.status != IssueStatus::Resolved {
            return Ok(false);
        }

        let mut issue = match self.issues.remove(id) {
            Some(issue) => issue,
            None => return Ok(false),
        };
        issue.status = IssueStatus::Closed;
        issue.closed_at = Some(Utc::now());

        if let Err(e) = self.archive(&issue) {
            warn!("failed to archive closed issue {}: {:#}", id, e);
        }
        if let Some(vectors) = &self.vectors {
            let _ = vectors.delete(Collection::Issues, id).await;
        }
        self.persist()?;
        info!("closed issue {}", id);
        Ok(true)
    }

    fn archive(&self, issue: &Issue) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)?;
        writeln!(file, "{}", serde_json::to_string(issue)?)?;
        Ok(())
    }

    /// Resolve every open issue whose title/description tokens no longer
    /// appear in any currently detected problem. Returns the count resolved.
    pub async fn auto_resolve_if_fixed(
        &mut self,
        host: &str,
        currently_detected: &[String],
    ) -> Result<usize> {
        let detected_lower: Vec<String> =
            currently_detected.iter().map(|p| p.to_lowercase()).collect();

        let open_ids: Vec<String> = self
            .list(Some(host), Some(IssueStatus::Open))
            .iter()
            .map(|issue| issue.id.clone())
            .collect();

        let mut resolved = 0;
        for id in open_ids {
            let Some(issue) = self.issues.get(&id) else {
                continue;
            };
            let keywords: Vec<String> = format!("{} {}", issue.title, issue.description)
                .to_lowercase()
                .split_whitespace()
                .map(|w| w.to_string())
                .collect();

            let still_present = detected_lower.iter().any(|detected| {
                let detected_words: std::collections::HashSet<&str> =
                    detected.split_whitespace().collect();
                keywords.iter().any(|w| detected_words.contains(w.as_str()))
            });

            if !still_present {
                self.resolve(&id, "Auto-resolved: problem no longer detected").await?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Open a new issue or fold the report into an existing similar one.
    pub async fn track(
        &mut self,
        host: &str,
        title: &str,
        description: &str,
        severity: Severity,
        source: &str,
    ) -> Result<String> {
        if let Some(existing) = self.find_similar(host, title) {
            let id = existing.id.clone();
            self.update(
                &id,
                None,
                Some(json!({"note": "problem re-detected", "description": description})),
                None,
            )
            .await?;
            return Ok(id);
        }
        self.create(host, title, description, severity, source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tracker() -> (tempfile::TempDir, IssueTracker) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = IssueTracker::new(dir.path()).unwrap();
        (dir, tracker)
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "service down", Severity::High, "trigger")
            .await
            .unwrap();

        assert!(tracker
            .update(&id, Some(IssueStatus::Investigating), None, None)
            .await
            .unwrap());
        assert!(tracker
            .update(&id, Some(IssueStatus::Fixing), None, None)
            .await
            .unwrap());
        assert!(tracker.resolve(&id, "restarted nginx").await.unwrap());

        // resolved -> open is forbidden.
        assert!(tracker
            .update(&id, Some(IssueStatus::Open), None, None)
            .await
            .is_err());

        assert!(tracker.close(&id).await.unwrap());
        assert!(tracker.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_close_requires_resolved() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "disk filling", "91% used", Severity::Medium, "trigger")
            .await
            .unwrap();
        assert!(!tracker.close(&id).await.unwrap());
        assert!(tracker.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_closed_issue_archived() {
        let (dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "down", Severity::High, "trigger")
            .await
            .unwrap();
        tracker.resolve(&id, "fixed").await.unwrap();
        tracker.close(&id).await.unwrap();

        let archive =
            std::fs::read_to_string(dir.path().join("logs/closed_issues.jsonl")).unwrap();
        let entry: Issue = serde_json::from_str(archive.lines().next().unwrap()).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.status, IssueStatus::Closed);
        assert!(entry.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_find_similar_matches_created_issue() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "down", Severity::High, "trigger")
            .await
            .unwrap();

        let found = tracker.find_similar("macha", "nginx not running").unwrap();
        assert_eq!(found.id, id);

        // Different host: no match.
        assert!(tracker.find_similar("rhiannon", "nginx not running").is_none());
        // Unrelated title: no match.
        assert!(tracker.find_similar("macha", "disk space exhausted").is_none());
    }

    #[tokio::test]
    async fn test_track_deduplicates() {
        let (_dir, mut tracker) = tracker().await;
        let first = tracker
            .track("macha", "nginx not running", "down", Severity::High, "trigger")
            .await
            .unwrap();
        let second = tracker
            .track("macha", "nginx not running again", "down", Severity::High, "trigger")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(tracker.list(Some("macha"), Some(IssueStatus::Open)).len(), 1);
    }

    #[tokio::test]
    async fn test_auto_resolve_when_problem_gone() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "service down", Severity::High, "trigger")
            .await
            .unwrap();

        let resolved = tracker
            .auto_resolve_if_fixed("macha", &["disk 91%".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, 1);
        assert_eq!(tracker.get(&id).unwrap().status, IssueStatus::Resolved);
        assert_eq!(
            tracker.get(&id).unwrap().resolution.as_deref(),
            Some("Auto-resolved: problem no longer detected")
        );
    }

    #[tokio::test]
    async fn test_auto_resolve_keeps_detected_problems() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "service down", Severity::High, "trigger")
            .await
            .unwrap();

        let resolved = tracker
            .auto_resolve_if_fixed("macha", &["nginx still failing".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(tracker.get(&id).unwrap().status, IssueStatus::Open);
    }

    #[tokio::test]
    async fn test_notes_are_timestamped_and_appended() {
        let (_dir, mut tracker) = tracker().await;
        let id = tracker
            .create("macha", "nginx not running", "down", Severity::High, "trigger")
            .await
            .unwrap();

        tracker
            .update(&id, None, Some(json!({"commands": ["systemctl status nginx"]})), None)
            .await
            .unwrap();
        tracker
            .update(&id, None, None, Some(json!({"action": "restart"})))
            .await
            .unwrap();

        let issue = tracker.get(&id).unwrap();
        assert_eq!(issue.investigations.len(), 1);
        assert_eq!(issue.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut tracker = IssueTracker::new(dir.path()).unwrap();
            tracker
                .create("macha", "nginx not running", "down", Severity::High, "trigger")
                .await
                .unwrap()
        };

        let tracker = IssueTracker::new(dir.path()).unwrap();
        assert!(tracker.get(&id).is_some());
    }
}
