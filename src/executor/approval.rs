//! Approval Queue
//!
//! Proposals that need human consent wait here. Admission is
//! duplicate-suppressed with a Jaccard similarity over stop-word-filtered
//! word sets, so repeated detections of the same problem do not pile up.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::Proposal;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "are", "was", "were", "be", "been", "have", "has", "had",
    ]
    .into_iter()
    .collect();
}

/// Similarity threshold above which a candidate is considered a duplicate.
pub const DEDUP_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub enqueued_at: DateTime<Utc>,
    pub proposal: Proposal,
    pub context: Value,
    pub decision: Decision,
}

/// Jaccard similarity over lowercased, whitespace-tokenised, stop-word
/// filtered word sets.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.trim() == b.trim() && !a.trim().is_empty() {
        return 1.0;
    }

    let tokens = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .filter(|w| !STOP_WORDS.contains(*w))
            .map(|w| w.to_string())
            .collect()
    };

    let set_a = tokens(&a);
    let set_b = tokens(&b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

pub struct ApprovalQueue {
    path: PathBuf,
}

impl ApprovalQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Vec<ApprovalEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn save(&self, entries: &[ApprovalEntry]) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(entries)?)
            .with_context(|| format!("cannot write approval queue {:?}", self.path))?;
        Ok(())
    }

    /// Enqueue unless a pending entry is already too similar on either the
    /// diagnosis or the proposed action. Returns whether a new entry was
    /// admitted; suppression is not an error.
    pub fn enqueue(&self, proposal: Proposal, context: Value) -> Result<bool> {
        let mut entries = self.load();

        for existing in entries.iter().filter(|e| e.decision == Decision::Pending) {
            let diagnosis_similar = !proposal.diagnosis.is_empty()
                && jaccard_similarity(&proposal.diagnosis, &existing.proposal.diagnosis)
                    > DEDUP_THRESHOLD;
            let action_similar = !proposal.proposed_action.is_empty()
                && jaccard_similarity(
                    &proposal.proposed_action,
                    &existing.proposal.proposed_action,
                ) > DEDUP_THRESHOLD;

            if diagnosis_similar || action_similar {
                debug!("suppressing duplicate approval entry for: {}", proposal.diagnosis);
                return Ok(false);
            }
        }

        entries.push(ApprovalEntry {
            enqueued_at: Utc::now(),
            proposal,
            context,
            decision: Decision::Pending,
        });
        self.save(&entries)?;
        Ok(true)
    }

    /// Remove and return the entry at `index`.
    pub fn take(&self, index: usize) -> Result<Option<ApprovalEntry>> {
        let mut entries = self.load();
        if index >= entries.len() {
            return Ok(None);
        }
        let entry = entries.remove(index);
        self.save(&entries)?;
        Ok(Some(entry))
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an executed approval to the archive. Append-only, one JSON
    /// line per approval.
    pub fn archive(&self, archive_path: &PathBuf, entry: &ApprovalEntry, result: &Value) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(archive_path)?;
        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "original_timestamp": entry.enqueued_at.to_rfc3339(),
            "proposal": entry.proposal,
            "context": entry.context,
            "result": result,
        });
        writeln!(file, "{}", record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ActionType, RiskLevel};

    fn proposal(diagnosis: &str, action: &str) -> Proposal {
        Proposal {
            diagnosis: diagnosis.to_string(),
            proposed_action: action.to_string(),
            action_type: ActionType::SystemdRestart,
            risk_level: RiskLevel::Medium,
            commands: vec!["systemctl restart foo".to_string()],
            config_changes: None,
            reasoning: String::new(),
            rollback_plan: String::new(),
        }
    }

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        assert!((jaccard_similarity("restart nginx service", "restart nginx service") - 1.0).abs() < f64::EPSILON);
        assert_eq!(jaccard_similarity("restart nginx", "vacuum journal logs"), 0.0);
    }

    #[test]
    fn test_jaccard_ignores_stop_words() {
        // Stop words contribute nothing to either set.
        let a = "the nginx service is down";
        let b = "nginx service down";
        assert!((jaccard_similarity(a, b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_suppression() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ApprovalQueue::new(dir.path().join("approval_queue.json"));

        assert!(queue
            .enqueue(proposal("nginx service is down", "restart nginx"), Value::Null)
            .unwrap());
        // Same diagnosis: suppressed, not an error.
        assert!(!queue
            .enqueue(proposal("nginx service is down", "restart the nginx daemon"), Value::Null)
            .unwrap());
        assert_eq!(queue.len(), 1);

        // Genuinely different problem: admitted.
        assert!(queue
            .enqueue(
                proposal("disk usage exceeds ninety percent", "vacuum journal logs"),
                Value::Null
            )
            .unwrap());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_take_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ApprovalQueue::new(dir.path().join("approval_queue.json"));
        assert!(queue.take(0).unwrap().is_none());
    }
}
