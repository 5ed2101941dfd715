//! Review Layer
//!
//! The small-model analyser. Runs on the review ticker (or immediately
//! after a review-worthy trigger batch), classifies system state from the
//! context window, executes safe low-risk actions directly, and decides
//! whether to escalate to the meta layer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::backend::GenerateRequest;
use crate::context::ContextManager;
use crate::event::{Event, EventKind, EventSource, Severity};
use crate::executor::{ActionType, Executor, Proposal, RiskLevel};
use crate::queue::{LlmClient, Priority};
use crate::utils::extract_json_object;

/// One problem the review model reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
}

/// An immediately executable action the review model proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeAction {
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub risk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAnalysis {
    pub status: String,
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub safe_actions: Vec<SafeAction>,
    #[serde(default)]
    pub should_escalate: bool,
    #[serde(default)]
    pub escalation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewStats {
    pub reviews_performed: u64,
    pub escalations_to_meta: u64,
    pub actions_proposed: u64,
    pub actions_executed: u64,
}

pub struct ReviewLayer {
    model: String,
    client: Arc<LlmClient>,
    state_path: PathBuf,
    stats: ReviewStats,
}

impl ReviewLayer {
    pub fn new(model: impl Into<String>, client: Arc<LlmClient>, state_dir: impl Into<PathBuf>) -> Self {
        let state_path = state_dir.into().join("review_state.json");
        let stats = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            model: model.into(),
            client,
            state_path,
            stats,
        }
    }

    pub fn stats(&self) -> &ReviewStats {
        &self.stats
    }

    /// One review pass over the current context window.
    pub async fn review(
        &mut self,
        context: &mut ContextManager,
        executor: &Executor,
        triggered_by: &str,
    ) -> Result<ReviewAnalysis> {
        self.stats.reviews_performed += 1;

        let window = context.get_window(true, true, None).await;
        let prompt = review_prompt(&window, triggered_by);

        let request = GenerateRequest::new(prompt, &self.model)
            .with_temperature(0.3)
            .with_max_tokens(1000);
        let response = self.client.generate(request, Priority::Autonomous).await?;

        let mut analysis = parse_analysis(&response);
        analysis.triggered_by = triggered_by.to_string();
        analysis.timestamp = Utc::now().to_rfc3339();

        context
            .add_event(Event::new(
                EventKind::ReviewCompleted,
                Severity::Low,
                EventSource::Review,
                json!({
                    "summary": analysis.summary,
                    "status": analysis.status,
                    "issues_found": analysis.issues.len(),
                    "message": analysis.summary,
                }),
            ))
            .await;

        if analysis.should_escalate {
            self.stats.escalations_to_meta += 1;
            if analysis.escalation_reason.is_none() {
                analysis.escalation_reason = Some("Complex issue detected".to_string());
            }
        }

        let safe_actions = analysis.safe_actions.clone();
        for action in safe_actions {
            self.stats.actions_proposed += 1;
            if !is_safe_action(&action) {
                // Anything above the safe bar is discarded here; meta gets
                // the case through escalation if it matters.
                continue;
            }
            self.execute_safe_action(&action, context, executor).await;
        }

        self.save_state();
        Ok(analysis)
    }

    async fn execute_safe_action(
        &mut self,
        action: &SafeAction,
        context: &mut ContextManager,
        executor: &Executor,
    ) {
        let Some(proposal) = to_proposal(action) else {
            return;
        };

        self.stats.actions_executed += 1;
        let result = executor.execute(proposal, json!({"source": "review"})).await;

        context
            .add_event(Event::new(
                EventKind::ActionExecuted,
                Severity::Low,
                EventSource::Review,
                json!({
                    "action": action,
                    "result": result.status,
                    "success": result.success,
                    "message": format!(
                        "{}: {:?}",
                        action.description, result.status
                    ),
                }),
            ))
            .await;
    }

    fn save_state(&self) {
        if let Ok(content) = serde_json::to_string_pretty(&self.stats) {
            if let Err(e) = std::fs::write(&self.state_path, content) {
                warn!("could not persist review stats: {}", e);
            }
        }
    }
}

fn review_prompt(window: &str, triggered_by: &str) -> String {
    format!(
        r#"You are a system administrator AI conducting a routine system review.

Triggered by: {triggered_by}

Current System Context:
{window}

Please analyze the system state and provide:

1. Overall Status (normal/degraded/critical)
2. Summary (one paragraph)
3. Issues Detected (list any problems, with severity)
4. Patterns or Trends (what's happening over time?)
5. Safe Actions (actions you can take immediately like restarting services)
6. Should Escalate (true/false - whether to involve the senior AI for complex analysis)
7. Escalation Reason (if escalating, explain why)

Focus on:
- Service health and failures
- Resource usage trends (CPU, memory, disk, I/O)
- Error patterns in logs
- Security concerns
- Performance anomalies

Respond in JSON format with this structure:
{{
  "status": "normal|degraded|critical",
  "summary": "brief summary",
  "issues": [
    {{
      "severity": "low|medium|high|critical",
      "category": "service|resource|security|performance|other",
      "description": "what's wrong",
      "affected_components": ["list"]
    }}
  ],
  "patterns": ["pattern 1", "pattern 2"],
  "safe_actions": [
    {{
      "action_type": "restart_service|cleanup|investigation",
      "description": "what to do",
      "target": "service name or component",
      "risk": "low"
    }}
  ],
  "should_escalate": false,
  "escalation_reason": "explanation if true"
}}
"#
    )
}

/// Parse the model output; a response without usable JSON degrades to an
/// `unknown` record instead of aborting the cycle.
pub fn parse_analysis(response: &str) -> ReviewAnalysis {
    if let Some(value) = extract_json_object(response) {
        if let Ok(analysis) = serde_json::from_value::<ReviewAnalysis>(value.clone()) {
            return analysis;
        }
        // Partially-shaped JSON: salvage the common fields.
        return ReviewAnalysis {
            status: value["status"].as_str().unwrap_or("unknown").to_string(),
            summary: value["summary"].as_str().unwrap_or("").to_string(),
            issues: Vec::new(),
            patterns: Vec::new(),
            safe_actions: Vec::new(),
            should_escalate: value["should_escalate"].as_bool().unwrap_or(false),
            escalation_reason: value["escalation_reason"].as_str().map(String::from),
            raw_response: Some(crate::utils::truncate_tail(response, 500)),
            triggered_by: String::new(),
            timestamp: String::new(),
        };
    }

    ReviewAnalysis {
        status: "unknown".to_string(),
        summary: crate::utils::truncate_tail(response, 500),
        issues: Vec::new(),
        patterns: Vec::new(),
        safe_actions: Vec::new(),
        should_escalate: false,
        escalation_reason: None,
        raw_response: Some(response.to_string()),
        triggered_by: String::new(),
        timestamp: String::new(),
    }
}

/// The safe bar: low risk and one of the three benign action families.
fn is_safe_action(action: &SafeAction) -> bool {
    action.risk == "low"
        && matches!(
            action.action_type.as_str(),
            "investigation" | "restart_service" | "cleanup"
        )
}

fn to_proposal(action: &SafeAction) -> Option<Proposal> {
    let (action_type, commands) = match action.action_type.as_str() {
        "restart_service" => (
            ActionType::SystemdRestart,
            vec![format!("systemctl restart {}", action.target)],
        ),
        "investigation" => (
            ActionType::Investigation,
            vec![
                format!("systemctl status {}", action.target),
                format!("journalctl -u {} -n 50", action.target),
            ],
        ),
        "cleanup" => (
            ActionType::Cleanup,
            vec!["journalctl --vacuum-time=7d".to_string()],
        ),
        _ => return None,
    };

    Some(Proposal {
        diagnosis: action.description.clone(),
        proposed_action: action.description.clone(),
        action_type,
        risk_level: RiskLevel::Low,
        commands,
        config_changes: None,
        reasoning: String::new(),
        rollback_plan: String::new(),
    })
}

impl Drop for ReviewLayer {
    fn drop(&mut self) {
        self.save_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed_analysis() {
        let response = r#"Here is my review:
{
  "status": "degraded",
  "summary": "nginx is down",
  "issues": [{"severity": "high", "category": "service", "description": "nginx failed", "affected_components": ["nginx"]}],
  "patterns": [],
  "safe_actions": [{"action_type": "restart_service", "description": "restart nginx", "target": "nginx", "risk": "low"}],
  "should_escalate": true,
  "escalation_reason": "cascade"
}"#;
        let analysis = parse_analysis(response);
        assert_eq!(analysis.status, "degraded");
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.safe_actions.len(), 1);
        assert!(analysis.should_escalate);
        assert_eq!(analysis.escalation_reason.as_deref(), Some("cascade"));
    }

    #[test]
    fn test_parse_garbage_degrades_gracefully() {
        let long_text = "The system looks mostly fine I think. ".repeat(30);
        let analysis = parse_analysis(&long_text);
        assert_eq!(analysis.status, "unknown");
        assert!(analysis.summary.chars().count() <= 500);
        assert!(analysis.raw_response.is_some());
        assert!(!analysis.should_escalate);
    }

    #[test]
    fn test_safe_action_filter() {
        let safe = SafeAction {
            action_type: "restart_service".into(),
            description: "restart nginx".into(),
            target: "nginx".into(),
            risk: "low".into(),
        };
        assert!(is_safe_action(&safe));

        let risky = SafeAction {
            risk: "medium".into(),
            ..safe.clone()
        };
        assert!(!is_safe_action(&risky));

        let wrong_type = SafeAction {
            action_type: "nix_rebuild".into(),
            risk: "low".into(),
            description: String::new(),
            target: String::new(),
        };
        assert!(!is_safe_action(&wrong_type));
    }

    #[test]
    fn test_to_proposal_command_shapes() {
        let restart = to_proposal(&SafeAction {
            action_type: "restart_service".into(),
            description: "restart nginx".into(),
            target: "nginx".into(),
            risk: "low".into(),
        })
        .unwrap();
        assert_eq!(restart.commands, vec!["systemctl restart nginx"]);
        assert_eq!(restart.action_type, ActionType::SystemdRestart);

        let investigation = to_proposal(&SafeAction {
            action_type: "investigation".into(),
            description: "check nginx".into(),
            target: "nginx".into(),
            risk: "low".into(),
        })
        .unwrap();
        assert_eq!(investigation.commands.len(), 2);
        assert!(investigation.commands[0].starts_with("systemctl status"));
    }
}
