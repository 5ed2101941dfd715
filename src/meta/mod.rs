//! Meta Layer
//!
//! The large-model analyser: deep diagnosis on escalation, operator chat,
//! and a tool-calling loop over the read-only tool surface. Also the home
//! of knowledge reflection (distilling successful actions into stored
//! knowledge) and knowledge injection into prompts.

mod summarize;

pub use summarize::{chunk_chars, ToolResultProcessor, PASSTHROUGH_LIMIT, SINGLE_SHOT_LIMIT};

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::{diagnose, is_context_length_error, GenerateRequest, Message};
use crate::executor::{ActionType, Proposal, Reflection, RiskLevel};
use crate::queue::{LlmClient, Priority};
use crate::store::{Confidence, VectorStore};
use crate::tools::{ToolKind, ToolSurface};
use crate::utils::{approx_token_count, extract_json_array, extract_json_object};

/// Iteration bound for the tool-calling loop.
pub const DEFAULT_MAX_ITERATIONS: usize = 30;
/// Message-history token budget before pruning.
pub const DEFAULT_PRUNE_BUDGET: usize = 80_000;
/// Non-system messages kept when pruning.
const PRUNE_KEEP_MESSAGES: usize = 20;

const SYSTEM_PROMPT_TEMPLATE: &str = "You are {AI_NAME}, an autonomous AI system administrator \
responsible for keeping this host healthy. You analyze monitoring data, diagnose problems, and \
propose precise, reversible fixes. You prefer investigation before intervention, never touch \
protected infrastructure services, and explain your reasoning concisely.";

pub struct MetaLayer {
    model: String,
    client: Arc<LlmClient>,
    state_dir: PathBuf,
    system_prompt: String,
    tools: Arc<ToolSurface>,
    processor: ToolResultProcessor,
    vectors: Option<Arc<VectorStore>>,
    max_iterations: usize,
    prune_budget: usize,
}

impl MetaLayer {
    pub fn new(
        model: impl Into<String>,
        client: Arc<LlmClient>,
        state_dir: impl Into<PathBuf>,
        tools: Arc<ToolSurface>,
        agent_name: &str,
    ) -> Self {
        let model = model.into();
        let state_dir = state_dir.into();
        let processor =
            ToolResultProcessor::new(client.clone(), model.clone(), state_dir.join("tool_cache"));
        Self {
            system_prompt: SYSTEM_PROMPT_TEMPLATE.replace("{AI_NAME}", agent_name),
            model,
            client,
            state_dir,
            tools,
            processor,
            vectors: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            prune_budget: DEFAULT_PRUNE_BUDGET,
        }
    }

    pub fn with_vectors(mut self, vectors: Arc<VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    async fn knowledge_context(&self, query: &str) -> String {
        match &self.vectors {
            Some(vectors) => vectors.knowledge_context(query, 3).await,
            None => String::new(),
        }
    }

    /// Deep analysis of an escalated case. Returns a structured analysis
    /// record; on failure the record carries the error plus a backend
    /// self-diagnostic, never an exception.
    pub async fn analyze_escalation(&self, reason: &str, context_text: &str) -> Value {
        let knowledge = self.knowledge_context(reason).await;
        let prompt = format!(
            "{system}\n\nThe review layer has escalated this case for your analysis.\n\n\
             ESCALATION REASON: {reason}\n\nCURRENT SYSTEM CONTEXT:\n{context_text}{knowledge}\n\n\
             Please provide:\n\
             1. Deep analysis of the situation\n\
             2. Root cause assessment\n\
             3. Recommended actions with risk levels\n\
             4. Long-term preventive measures\n\n\
             Respond in JSON format with keys analysis, root_cause, recommended_actions, preventive_measures.",
            system = self.system_prompt,
        );

        let request = GenerateRequest::new(prompt, &self.model)
            .with_system(self.system_prompt.clone())
            .with_temperature(0.3);

        let analysis = match self.client.generate(request, Priority::Autonomous).await {
            Ok(response) => extract_json_object(&response).unwrap_or_else(|| {
                json!({
                    "analysis": crate::utils::truncate_tail(&response, 500),
                    "raw_response": response,
                })
            }),
            Err(e) => {
                warn!("escalation analysis failed: {:#}", e);
                let snapshot = diagnose(self.client.backend().as_ref(), &self.model).await;
                json!({
                    "error": format!("{:#}", e),
                    "diagnostic": snapshot,
                })
            }
        };

        self.log_decision(&json!({
            "type": "escalation_analysis",
            "reason": reason,
            "analysis": analysis,
        }));
        if let Some(vectors) = &self.vectors {
            let _ = vectors
                .record_decision(&format!("escalation: {}", reason), analysis.clone())
                .await;
        }

        analysis
    }

    /// Propose a structured remediation for a diagnosed issue. Unparseable
    /// model output degrades to a high-risk investigation proposal.
    pub async fn propose_fix(&self, issue_description: &str, context: &Value) -> Proposal {
        let knowledge = self.knowledge_context(issue_description).await;

        let previous = context
            .get("previous_investigations")
            .and_then(Value::as_array)
            .map(|investigations| {
                let mut text =
                    String::from("\n\nPREVIOUS INVESTIGATIONS (DO NOT REPEAT THESE):\n");
                for (i, inv) in investigations.iter().take(3).enumerate() {
                    text.push_str(&format!(
                        "\nInvestigation #{}: {}\n",
                        i + 1,
                        crate::utils::truncate_tail(&inv.to_string(), 500)
                    ));
                }
                text.push_str(
                    "\nBased on the investigation results above, propose an ACTUAL FIX, not more investigation.\n",
                );
                text
            })
            .unwrap_or_default();

        let schema = r#"{
    "diagnosis": "brief description of what you think is wrong",
    "proposed_action": "specific action to take",
    "action_type": "one of: systemd_restart, nix_rebuild, config_change, cleanup, investigation",
    "risk_level": "one of: low, medium, high",
    "commands": ["list", "of", "shell", "commands"],
    "config_changes": {"file": "path/to/config", "change": "description"},
    "reasoning": "why this fix should work",
    "rollback_plan": "how to undo if it doesn't work"
}"#;
        let prompt = format!(
            "{system}\n\nTASK: PROPOSE FIX\n\nISSUE TO ADDRESS:\n{issue_description}\n\n\
             SYSTEM CONTEXT:\n{context}{knowledge}{previous}\n\n\
             YOUR RESPONSE MUST BE VALID JSON:\n{schema}\n\n\
             RESPOND WITH ONLY THE JSON, NO OTHER TEXT.",
            system = self.system_prompt,
            context = serde_json::to_string_pretty(context).unwrap_or_default(),
        );

        let request = GenerateRequest::new(prompt, &self.model)
            .with_system(self.system_prompt.clone())
            .with_temperature(0.3);

        match self.client.generate(request, Priority::Autonomous).await {
            Ok(response) => extract_json_object(&response)
                .and_then(|value| serde_json::from_value::<Proposal>(value).ok())
                .unwrap_or_else(|| fallback_proposal("AI response was not in expected format")),
            Err(e) => fallback_proposal(&format!("meta model unavailable: {:#}", e)),
        }
    }

    /// Operator-facing chat with the tool-calling loop. Never raises; hard
    /// failures come back as a structured error message with a backend
    /// diagnostic attached.
    pub async fn chat_with_tools(&self, mut messages: Vec<Message>) -> String {
        if !messages.iter().any(|m| m.role == "system") {
            messages.insert(0, Message::system(self.system_prompt.clone()));
        }

        let tools = ToolKind::definitions();
        let mut reset_attempted = false;

        for iteration in 0..self.max_iterations {
            messages = prune_messages(messages, self.prune_budget);

            let outcome = self
                .client
                .chat_with_tools(&messages, &tools, &self.model, 0.3, Priority::Interactive)
                .await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) if is_context_length_error(&e) && !reset_attempted => {
                    // Context blowout: keep only the system prompt and the
                    // last user message, then try once more.
                    warn!("context too long, resetting history");
                    reset_attempted = true;
                    let system = messages.iter().find(|m| m.role == "system").cloned();
                    let last_user = messages.iter().rev().find(|m| m.role == "user").cloned();
                    messages = system.into_iter().chain(last_user).collect();
                    continue;
                }
                Err(e) => {
                    let snapshot = diagnose(self.client.backend().as_ref(), &self.model).await;
                    return format!(
                        "I could not complete the request: {:#}\n\n{}",
                        e, snapshot
                    );
                }
            };

            if !outcome.has_tool_calls() {
                return outcome.message.content;
            }

            let tool_calls = outcome.message.tool_calls.clone();
            messages.push(outcome.message);

            for call in tool_calls {
                info!("meta tool call: {}({})", call.name, call.arguments);
                let output = self.tools.execute_by_name(&call.name, &call.arguments).await;
                let raw = serde_json::to_string(&output).unwrap_or_default();
                let processed = self.processor.process(&call.name, &raw, None).await;
                messages.push(Message::tool(processed));
            }

            debug!("tool loop iteration {} complete", iteration + 1);
        }

        "Maximum tool calling iterations reached. Unable to complete request.".to_string()
    }

    fn log_decision(&self, record: &Value) {
        let path = self.state_dir.join("decisions.jsonl");
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "record": record,
        });
        let write = || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{}", line)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("could not write decision log: {:#}", e);
        }
    }
}

/// Knowledge reflection: distil 1-2 learnings from a successful action.
/// Only successful outcomes reach this point; storage failures are
/// non-fatal.
#[async_trait]
impl Reflection for MetaLayer {
    async fn reflect(&self, situation: &str, action: &str, outcome: &str) -> Result<()> {
        let Some(vectors) = &self.vectors else {
            return Ok(());
        };

        let prompt = format!(
            "Based on this successful operation, extract key learnings to remember for the future.\n\n\
             SITUATION:\n{situation}\n\nACTION TAKEN:\n{action}\n\nOUTCOME:\n{outcome}\n\n\
             Extract 1-2 specific, actionable learnings. For each learning provide:\n\
             1. topic: A concise topic name\n\
             2. knowledge: The specific insight or pattern (what worked, why, important details)\n\
             3. category: One of: command, pattern, troubleshooting, performance\n\n\
             Respond ONLY with valid JSON:\n\
             [\n  {{\"topic\": \"...\", \"knowledge\": \"...\", \"category\": \"...\", \"confidence\": \"medium\"}}\n]",
        );

        let request = GenerateRequest::new(prompt, &self.model).with_temperature(0.3);
        let response = self.client.generate(request, Priority::Batch).await?;

        let Some(Value::Array(learnings)) = extract_json_array(&response) else {
            debug!("reflection produced no parseable learnings");
            return Ok(());
        };

        for learning in learnings.iter().take(2) {
            let (Some(topic), Some(knowledge)) = (
                learning.get("topic").and_then(Value::as_str),
                learning.get("knowledge").and_then(Value::as_str),
            ) else {
                continue;
            };
            let category = learning
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("experience");
            let confidence = match learning.get("confidence").and_then(Value::as_str) {
                Some("high") => Confidence::High,
                Some("low") => Confidence::Low,
                _ => Confidence::Medium,
            };

            if let Err(e) = vectors
                .store_knowledge(topic, knowledge, category, "experience", confidence, vec![])
                .await
            {
                warn!("could not store learning: {:#}", e);
            }
        }

        Ok(())
    }
}

/// Prune a message history to the token budget: keep the system message
/// plus the most recent conversation window. Pure function of its input.
pub fn prune_messages(messages: Vec<Message>, budget: usize) -> Vec<Message> {
    let total: usize = messages
        .iter()
        .map(|m| approx_token_count(&m.content))
        .sum();
    if total <= budget {
        return messages;
    }

    let system: Vec<Message> = messages.iter().filter(|m| m.role == "system").cloned().collect();
    let conversation: Vec<Message> = messages
        .into_iter()
        .filter(|m| m.role != "system")
        .collect();

    let keep_from = conversation.len().saturating_sub(PRUNE_KEEP_MESSAGES);
    let kept: Vec<Message> = system
        .into_iter()
        .chain(conversation.into_iter().skip(keep_from))
        .collect();

    let after: usize = kept.iter().map(|m| approx_token_count(&m.content)).sum();
    info!(
        "pruned message history: {} -> {} tokens, {} messages kept",
        total,
        after,
        kept.len()
    );
    kept
}

fn fallback_proposal(reason: &str) -> Proposal {
    Proposal {
        diagnosis: "Failed to parse AI response".to_string(),
        proposed_action: "manual investigation required".to_string(),
        action_type: ActionType::Investigation,
        risk_level: RiskLevel::High,
        commands: Vec::new(),
        config_changes: None,
        reasoning: reason.to_string(),
        rollback_plan: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: &str, content: String) -> Message {
        let mut m = Message::user(content);
        m.role = role.to_string();
        m
    }

    #[test]
    fn test_prune_under_budget_is_identity() {
        let messages = vec![
            Message::system("system"),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        let pruned = prune_messages(messages.clone(), 80_000);
        assert_eq!(pruned.len(), messages.len());
    }

    #[test]
    fn test_prune_keeps_system_and_recent_window() {
        let mut messages = vec![message("system", "you are the admin".into())];
        for i in 0..100 {
            messages.push(message("user", format!("question {} {}", i, "x".repeat(4000))));
        }

        let pruned = prune_messages(messages, 10_000);
        assert_eq!(pruned.len(), 21);
        assert_eq!(pruned[0].role, "system");
        // The most recent message survives.
        assert!(pruned.last().unwrap().content.starts_with("question 99"));
    }

    #[test]
    fn test_fallback_proposal_is_high_risk_investigation() {
        let proposal = fallback_proposal("parse error");
        assert_eq!(proposal.action_type, ActionType::Investigation);
        assert_eq!(proposal.risk_level, RiskLevel::High);
        assert!(proposal.commands.is_empty());
    }
}
