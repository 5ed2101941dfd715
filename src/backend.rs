//! Inference Backends
//!
//! The core depends on an abstract backend with a text-completion and a
//! chat-with-tools operation. Two implementations are provided: the native
//! Ollama API and any OpenAI-compatible endpoint (llama.cpp server, vLLM).

use anyhow::{Context, Result};
use async_trait::async_trait;
use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage as OllamaChatMessage};
use ollama_rs::generation::tools::ToolInfo;
use ollama_rs::models::ModelOptions;
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysinfo::System;

/// A chat message in the role/content shape shared by both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role("tool", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// A model-initiated tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
}

/// Result of a chat-with-tools call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub message: Message,
}

impl ChatOutcome {
    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }
}

/// Parameters for a plain text completion.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            system: None,
            temperature: 0.3,
            max_tokens: 2000,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// What the core requires of an inference runtime.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String>;

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        temperature: f32,
    ) -> Result<ChatOutcome>;

    async fn is_available(&self) -> bool;
}

/// Heuristic for the HTTP errors a backend raises when the prompt exceeds
/// the model context. The meta layer resets its history on these.
pub fn is_context_length_error(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err).to_lowercase();
    text.contains("context")
        && (text.contains("too long")
            || text.contains("length")
            || text.contains("exceed")
            || text.contains("overflow"))
}

/// Native Ollama backend over `ollama-rs`, including its tool-calling chat
/// support.
pub struct OllamaBackend {
    client: Ollama,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let trimmed = base_url.trim_end_matches('/');
        let client = match reqwest::Url::parse(trimmed) {
            Ok(url) => {
                let host = format!(
                    "{}://{}",
                    url.scheme(),
                    url.host_str().unwrap_or("localhost")
                );
                Ollama::new(host, url.port().unwrap_or(11434))
            }
            Err(_) => Ollama::default(),
        };
        Self { client }
    }
}

fn to_ollama_message(message: &Message) -> OllamaChatMessage {
    match message.role.as_str() {
        "system" => OllamaChatMessage::system(message.content.clone()),
        "assistant" => OllamaChatMessage::assistant(message.content.clone()),
        "tool" => OllamaChatMessage::tool(message.content.clone()),
        _ => OllamaChatMessage::user(message.content.clone()),
    }
}

/// Re-shape a function definition for ollama-rs, whose `ToolType` tag is
/// PascalCase.
fn to_tool_info(definition: &Value) -> Option<ToolInfo> {
    let function = definition.get("function")?;
    serde_json::from_value(json!({
        "type": "function",
        "function": function,
    }))
    .ok()
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(OllamaChatMessage::system(system));
        }
        messages.push(OllamaChatMessage::user(request.prompt));

        let options = ModelOptions::default().temperature(request.temperature);
        let chat_request =
            ChatMessageRequest::new(request.model, messages).options(options);

        let response = self
            .client
            .send_chat_messages(chat_request)
            .await
            .map_err(|e| anyhow::anyhow!("ollama generate failed: {e}"))?;

        Ok(response.message.content)
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        temperature: f32,
    ) -> Result<ChatOutcome> {
        let ollama_messages: Vec<OllamaChatMessage> =
            messages.iter().map(to_ollama_message).collect();

        let options = ModelOptions::default().temperature(temperature);
        let mut request =
            ChatMessageRequest::new(model.to_string(), ollama_messages).options(options);

        let tool_infos: Vec<ToolInfo> = tools.iter().filter_map(to_tool_info).collect();
        if !tool_infos.is_empty() {
            request = request.tools(tool_infos);
        }

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| anyhow::anyhow!("ollama chat failed: {e}"))?;

        // Tool-call fields are private in ollama-rs; round-trip through
        // serde to read them.
        let tool_calls = response
            .message
            .tool_calls
            .iter()
            .filter_map(|call| {
                let function = serde_json::to_value(&call.function).ok()?;
                Some(ToolCallRequest {
                    name: function.get("name")?.as_str()?.to_string(),
                    arguments: function
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                })
            })
            .collect();

        Ok(ChatOutcome {
            message: Message {
                role: "assistant".to_string(),
                content: response.message.content,
                tool_calls,
            },
        })
    }

    async fn is_available(&self) -> bool {
        self.client.list_local_models().await.is_ok()
    }
}

/// Backend for llama.cpp server, vLLM, or anything else speaking the
/// OpenAI chat-completions dialect.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }
}

#[async_trait]
impl InferenceBackend for OpenAiCompatBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .request(&body)
            .send()
            .await
            .context("chat completion request failed")?;
        let status = response.status();
        let payload: Value = response.json().await.context("non-JSON completion response")?;

        if !status.is_success() {
            anyhow::bail!(
                "chat completion failed (status {}): {}",
                status,
                payload["error"]["message"].as_str().unwrap_or("unknown error")
            );
        }

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .context("completion response missing content")
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        temperature: f32,
    ) -> Result<ChatOutcome> {
        let body = json!({
            "model": model,
            "messages": messages,
            "tools": tools,
            "temperature": temperature,
        });

        let response = self
            .request(&body)
            .send()
            .await
            .context("tool chat request failed")?;
        let status = response.status();
        let payload: Value = response.json().await.context("non-JSON tool chat response")?;

        if !status.is_success() {
            anyhow::bail!(
                "tool chat failed (status {}): {}",
                status,
                payload["error"]["message"].as_str().unwrap_or("unknown error")
            );
        }

        let message = &payload["choices"][0]["message"];
        // OpenAI encodes tool arguments as a JSON string.
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = match function.get("arguments") {
                            Some(Value::String(s)) => {
                                serde_json::from_str(s).unwrap_or_else(|_| json!({}))
                            }
                            Some(v) => v.clone(),
                            None => json!({}),
                        };
                        Some(ToolCallRequest { name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChatOutcome {
            message: Message {
                role: "assistant".to_string(),
                content: message["content"].as_str().unwrap_or("").to_string(),
                tool_calls,
            },
        })
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Self-diagnostic snapshot attached to user-visible failures: backend
/// availability plus a memory summary, so "the model did not answer" comes
/// with enough context to act on.
pub async fn diagnose(backend: &dyn InferenceBackend, model: &str) -> String {
    let mut lines = vec!["=== INFERENCE BACKEND DIAGNOSTIC ===".to_string()];

    if backend.is_available().await {
        lines.push("Backend is reachable".to_string());
    } else {
        lines.push("Backend is NOT reachable".to_string());
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let total_mb = sys.total_memory() / (1024 * 1024);
    let used_mb = sys.used_memory() / (1024 * 1024);
    lines.push(format!("Memory: {} MB used / {} MB total", used_mb, total_mb));
    lines.push(format!("Configured model: {}", model));

    lines.join("\n")
}
