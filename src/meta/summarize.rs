//! Hierarchical Tool-Result Processing
//!
//! Tool outputs are folded into the conversation according to size: small
//! outputs pass through verbatim, medium ones get a one-shot summary, and
//! large ones go through chunked map-reduce. The raw output is always
//! cached so the model can ask for it back by id.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::backend::GenerateRequest;
use crate::queue::{LlmClient, Priority};
use crate::utils::truncate_middle;

/// Outputs below this pass through untouched.
pub const PASSTHROUGH_LIMIT: usize = 5000;
/// Outputs up to this get a single summarisation call.
pub const SINGLE_SHOT_LIMIT: usize = 8000;
/// Chunk width for map-reduce.
pub const CHUNK_CHARS: usize = 8000;
/// More chunks than this and the chunk summaries get a reduce pass.
pub const REDUCE_THRESHOLD: usize = 5;

pub struct ToolResultProcessor {
    client: Arc<LlmClient>,
    model: String,
    cache_dir: PathBuf,
}

impl ToolResultProcessor {
    /// The cache lives under the state directory when writable, otherwise
    /// in the process temp directory.
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>, cache_dir: PathBuf) -> Self {
        let cache_dir = if std::fs::create_dir_all(&cache_dir).is_ok() {
            cache_dir
        } else {
            let fallback = std::env::temp_dir().join("hostwarden_tool_cache");
            let _ = std::fs::create_dir_all(&fallback);
            warn!("tool cache dir unwritable, using {:?}", fallback);
            fallback
        };
        Self {
            client,
            model: model.into(),
            cache_dir,
        }
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Write the raw output to the cache; ids are `{tool}_{timestamp}` so
    /// concurrent writers never collide.
    fn cache_raw(&self, tool_name: &str, raw: &str) -> String {
        let cache_id = format!("{}_{}", tool_name, Utc::now().format("%Y%m%d_%H%M%S%f"));
        let path = self.cache_dir.join(format!("{}.txt", cache_id));
        if let Err(e) = std::fs::write(&path, raw) {
            warn!("could not cache tool output {:?}: {}", path, e);
        }
        cache_id
    }

    pub async fn process(
        &self,
        tool_name: &str,
        raw: &str,
        progress: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> String {
        let size = raw.chars().count();

        if size < PASSTHROUGH_LIMIT {
            debug!("tool result {} chars, passing through", size);
            return raw.to_string();
        }

        let cache_id = self.cache_raw(tool_name, raw);

        if size <= SINGLE_SHOT_LIMIT {
            return self.single_shot(tool_name, raw, size, &cache_id).await;
        }

        self.map_reduce(tool_name, raw, size, &cache_id, progress).await
    }

    async fn summarise(&self, prompt: String) -> Option<String> {
        let request = GenerateRequest::new(prompt, &self.model).with_temperature(0.1);
        match self.client.generate(request, Priority::Batch).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("tool-result summarisation failed: {:#}", e);
                None
            }
        }
    }

    async fn single_shot(&self, tool_name: &str, raw: &str, size: usize, cache_id: &str) -> String {
        let prompt = format!(
            "Analyze this output from '{}'.\n\n\
             Extract: key findings, errors/warnings, metrics, actionable insights.\n\n\
             Output:\n{}\n\nProvide concise summary (max 600 chars).",
            tool_name, raw
        );

        match self.summarise(prompt).await {
            Some(summary) => format!(
                "[Summary of {}]:\n{}\n\n[Full output: {} chars cached as {}]",
                tool_name, summary, size, cache_id
            ),
            None => truncate_middle(raw, 2000),
        }
    }

    async fn map_reduce(
        &self,
        tool_name: &str,
        raw: &str,
        size: usize,
        cache_id: &str,
        progress: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> String {
        let chunks = chunk_chars(raw, CHUNK_CHARS);
        let num_chunks = chunks.len();
        let mut summaries = Vec::with_capacity(num_chunks);

        for (idx, chunk) in chunks.iter().enumerate() {
            if let Some(progress) = progress {
                progress(&format!("Processing chunk {}/{}...", idx + 1, num_chunks));
            }
            let prompt = format!(
                "Analyze chunk {}/{} from '{}'.\n\n\
                 Extract: key findings, errors/warnings, metrics, insights.\n\n\
                 Chunk:\n{}\n\nConcise summary (max 400 chars).",
                idx + 1,
                num_chunks,
                tool_name,
                chunk
            );
            match self.summarise(prompt).await {
                Some(summary) => summaries.push(format!("[Chunk {}]: {}", idx + 1, summary)),
                None => return truncate_middle(raw, 2000),
            }
        }

        let combined = if summaries.len() > REDUCE_THRESHOLD {
            if let Some(progress) = progress {
                progress(&format!("Synthesizing {} chunk summaries...", summaries.len()));
            }
            let prompt = format!(
                "Synthesize these chunk summaries from '{}':\n\n{}\n\n\
                 Provide unified summary (max 800 chars) covering all key points.",
                tool_name,
                summaries.join("\n")
            );
            self.summarise(prompt)
                .await
                .unwrap_or_else(|| summaries.join("\n"))
        } else {
            summaries.join("\n")
        };

        format!(
            "[Chunked analysis of {}]:\n{}\n\n[Processed {} chunks, {} chars total, cached as {}]",
            tool_name, combined, num_chunks, size, cache_id
        )
    }
}

/// Split on char boundaries into at-most-`n`-char pieces.
pub fn chunk_chars(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(n.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_boundaries() {
        let text = "a".repeat(20_000);
        let chunks = chunk_chars(&text, CHUNK_CHARS);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 8000);
        assert_eq!(chunks[2].len(), 4000);
    }

    #[test]
    fn test_chunking_multibyte_safe() {
        let text = "語".repeat(10);
        let chunks = chunk_chars(&text, 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chars().count(), 3);
    }
}
