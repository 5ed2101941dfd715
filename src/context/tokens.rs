//! Token Accounting
//!
//! The accurate tokenizer is optional. When no tokenizer file is
//! configured (or it fails to load) the `len/4` heuristic is used; both
//! counters are first-class and user-visible behaviour never depends on
//! which one is active.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::utils::approx_token_count;

pub enum TokenCounter {
    Accurate(Box<Tokenizer>),
    Heuristic,
}

impl TokenCounter {
    /// Build from an optional tokenizer.json path.
    pub fn from_path(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return TokenCounter::Heuristic;
        };
        match Tokenizer::from_file(path) {
            Ok(tokenizer) => {
                info!("loaded tokenizer from {:?}", path);
                TokenCounter::Accurate(Box::new(tokenizer))
            }
            Err(e) => {
                warn!("could not load tokenizer {:?} ({}), using heuristic", path, e);
                TokenCounter::Heuristic
            }
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Accurate(tokenizer) => tokenizer
                .encode(text, false)
                .map(|encoding| encoding.get_ids().len())
                .unwrap_or_else(|_| approx_token_count(text)),
            TokenCounter::Heuristic => approx_token_count(text),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        TokenCounter::Heuristic
    }
}
