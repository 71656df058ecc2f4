//! Answer-generation and embedding model settings.

use serde::{Deserialize, Serialize};

/// Default instructions; `{name}` is replaced with the caller's display name.
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful assistant. You are talking to {name}. \
     Answer using the search tool results when they are relevant.";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Model used for answer generation.
    pub name: String,
    /// Label recorded for embedding usage when the provider reports none.
    pub embedding_model: String,
    /// Base URL of the Responses-compatible API.
    pub api_base: String,
    /// Instruction template. Empty disables instructions.
    pub instructions: String,
    /// Seconds without upstream data before the stream is considered dead.
    pub idle_timeout_secs: u64,
    /// Plain-text retrieval corpus, passages separated by blank lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<String>,
}

impl ModelSettings {
    /// Render the instruction template for one caller.
    pub fn render_instructions(&self, display_name: &str) -> Option<String> {
        if self.instructions.trim().is_empty() {
            return None;
        }
        Some(self.instructions.replace("{name}", display_name))
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "gpt-5-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            idle_timeout_secs: 90,
            corpus_path: None,
        }
    }
}
