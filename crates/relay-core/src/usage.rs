//! Usage reconciliation.
//!
//! Upstream sources disagree on how they name token counts (`input_tokens`
//! vs `prompt_tokens`, ...) and sometimes send nothing at all. Everything is
//! resolved here once, through a fixed alias table, into [`TokenCounts`] and
//! the canonical [`UsageRecord`]. Nothing in this module returns an error:
//! malformed input degrades to zero.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::UserId;

/// Logical token fields, each resolvable under several source names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageField {
    Input,
    Output,
    Total,
}

/// Accepted source names per logical field, in lookup priority order.
pub const FIELD_ALIASES: &[(UsageField, &[&str])] = &[
    (UsageField::Input, &["input_tokens", "prompt_tokens"]),
    (UsageField::Output, &["output_tokens", "completion_tokens"]),
    (UsageField::Total, &["total_tokens"]),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounts {
    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0 && self.total == 0
    }
}

/// Canonical usage record, produced exactly once per completed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub uid: UserId,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub embedding_model: Option<String>,
    pub embedding_input_tokens: u64,
}

/// Per-run embedding counter. A fresh value is created for every run and
/// handed to the collaborator; it is never shared between runs.
#[derive(Debug)]
pub struct EmbeddingUsage {
    tokens: AtomicU64,
    model: Mutex<String>,
}

impl EmbeddingUsage {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            tokens: AtomicU64::new(0),
            model: Mutex::new(default_model.into()),
        }
    }

    /// Account one embedding call. The provider-reported model replaces the
    /// current label when present.
    pub fn add(&self, tokens: u64, model: Option<&str>) {
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            *self.model.lock() = model.to_string();
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn model(&self) -> String {
        self.model.lock().clone()
    }
}

/// Normalize a usage-like object into `(input, output, total)`.
///
/// `None`, non-objects and unparseable fields all count as zero. When no
/// total is given, the total is the sum of the components.
pub fn extract(usage: Option<&Value>) -> TokenCounts {
    let Some(obj) = usage.and_then(Value::as_object) else {
        return TokenCounts::default();
    };

    let mut counts = TokenCounts::default();
    let mut total_given = false;
    for (field, names) in FIELD_ALIASES {
        let raw = names
            .iter()
            .find_map(|name| obj.get(*name).filter(|v| !v.is_null()));
        let value = raw.map(coerce_count).unwrap_or(0);
        match field {
            UsageField::Input => counts.input = value,
            UsageField::Output => counts.output = value,
            UsageField::Total => {
                counts.total = value;
                total_given = raw.is_some();
            }
        }
    }

    if !total_given {
        counts.total = counts.input.saturating_add(counts.output);
    }
    counts
}

/// Combine LLM usage with the run's embedding counter into the canonical record.
pub fn merge(
    uid: &UserId,
    model: &str,
    llm_usage: Option<&Value>,
    embeddings: &EmbeddingUsage,
) -> UsageRecord {
    let counts = extract(llm_usage);
    let embedding_model = Some(embeddings.model()).filter(|m| !m.is_empty());

    UsageRecord {
        uid: uid.clone(),
        model: model.to_string(),
        input_tokens: counts.input,
        output_tokens: counts.output,
        embedding_model,
        embedding_input_tokens: embeddings.tokens(),
    }
}

/// Whether a usage candidate carries anything worth reconciling.
pub fn is_present(usage: Option<&Value>) -> bool {
    match usage {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

fn coerce_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}
