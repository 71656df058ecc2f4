use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::GatewayError;
use crate::stream::RawEvent;
use crate::usage::EmbeddingUsage;

/// Everything the collaborator needs for one query.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// Composite input: the prompt, possibly prefixed with a memory block.
    pub input: String,
    pub display_name: String,
    /// Rendered system instructions, if the deployment configures any.
    pub instructions: Option<String>,
    /// Prior-session continuity key (e.g. the previous response id).
    pub continuity_key: Option<String>,
    /// Per-run embedding counter; retrieval tools add to it.
    pub embedding_usage: Arc<EmbeddingUsage>,
}

impl QueryRequest {
    pub fn new(input: impl Into<String>, embedding_usage: Arc<EmbeddingUsage>) -> Self {
        Self {
            input: input.into(),
            display_name: "User".to_string(),
            instructions: None,
            continuity_key: None,
            embedding_usage,
        }
    }
}

/// A started query. Events are pulled one at a time; usage can be recovered
/// from the execution context or, as a last resort, by awaiting the fully
/// materialized response.
#[async_trait]
pub trait QueryHandle: Send {
    /// Next raw event; `None` once the collaborator's stream is exhausted.
    async fn next_event(&mut self) -> Option<Result<RawEvent, GatewayError>>;

    /// Usage recorded on the run's execution context, if any.
    fn context_usage(&self) -> Option<Value>;

    /// Await the final response object. Called at most once, after the
    /// event stream ended.
    async fn final_response(&mut self) -> Option<Value>;
}

/// The external answer-generation engine.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn start(&self, request: QueryRequest) -> Result<Box<dyn QueryHandle>, GatewayError>;
}
