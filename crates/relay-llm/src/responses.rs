use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use relay_core::errors::GatewayError;
use relay_core::provider::{AnswerGenerator, QueryHandle, QueryRequest};
use relay_core::stream::RawEvent;

use crate::search::SimilaritySearch;
use crate::sse::SseStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const RETRIEVAL_TOP_K: usize = 4;

/// Streams answers from an OpenAI Responses-compatible endpoint.
pub struct ResponsesGenerator {
    client: Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    idle_timeout: Duration,
    retrieval: Option<Arc<dyn SimilaritySearch>>,
}

impl ResponsesGenerator {
    pub fn new(
        api_key: SecretString,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retrieval: None,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Ground answers on passages retrieved for each query.
    pub fn with_retrieval(mut self, search: Arc<dyn SimilaritySearch>) -> Self {
        self.retrieval = Some(search);
        self
    }

    async fn instructions_for(&self, request: &QueryRequest) -> Option<String> {
        let Some(search) = &self.retrieval else {
            return request.instructions.clone();
        };
        let hits = match search
            .search(&request.input, RETRIEVAL_TOP_K, &request.embedding_usage)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "retrieval failed, answering without context");
                return request.instructions.clone();
            }
        };
        if hits.is_empty() {
            return request.instructions.clone();
        }

        let mut text = request.instructions.clone().unwrap_or_default();
        text.push_str("\n\n[SEARCH RESULTS]\n");
        for (i, hit) in hits.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, hit.text.trim()));
        }
        text.push_str("[/SEARCH RESULTS]");
        Some(text)
    }

    fn request_body(&self, request: &QueryRequest, instructions: Option<String>) -> Value {
        let mut body = json!({
            "model": self.model,
            "input": request.input,
            "stream": true,
        });
        if let Some(instructions) = instructions {
            body["instructions"] = Value::String(instructions);
        }
        if let Some(previous) = &request.continuity_key {
            body["previous_response_id"] = Value::String(previous.clone());
        }
        body
    }
}

#[async_trait]
impl AnswerGenerator for ResponsesGenerator {
    fn name(&self) -> &str {
        "openai-responses"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn start(&self, request: QueryRequest) -> Result<Box<dyn QueryHandle>, GatewayError> {
        let instructions = self.instructions_for(&request).await;
        let body = self.request_body(&request, instructions);

        let resp = self
            .client
            .post(format!("{}/responses", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(match GatewayError::from_status(status, body) {
                GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
                other => other,
            });
        }

        debug!("response stream opened");
        Ok(Box::new(ResponsesHandle {
            stream: SseStream::new(resp.bytes_stream(), self.idle_timeout),
        }))
    }
}

struct ResponsesHandle {
    stream: SseStream,
}

#[async_trait]
impl QueryHandle for ResponsesHandle {
    async fn next_event(&mut self) -> Option<Result<RawEvent, GatewayError>> {
        self.stream.next().await
    }

    fn context_usage(&self) -> Option<Value> {
        self.stream
            .completed_response()
            .and_then(|r| r.get("usage"))
            .cloned()
    }

    async fn final_response(&mut self) -> Option<Value> {
        self.stream.completed_response().cloned()
    }
}
