//! Similarity search over a small in-process corpus.
//!
//! Every embedding call made on behalf of a run is counted into that run's
//! [`EmbeddingUsage`]; indexing calls made at startup are not attributed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use relay_core::errors::GatewayError;
use relay_core::usage::EmbeddingUsage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One embedding plus what the provider reported for it.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub prompt_tokens: u64,
    pub model: Option<String>,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, GatewayError>;
}

/// `POST {api_base}/embeddings` against an OpenAI-compatible API.
pub struct OpenAiEmbedder {
    client: Client,
    api_key: SecretString,
    api_base: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: SecretString,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    #[instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Embedding, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidRequest(format!("malformed embedding response: {e}")))?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GatewayError::InvalidRequest("embedding response had no data".into()))?;

        Ok(Embedding {
            vector,
            prompt_tokens: body
                .usage
                .as_ref()
                .map(|u| relay_core::usage::extract(Some(u)).input)
                .unwrap_or(0),
            model: body.model,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: Option<String>,
    usage: Option<Value>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Borrowed view that accounts each call into one run's counter.
pub struct CountingEmbedder<'a> {
    inner: &'a dyn Embedder,
    usage: &'a EmbeddingUsage,
}

impl<'a> CountingEmbedder<'a> {
    pub fn new(inner: &'a dyn Embedder, usage: &'a EmbeddingUsage) -> Self {
        Self { inner, usage }
    }

    pub async fn embed(&self, text: &str) -> Result<Embedding, GatewayError> {
        let embedding = self.inner.embed(text).await?;
        self.usage.add(embedding.prompt_tokens, embedding.model.as_deref());
        Ok(embedding)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
}

/// The retrieval tool surface.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        usage: &EmbeddingUsage,
    ) -> Result<Vec<SearchHit>, GatewayError>;
}

/// Brute-force cosine index. Sized for corpora of a few thousand passages.
pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    passages: Vec<(String, Vec<f32>)>,
}

impl VectorIndex {
    /// Embed every passage up front.
    pub async fn build(
        embedder: Arc<dyn Embedder>,
        passages: impl IntoIterator<Item = String>,
    ) -> Result<Self, GatewayError> {
        let mut indexed = Vec::new();
        for text in passages {
            let embedding = embedder.embed(&text).await?;
            indexed.push((text, embedding.vector));
        }
        debug!(passages = indexed.len(), "vector index built");
        Ok(Self {
            embedder,
            passages: indexed,
        })
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

#[async_trait]
impl SimilaritySearch for VectorIndex {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        usage: &EmbeddingUsage,
    ) -> Result<Vec<SearchHit>, GatewayError> {
        if self.passages.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let query = CountingEmbedder::new(self.embedder.as_ref(), usage)
            .embed(query)
            .await?;

        let mut hits: Vec<SearchHit> = self
            .passages
            .iter()
            .map(|(text, vector)| SearchHit {
                text: text.clone(),
                score: cosine(&query.vector, vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
