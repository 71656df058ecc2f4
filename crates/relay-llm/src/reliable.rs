use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use relay_core::errors::GatewayError;
use relay_core::provider::{AnswerGenerator, QueryHandle, QueryRequest};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Wraps an [`AnswerGenerator`] with retries on `start()`.
///
/// - Retries retryable errors with exponential backoff
/// - Respects `retry_after` hints from rate limit responses
/// - Once a handle is returned the stream is committed; mid-stream failures
///   are never retried since fragments may already be on the wire
pub struct ReliableGenerator<G: AnswerGenerator> {
    inner: G,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<G: AnswerGenerator> ReliableGenerator<G> {
    pub fn new(inner: G, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    fn retry_delay(&self, attempt: u32, error: &GatewayError) -> Duration {
        if let GatewayError::RateLimited { retry_after: Some(hint) } = error {
            return (*hint).min(self.config.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }
}

#[async_trait]
impl<G: AnswerGenerator> AnswerGenerator for ReliableGenerator<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn start(&self, request: QueryRequest) -> Result<Box<dyn QueryHandle>, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.inner.start(request.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.retry_delay(attempt, &e);
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying answer generation"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedGenerator, ScriptedResponse};
    use relay_core::usage::EmbeddingUsage;
    use std::sync::Arc;

    fn request() -> QueryRequest {
        QueryRequest::new("q", Arc::new(EmbeddingUsage::new("m")))
    }

    fn server_error() -> ScriptedResponse {
        ScriptedResponse::start_error(GatewayError::ServerError {
            status: 500,
            body: "internal".into(),
        })
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let reliable = ReliableGenerator::with_defaults(ScriptedGenerator::new(vec![
            ScriptedResponse::text("hello"),
        ]));
        assert!(reliable.start(request()).await.is_ok());
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn retries_on_retryable_error() {
        tokio::time::pause();
        let reliable = ReliableGenerator::new(
            ScriptedGenerator::new(vec![server_error(), server_error(), ScriptedResponse::text("ok")]),
            fast(),
        );
        assert!(reliable.start(request()).await.is_ok());
        assert_eq!(reliable.total_retries(), 2);
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let reliable = ReliableGenerator::new(
            ScriptedGenerator::new(vec![
                ScriptedResponse::start_error(GatewayError::AuthenticationFailed("bad key".into())),
                ScriptedResponse::text("should not reach"),
            ]),
            fast(),
        );
        let err = reliable.start(request()).await.err();
        assert!(matches!(err, Some(GatewayError::AuthenticationFailed(_))));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn max_retries_exhausted() {
        tokio::time::pause();
        let reliable = ReliableGenerator::new(
            ScriptedGenerator::new((0..4).map(|_| server_error()).collect()),
            fast(),
        );
        assert!(reliable.start(request()).await.is_err());
        assert_eq!(reliable.total_retries(), 3);
    }

    #[test]
    fn retry_delay_backoff_and_cap() {
        let reliable = ReliableGenerator::new(
            ScriptedGenerator::new(Vec::new()),
            RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(350),
            },
        );
        let err = GatewayError::NetworkError("reset".into());
        assert_eq!(reliable.retry_delay(0, &err), Duration::from_millis(100));
        assert_eq!(reliable.retry_delay(1, &err), Duration::from_millis(200));
        assert_eq!(reliable.retry_delay(2, &err), Duration::from_millis(350));

        let hinted = GatewayError::RateLimited { retry_after: Some(Duration::from_millis(120)) };
        assert_eq!(reliable.retry_delay(0, &hinted), Duration::from_millis(120));
    }

    #[test]
    fn delegates_identity() {
        let reliable = ReliableGenerator::with_defaults(ScriptedGenerator::echo());
        assert_eq!(reliable.name(), "scripted");
        assert_eq!(reliable.model(), "echo");
    }
}
