use async_trait::async_trait;

use crate::usage::UsageRecord;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("usage record rejected: {0}")]
    Rejected(String),

    #[error("accounting sink unavailable: {0}")]
    Unavailable(String),
}

/// External accounting sink for finished usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError>;
}
