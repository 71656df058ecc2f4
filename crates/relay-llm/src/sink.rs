use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use relay_core::sink::{SinkError, UsageSink};
use relay_core::usage::UsageRecord;

/// Writes each record to the log and accepts it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl UsageSink for TracingSink {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError> {
        info!(
            uid = %record.uid.as_str(),
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            embedding_model = record.embedding_model.as_deref().unwrap_or(""),
            embedding_input_tokens = record.embedding_input_tokens,
            "usage recorded"
        );
        Ok(())
    }
}

/// In-memory sink for tests. Optionally rejects every record.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<UsageRecord>>,
    reject_with: Option<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            reject_with: Some(message.into()),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError> {
        if let Some(message) = &self.reject_with {
            return Err(SinkError::Rejected(message.clone()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
