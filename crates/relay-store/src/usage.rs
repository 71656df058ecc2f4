//! Store-backed accounting sink.

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{SinkError, UsageRecord, UsageSink, UserId};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::StoreError;

/// Summed usage for one user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub runs: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub embedding_input_tokens: u64,
}

/// Persists finished usage records in `usage_records`.
#[derive(Clone)]
pub struct UsageRepo {
    db: Database,
}

impl UsageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, record: &UsageRecord) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_records
                    (uid, model, input_tokens, output_tokens, embedding_model,
                     embedding_input_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.uid.as_str(),
                    record.model,
                    saturating_i64(record.input_tokens),
                    saturating_i64(record.output_tokens),
                    record.embedding_model,
                    saturating_i64(record.embedding_input_tokens),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn totals(&self, uid: &UserId) -> Result<UsageTotals, StoreError> {
        self.db.with_conn(|conn| {
            let totals = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(embedding_input_tokens), 0)
                 FROM usage_records WHERE uid = ?1",
                [uid.as_str()],
                |row| {
                    Ok(UsageTotals {
                        runs: row.get::<_, i64>(0)? as u64,
                        input_tokens: row.get::<_, i64>(1)? as u64,
                        output_tokens: row.get::<_, i64>(2)? as u64,
                        embedding_input_tokens: row.get::<_, i64>(3)? as u64,
                    })
                },
            )?;
            Ok(totals)
        })
    }
}

#[async_trait]
impl UsageSink for UsageRepo {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError> {
        let repo = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || repo.insert(&record))
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?
            .map(|_| ())
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uid: &str, input: u64, output: u64, embedding: u64) -> UsageRecord {
        UsageRecord {
            uid: UserId::from_raw(uid),
            model: "gpt-5-mini".into(),
            input_tokens: input,
            output_tokens: output,
            embedding_model: Some("text-embedding-3-small".into()),
            embedding_input_tokens: embedding,
        }
    }

    #[test]
    fn totals_sum_per_uid() {
        let repo = UsageRepo::new(Database::in_memory().unwrap());
        repo.insert(&record("u1", 10, 5, 3)).unwrap();
        repo.insert(&record("u1", 1, 2, 0)).unwrap();
        repo.insert(&record("u2", 100, 100, 100)).unwrap();

        let totals = repo.totals(&UserId::from_raw("u1")).unwrap();
        assert_eq!(
            totals,
            UsageTotals {
                runs: 2,
                input_tokens: 11,
                output_tokens: 7,
                embedding_input_tokens: 3,
            }
        );
    }

    #[test]
    fn totals_for_unknown_uid_are_zero() {
        let repo = UsageRepo::new(Database::in_memory().unwrap());
        assert_eq!(repo.totals(&UserId::from_raw("nobody")).unwrap(), UsageTotals::default());
    }

    #[tokio::test]
    async fn sink_persists_zero_records() {
        let repo = UsageRepo::new(Database::in_memory().unwrap());
        let sink: &dyn UsageSink = &repo;
        sink.record(&record("u1", 0, 0, 0)).await.unwrap();
        assert_eq!(repo.totals(&UserId::from_raw("u1")).unwrap().runs, 1);
    }
}
