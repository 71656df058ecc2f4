use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    uid TEXT,
    run_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_uid ON logs(uid);
CREATE INDEX IF NOT EXISTS idx_logs_run ON logs(run_id);
";

/// A persisted log row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub uid: Option<String>,
    pub run_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Newest rows come first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub uid: Option<String>,
    pub run_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write failures are dropped; logging must never take the caller down.
    fn insert(&self, row: &PendingLog) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, uid, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                row.timestamp,
                row.level,
                row.target,
                row.message,
                row.fields,
                row.uid,
                row.run_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, uid, run_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        let filters = [
            ("level", &q.level),
            ("uid", &q.uid),
            ("run_id", &q.run_id),
        ];
        for (column, value) in filters {
            if let Some(value) = value {
                params.push(value.clone());
                sql.push_str(&format!(" AND {column} = ?{}", params.len()));
            }
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                uid: row.get(6)?,
                run_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct PendingLog {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    uid: Option<String>,
    run_id: Option<String>,
}

/// tracing Layer that forwards warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation ids carried on spans and inherited by their events.
#[derive(Clone, Default)]
struct Correlation {
    uid: Option<String>,
    run_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.uid.is_none() && self.run_id.is_none()
    }

    fn fill_from(&mut self, parent: &Correlation) {
        if self.uid.is_none() {
            self.uid.clone_from(&parent.uid);
        }
        if self.run_id.is_none() {
            self.run_id.clone_from(&parent.run_id);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    ids: Correlation,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        let _ = self.fields.insert(field.name().to_string(), value);
    }

    fn put_str(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "uid" => self.ids.uid = Some(value),
            "run_id" => self.ids.run_id = Some(value),
            _ => self.put(field, Value::String(value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "uid" | "run_id" => text.trim_matches('"').to_string(),
            _ => text,
        };
        self.put_str(field, text);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(ids) = span.extensions().get::<Correlation>() {
                    visitor.ids.fill_from(ids);
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&PendingLog {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            uid: visitor.ids.uid,
            run_id: visitor.ids.run_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink_in(dir: &tempfile::TempDir) -> Arc<SqliteLogSink> {
        Arc::new(SqliteLogSink::new(&dir.path().join("logs.sqlite3")).unwrap())
    }

    fn row(level: &str, message: &str, uid: Option<&str>) -> PendingLog {
        PendingLog {
            timestamp: "2026-02-14T12:00:00Z".into(),
            level: level.into(),
            target: "relay_engine::orchestrator".into(),
            message: message.into(),
            fields: None,
            uid: uid.map(str::to_string),
            run_id: None,
        }
    }

    #[test]
    fn insert_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        sink.insert(&row("WARN", "usage sink rejected", Some("u1")));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_filters_by_level_and_uid() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        sink.insert(&row("WARN", "a", Some("u1")));
        sink.insert(&row("ERROR", "b", Some("u1")));
        sink.insert(&row("ERROR", "c", Some("u2")));

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 2);

        let u1_errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                uid: Some("u1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(u1_errors.len(), 1);
        assert_eq!(u1_errors[0].message, "b");
    }

    #[test]
    fn query_limit_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        for i in 0..10 {
            sink.insert(&row("WARN", &format!("msg {i}"), None));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_warn_with_span_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("run", uid = "u42", run_id = "run_1");
            let _guard = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(attempt = 2_u64, "usage sink rejected record");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        let record = &rows[0];
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message, "usage sink rejected record");
        assert_eq!(record.uid.as_deref(), Some("u42"));
        assert_eq!(record.run_id.as_deref(), Some("run_1"));
        assert!(record.fields.as_deref().unwrap().contains("\"attempt\":2"));
    }

    #[test]
    fn event_fields_override_span_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("run", uid = "outer");
            let _guard = span.enter();
            tracing::error!(uid = "inner", "boom");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].uid.as_deref(), Some("inner"));
        assert_eq!(rows[0].run_id, None);
    }
}
