//! Per-user conversation log with bounded retention.
//!
//! Turns are append-only rows keyed by `(uid, id)`. Reads return the most
//! recent turns oldest-first; every append is followed by a prune to
//! `max_rows`, and assistant appends opportunistically compact the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::Mutex;
use relay_core::{ConversationTurn, HistoryEntry, Role, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "conversation_memory";

/// Where conversation history comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Local per-user log feeds the composite input.
    #[default]
    Local,
    /// The collaborator keeps history; only a continuity key is stored.
    SessionContinuity,
    /// No local history. Caller-supplied history is still honoured.
    Disabled,
}

impl MemoryMode {
    pub fn from_flags(enabled: bool, session_continuity: bool) -> Self {
        match (enabled, session_continuity) {
            (false, _) => Self::Disabled,
            (true, true) => Self::SessionContinuity,
            (true, false) => Self::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::SessionContinuity => "session_continuity",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub mode: MemoryMode,
    /// Turns used to build the composite input.
    pub limit: usize,
    /// Turns kept per user after every append. `0` disables pruning.
    pub max_rows: usize,
    /// Minimum time between two compactions.
    pub vacuum_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: MemoryMode::Local,
            limit: 10,
            max_rows: 200,
            vacuum_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Owns every conversation turn in the database.
///
/// Cheap to clone; clones share the connection and the compaction lock.
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    config: MemoryConfig,
    compacting: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new(db: Database, config: MemoryConfig) -> Self {
        Self {
            db,
            config,
            compacting: Arc::new(Mutex::new(())),
        }
    }

    pub fn mode(&self) -> MemoryMode {
        self.config.mode
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The most recent `limit` turns for `uid`, oldest first.
    pub fn fetch(&self, uid: &UserId, limit: usize) -> Result<Vec<ConversationTurn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, role, content, created_at FROM {TABLE}
                 WHERE uid = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![uid.as_str(), limit as i64])?;

            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 1, TABLE, "role")?;
                turns.push(ConversationTurn {
                    id: row_helpers::get(row, 0, TABLE, "id")?,
                    uid: uid.clone(),
                    role: row_helpers::parse_enum(&role, TABLE, "role")?,
                    content: row_helpers::get(row, 2, TABLE, "content")?,
                    created_at: row_helpers::get::<Option<String>>(row, 3, TABLE, "created_at")?
                        .unwrap_or_default(),
                });
            }
            turns.reverse();
            Ok(turns)
        })
    }

    /// Append one turn. Empty content is not stored and yields `None`.
    pub fn append(
        &self,
        uid: &UserId,
        role: Role,
        content: &str,
    ) -> Result<Option<i64>, StoreError> {
        if content.is_empty() {
            return Ok(None);
        }
        self.db.with_conn(|conn| {
            // Stamped under the connection lock so timestamps follow row ids.
            let created_at = Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
            conn.execute(
                &format!("INSERT INTO {TABLE} (uid, role, content, created_at) VALUES (?1, ?2, ?3, ?4)"),
                rusqlite::params![uid.as_str(), role.as_str(), content, created_at],
            )?;
            Ok(Some(conn.last_insert_rowid()))
        })
    }

    /// Delete all but the `keep` most recent turns for `uid`.
    ///
    /// `keep == 0` never wipes a log; it is a no-op. Returns deleted rows.
    pub fn prune(&self, uid: &UserId, keep: usize) -> Result<usize, StoreError> {
        if keep == 0 {
            return Ok(0);
        }
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM {TABLE}
                     WHERE uid = ?1 AND id NOT IN (
                         SELECT id FROM {TABLE} WHERE uid = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2
                     )"
                ),
                rusqlite::params![uid.as_str(), keep as i64],
            )?;
            Ok(deleted)
        })
    }

    /// Build the collaborator input for one query.
    ///
    /// Exactly one history source is used: local turns (local mode, when the
    /// user has any), else `fallback`, else nothing. Without history the
    /// prompt is returned unchanged.
    pub fn build_input(&self, uid: &UserId, prompt: &str, fallback: &[HistoryEntry]) -> String {
        let local = match self.config.mode {
            MemoryMode::SessionContinuity => return prompt.to_string(),
            MemoryMode::Disabled => Vec::new(),
            MemoryMode::Local => match self.fetch(uid, self.config.limit) {
                Ok(turns) => turns.iter().map(HistoryEntry::from).collect(),
                Err(e) => {
                    warn!(uid = %uid, error = %e, "memory fetch failed");
                    Vec::new()
                }
            },
        };

        let lines = history_lines(&local);
        if !lines.is_empty() {
            return compose_input(&lines, prompt);
        }
        let lines = history_lines(fallback);
        if !lines.is_empty() {
            return compose_input(&lines, prompt);
        }
        prompt.to_string()
    }

    /// Persist the user's prompt and enforce retention.
    pub fn record_user(&self, uid: &UserId, content: &str) -> Result<(), StoreError> {
        if self.config.mode != MemoryMode::Local {
            return Ok(());
        }
        let _ = self.append(uid, Role::User, content)?;
        let _ = self.prune(uid, self.config.max_rows)?;
        Ok(())
    }

    /// Persist the final answer, enforce retention and maybe compact.
    pub fn record_assistant(&self, uid: &UserId, content: &str) -> Result<(), StoreError> {
        if self.config.mode != MemoryMode::Local {
            return Ok(());
        }
        let _ = self.append(uid, Role::Assistant, content)?;
        let _ = self.prune(uid, self.config.max_rows)?;
        let _ = self.maybe_compact();
        Ok(())
    }

    /// Run `VACUUM` when the last run is older than the configured interval.
    ///
    /// The last run time is the mtime of `<db path>.vacuum_ts`. Concurrent
    /// callers that find a compaction in progress skip. Returns whether a
    /// compaction ran.
    pub fn maybe_compact(&self) -> bool {
        let Some(marker) = self.marker_path() else {
            return false;
        };
        let Some(_guard) = self.compacting.try_lock() else {
            debug!("compaction already running, skipping");
            return false;
        };
        if !compaction_due(&marker, self.config.vacuum_interval, SystemTime::now()) {
            return false;
        }

        match self.db.with_conn(|conn| Ok(conn.execute_batch("VACUUM")?)) {
            Ok(()) => {
                if let Err(e) = std::fs::write(&marker, b"1") {
                    warn!(path = %marker.display(), error = %e, "failed to write compaction marker");
                }
                info!(path = %self.db.path().display(), "memory database compacted");
                true
            }
            Err(e) => {
                warn!(error = %e, "memory compaction failed");
                false
            }
        }
    }

    /// Last collaborator response id recorded for `uid`.
    pub fn continuity_key(&self, uid: &UserId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT response_id FROM session_continuity WHERE uid = ?1")?;
            let mut rows = stmt.query([uid.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_helpers::get(row, 0, "session_continuity", "response_id")?)),
                None => Ok(None),
            }
        })
    }

    pub fn set_continuity_key(&self, uid: &UserId, response_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_continuity (uid, response_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uid) DO UPDATE SET response_id = excluded.response_id,
                                                updated_at = excluded.updated_at",
                rusqlite::params![uid.as_str(), response_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn marker_path(&self) -> Option<PathBuf> {
        if self.db.is_in_memory() {
            return None;
        }
        let mut marker = self.db.path().as_os_str().to_owned();
        marker.push(".vacuum_ts");
        Some(PathBuf::from(marker))
    }
}

/// Trimmed `role: content` lines; entries with a blank side are dropped.
fn history_lines(entries: &[HistoryEntry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let role = entry.role.trim();
            let content = entry.content.trim();
            (!role.is_empty() && !content.is_empty()).then(|| format!("{role}: {content}"))
        })
        .collect()
}

fn compose_input(lines: &[String], prompt: &str) -> String {
    format!(
        "[MEMORY]\n{}\n[/MEMORY]\n\n[USER QUESTION]\n{prompt}",
        lines.join("\n")
    )
}

fn compaction_due(marker: &std::path::Path, interval: Duration, now: SystemTime) -> bool {
    let Ok(last) = std::fs::metadata(marker).and_then(|m| m.modified()) else {
        return true;
    };
    now.duration_since(last).unwrap_or_default() >= interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store_with(config: MemoryConfig) -> MemoryStore {
        MemoryStore::new(Database::in_memory().unwrap(), config)
    }

    fn store() -> MemoryStore {
        store_with(MemoryConfig::default())
    }

    fn uid(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn contents(turns: &[ConversationTurn]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    #[test]
    fn fetch_returns_recent_oldest_first() {
        let store = store();
        let u = uid("u1");
        for i in 0..5 {
            store.append(&u, Role::User, &format!("m{i}")).unwrap();
        }
        let turns = store.fetch(&u, 3).unwrap();
        assert_eq!(contents(&turns), vec!["m2", "m3", "m4"]);
        assert!(turns.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn concurrent_appends_keep_insertion_order() {
        let store = store();
        let u = uid("shared");
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                let u = u.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.append(&u, Role::User, &format!("w{w}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let turns = store.fetch(&u, 10_000).unwrap();
        assert_eq!(turns.len(), 1600);
        assert!(turns.windows(2).all(|w| w[0].id < w[1].id));
        assert!(turns.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        store.prune(&u, 100).unwrap();
        let kept = store.fetch(&u, 10_000).unwrap();
        assert_eq!(kept.len(), 100);
        assert_eq!(kept.last().unwrap().id, turns.last().unwrap().id);
    }

    #[test]
    fn fetch_is_scoped_to_uid() {
        let store = store();
        store.append(&uid("a"), Role::User, "for a").unwrap();
        store.append(&uid("b"), Role::User, "for b").unwrap();
        let turns = store.fetch(&uid("a"), 10).unwrap();
        assert_eq!(contents(&turns), vec!["for a"]);
        assert_eq!(turns[0].uid, uid("a"));
    }

    #[test]
    fn append_skips_empty_content() {
        let store = store();
        assert_eq!(store.append(&uid("u1"), Role::User, "").unwrap(), None);
        assert!(store.fetch(&uid("u1"), 10).unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_most_recent_and_is_idempotent() {
        let store = store();
        let u = uid("u1");
        for i in 0..6 {
            store.append(&u, Role::User, &format!("m{i}")).unwrap();
        }
        assert_eq!(store.prune(&u, 4).unwrap(), 2);
        let once = store.fetch(&u, 100).unwrap();
        assert_eq!(store.prune(&u, 4).unwrap(), 0);
        let twice = store.fetch(&u, 100).unwrap();
        assert_eq!(once, twice);
        assert_eq!(contents(&twice), vec!["m2", "m3", "m4", "m5"]);
    }

    #[test]
    fn prune_zero_keeps_everything() {
        let store = store();
        let u = uid("u1");
        store.append(&u, Role::User, "a").unwrap();
        store.append(&u, Role::Assistant, "b").unwrap();
        assert_eq!(store.prune(&u, 0).unwrap(), 0);
        assert_eq!(store.fetch(&u, 10).unwrap().len(), 2);
    }

    #[test]
    fn retention_keeps_five_most_recent_of_eight() {
        let store = store_with(MemoryConfig {
            max_rows: 5,
            ..Default::default()
        });
        let u = uid("u1");
        for i in 0..8 {
            store.record_user(&u, &format!("turn {i}")).unwrap();
        }
        let turns = store.fetch(&u, 100).unwrap();
        assert_eq!(
            contents(&turns),
            vec!["turn 3", "turn 4", "turn 5", "turn 6", "turn 7"]
        );
    }

    #[test]
    fn build_input_without_history_is_identity() {
        let store = store();
        assert_eq!(store.build_input(&uid("new"), "  test ", &[]), "  test ");
    }

    #[test]
    fn build_input_uses_local_turns_in_order() {
        let store = store();
        let u = uid("u1");
        store.append(&u, Role::User, "hi").unwrap();
        store.append(&u, Role::Assistant, " hello there ").unwrap();
        store.append(&u, Role::User, "what is 2+2?").unwrap();

        let fallback = [HistoryEntry::new("user", "ignored")];
        let input = store.build_input(&u, "and 3+3?", &fallback);
        assert_eq!(
            input,
            "[MEMORY]\nuser: hi\nassistant: hello there\nuser: what is 2+2?\n[/MEMORY]\n\n\
             [USER QUESTION]\nand 3+3?"
        );
    }

    #[test]
    fn build_input_falls_back_when_local_is_empty() {
        let store = store();
        let fallback = [
            HistoryEntry::new("user", "earlier"),
            HistoryEntry::new("", "no role"),
            HistoryEntry::new("assistant", "  "),
            HistoryEntry::new("assistant", "reply"),
        ];
        let input = store.build_input(&uid("u1"), "now", &fallback);
        assert_eq!(
            input,
            "[MEMORY]\nuser: earlier\nassistant: reply\n[/MEMORY]\n\n[USER QUESTION]\nnow"
        );
    }

    #[test]
    fn disabled_mode_ignores_local_but_honours_fallback() {
        let store = store_with(MemoryConfig {
            mode: MemoryMode::Disabled,
            ..Default::default()
        });
        let u = uid("u1");
        store.append(&u, Role::User, "stored").unwrap();
        store.record_user(&u, "not stored").unwrap();
        assert_eq!(store.fetch(&u, 10).unwrap().len(), 1);

        assert_eq!(store.build_input(&u, "q", &[]), "q");
        let fallback = [HistoryEntry::new("user", "web")];
        assert!(store.build_input(&u, "q", &fallback).contains("user: web"));
    }

    #[test]
    fn session_continuity_mode_keeps_only_keys() {
        let store = store_with(MemoryConfig {
            mode: MemoryMode::SessionContinuity,
            ..Default::default()
        });
        let u = uid("u1");
        store.record_user(&u, "hello").unwrap();
        store.record_assistant(&u, "hi").unwrap();
        assert!(store.fetch(&u, 10).unwrap().is_empty());
        let fallback = [HistoryEntry::new("user", "web")];
        assert_eq!(store.build_input(&u, "q", &fallback), "q");

        assert_eq!(store.continuity_key(&u).unwrap(), None);
        store.set_continuity_key(&u, "resp_1").unwrap();
        store.set_continuity_key(&u, "resp_2").unwrap();
        assert_eq!(store.continuity_key(&u).unwrap().as_deref(), Some("resp_2"));
    }

    #[test]
    fn mode_from_flags() {
        assert_eq!(MemoryMode::from_flags(true, false), MemoryMode::Local);
        assert_eq!(MemoryMode::from_flags(true, true), MemoryMode::SessionContinuity);
        assert_eq!(MemoryMode::from_flags(false, true), MemoryMode::Disabled);
    }

    #[test]
    fn in_memory_database_never_compacts() {
        assert!(!store().maybe_compact());
    }

    #[test]
    fn compaction_is_time_gated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.sqlite3");
        let store = MemoryStore::new(Database::open(&path).unwrap(), MemoryConfig::default());

        assert!(store.maybe_compact());
        assert!(dir.path().join("memory.sqlite3.vacuum_ts").exists());
        assert!(!store.maybe_compact());
    }

    #[test]
    fn compaction_skips_while_another_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(
            Database::open(&dir.path().join("memory.sqlite3")).unwrap(),
            MemoryConfig::default(),
        );
        let other = store.clone();
        let _held = store.compacting.lock();
        assert!(!other.maybe_compact());
    }

    #[test]
    fn compaction_due_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("db.vacuum_ts");
        let hour = Duration::from_secs(3600);
        assert!(compaction_due(&marker, hour, SystemTime::now()));

        std::fs::write(&marker, b"1").unwrap();
        assert!(!compaction_due(&marker, hour, SystemTime::now()));
        let later = SystemTime::now() + hour + Duration::from_secs(1);
        assert!(compaction_due(&marker, hour, later));
    }

    proptest! {
        #[test]
        fn fetch_matches_append_order(
            messages in proptest::collection::vec("[a-z]{1,8}", 1..30),
            limit in 1usize..40,
        ) {
            let store = store();
            let u = uid("p");
            for (i, m) in messages.iter().enumerate() {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                store.append(&u, role, m).unwrap();
            }
            let turns = store.fetch(&u, limit).unwrap();
            let start = messages.len().saturating_sub(limit);
            let expected: Vec<&str> = messages[start..].iter().map(String::as_str).collect();
            prop_assert_eq!(contents(&turns), expected);
        }

        #[test]
        fn prune_twice_equals_once(count in 0usize..20, keep in 0usize..25) {
            let store = store();
            let u = uid("p");
            for i in 0..count {
                store.append(&u, Role::User, &format!("m{i}")).unwrap();
            }
            store.prune(&u, keep).unwrap();
            let once = store.fetch(&u, 100).unwrap();
            store.prune(&u, keep).unwrap();
            prop_assert_eq!(&once, &store.fetch(&u, 100).unwrap());
            if keep > 0 {
                prop_assert_eq!(once.len(), count.min(keep));
            } else {
                prop_assert_eq!(once.len(), count);
            }
        }
    }
}
