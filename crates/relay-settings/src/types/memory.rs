//! Conversation memory settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySettings {
    /// Keep a local per-user conversation log.
    pub enabled: bool,
    /// Delegate history to the collaborator's session mechanism instead of
    /// the local log. Only a continuity key is stored locally.
    pub session_continuity: bool,
    /// SQLite database path. Empty means `~/.relay/memory.sqlite3`.
    pub db_path: String,
    /// Turns fetched per query.
    pub limit: usize,
    /// Turns retained per user after each append.
    pub max_rows: usize,
    /// Minimum hours between two compactions.
    pub vacuum_interval_hours: u64,
}

impl MemorySettings {
    /// Resolve the database path, falling back to the home directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_empty() {
            crate::relay_home().join("memory.sqlite3")
        } else {
            PathBuf::from(&self.db_path)
        }
    }

    /// Compaction interval, never shorter than one hour.
    pub fn vacuum_interval(&self) -> Duration {
        Duration::from_secs(self.vacuum_interval_hours.max(1) * 3600)
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            session_continuity: false,
            db_path: String::new(),
            limit: 10,
            max_rows: 200,
            vacuum_interval_hours: 24,
        }
    }
}
