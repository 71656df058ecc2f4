//! Settings type definitions.
//!
//! Every section is `#[serde(default)]`, so a settings file may specify any
//! subset of fields; the rest keep their compiled defaults. Field names are
//! camelCase on disk.

mod memory;
mod model;
mod server;

pub use memory::*;
pub use model::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP listener and stream transport settings.
    pub server: ServerSettings,
    /// Conversation memory store settings.
    pub memory: MemorySettings,
    /// Answer-generation and embedding model settings.
    pub model: ModelSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Persist warn+ events to a SQLite side channel.
    pub persist_warnings: bool,
    /// Path of the log database; `None` puts it next to the memory database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            persist_warnings: true,
            db_path: None,
        }
    }
}
