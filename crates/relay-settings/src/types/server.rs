//! HTTP listener and stream transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Emit a comment frame after this long without an event.
    pub idle_keepalive_ms: u64,
    /// Delta fragments longer than this many codepoints are split.
    pub delta_chunk_chars: usize,
    /// Capacity of the producer → transport queue.
    pub channel_capacity: usize,
    /// How long usage accounting may run after the client went away.
    pub cancel_grace_ms: u64,
}

impl ServerSettings {
    pub fn idle_keepalive(&self) -> Duration {
        Duration::from_millis(self.idle_keepalive_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            idle_keepalive_ms: 15_000,
            delta_chunk_chars: 64,
            channel_capacity: 64,
            cancel_grace_ms: 2_000,
        }
    }
}
