use serde::{Deserialize, Serialize};

/// Events emitted by the orchestrator for one run. Strict ordering contract:
///
/// Ready → Delta* → UsageError? → Done
///
/// Exactly one `Ready` first and exactly one `Done` last, on every path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    Ready,
    Delta(String),
    UsageError(String),
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delta(_) => "delta",
            Self::UsageError(_) => "usage_error",
            Self::Done => "done",
        }
    }
}
