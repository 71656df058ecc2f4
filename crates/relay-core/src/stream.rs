use serde_json::Value;

/// Raw events produced by the answer-generation collaborator.
///
/// Only text fragments and the completion marker matter to the orchestrator;
/// everything else (tool calls, reasoning, lifecycle chatter) arrives as
/// `Other` and is ignored.
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    TextDelta { delta: String },
    /// The collaborator finished. `response` is the nested response payload
    /// when the collaborator delivered one with the completion signal.
    Completed { response: Option<Value> },
    Other { kind: String },
}

impl RawEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta { delta: delta.into() }
    }

    pub fn other(kind: impl Into<String>) -> Self {
        Self::Other { kind: kind.into() }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Pull the id of a response payload, used as the next continuity key.
pub fn response_id(response: &Value) -> Option<&str> {
    response
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}
