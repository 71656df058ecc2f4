//! Client compatibility layer.
//!
//! Older clients send `session_id` / `displayName`; everything is folded onto
//! the canonical keys before validation.

use serde_json::{json, Map, Value};

use relay_core::messages::ConversationTurn;

/// Alternate request keys and the canonical key each stands for.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("session_id", "uid"),
    ("sessionId", "uid"),
    ("displayName", "name"),
    ("display_name", "name"),
];

/// Fold aliased keys onto canonical ones. A canonical key that is already
/// present wins and the alias is dropped.
pub fn normalize_request(body: &Value) -> Value {
    let Some(obj) = body.as_object() else {
        return body.clone();
    };
    let mut result: Map<String, Value> = obj.clone();
    for &(alias, canonical) in FIELD_ALIASES {
        let Some(value) = result.remove(alias) else {
            continue;
        };
        let present = result.get(canonical).is_some_and(|v| !v.is_null());
        if !present {
            let _ = result.insert(canonical.to_string(), value);
        }
    }
    Value::Object(result)
}

/// Wire shape of one stored turn.
pub fn turn_to_wire(turn: &ConversationTurn) -> Value {
    json!({
        "role": turn.role.as_str(),
        "content": turn.content,
        "createdAt": turn.created_at,
    })
}
