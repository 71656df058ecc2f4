//! HTTP handlers.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use relay_core::ids::UserId;
use relay_core::messages::HistoryEntry;
use relay_engine::RunRequest;

use crate::compat;
use crate::error::ServerError;
use crate::server::AppState;
use crate::transport;

const DEFAULT_DISPLAY_NAME: &str = "User";
const MAX_MEMORY_LIMIT: usize = 500;

/// Validate a (normalized) chat body into a run request.
pub fn parse_chat_request(body: &Value) -> Result<RunRequest, ServerError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ServerError::BadRequest("request body must be a JSON object".into()))?;

    let uid = required_field(obj.get("uid"), "uid")?;
    let prompt = required_field(obj.get("prompt"), "prompt")?;
    let display_name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME);

    let history = match obj.get("history") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries.iter().filter_map(history_entry).collect(),
        Some(_) => return Err(ServerError::BadRequest("history must be an array".into())),
    };

    Ok(RunRequest::new(uid, prompt)
        .with_display_name(display_name)
        .with_history(history))
}

/// Entries without a string `role` and `content` are skipped.
fn history_entry(value: &Value) -> Option<HistoryEntry> {
    let role = value.get("role")?.as_str()?;
    let content = value.get("content")?.as_str()?;
    Some(HistoryEntry::new(role, content))
}

fn required_field(value: Option<&Value>, name: &str) -> Result<String, ServerError> {
    let text = match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        return Err(ServerError::BadRequest(format!("{name} is required")));
    }
    Ok(text)
}

/// `POST /chat`: validate, then stream the run.
pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ServerError> {
    let Json(body) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let request = parse_chat_request(&compat::normalize_request(&body))?;
    info!(
        uid = %request.uid,
        prompt_chars = request.prompt.chars().count(),
        history = request.history.len(),
        "chat accepted"
    );

    let run = state.orchestrator.run(request);
    let frames = transport::encode(run, state.transport).map(Ok::<_, Infallible>);
    let headers = [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Body::from_stream(frames)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct MemoryParams {
    pub limit: Option<usize>,
}

/// `GET /memory/{uid}?limit=N`: recent turns, oldest first.
pub async fn memory(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    params: Result<Query<MemoryParams>, QueryRejection>,
) -> Result<Json<Value>, ServerError> {
    let Query(params) = params.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let uid = UserId::from_raw(uid);
    if uid.is_blank() {
        return Err(ServerError::BadRequest("uid is required".into()));
    }

    let store = state.orchestrator.memory().clone();
    let limit = params
        .limit
        .unwrap_or(store.config().limit)
        .min(MAX_MEMORY_LIMIT);
    let fetch_uid = uid.clone();
    let turns = tokio::task::spawn_blocking(move || store.fetch(&fetch_uid, limit)).await??;

    Ok(Json(json!({
        "uid": uid.as_str(),
        "turns": turns.iter().map(compat::turn_to_wire).collect::<Vec<_>>(),
    })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "memory": state.orchestrator.memory().mode().as_str(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bad_request(body: Value) -> String {
        match parse_chat_request(&compat::normalize_request(&body)) {
            Err(ServerError::BadRequest(msg)) => msg,
            other => panic!("expected bad request, got {other:?}"),
        }
    }

    #[test]
    fn minimal_request_gets_defaults() {
        let req = parse_chat_request(&json!({"uid": "u1", "prompt": "hi"})).unwrap();
        assert_eq!(req.uid.as_str(), "u1");
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.display_name, "User");
        assert!(req.history.is_empty());
    }

    #[test]
    fn aliases_and_history_are_accepted() {
        let body = json!({
            "session_id": "s-9",
            "displayName": " Ana ",
            "prompt": "next",
            "history": [{"role": "user", "content": "before"}]
        });
        let req = parse_chat_request(&compat::normalize_request(&body)).unwrap();
        assert_eq!(req.uid.as_str(), "s-9");
        assert_eq!(req.display_name, "Ana");
        assert_eq!(req.history, vec![HistoryEntry::new("user", "before")]);
    }

    #[test]
    fn numeric_uid_is_accepted() {
        let req = parse_chat_request(&json!({"uid": 42, "prompt": "hi"})).unwrap();
        assert_eq!(req.uid.as_str(), "42");
    }

    #[test]
    fn missing_or_blank_required_fields() {
        assert_eq!(bad_request(json!({"prompt": "hi"})), "uid is required");
        assert_eq!(bad_request(json!({"uid": "  ", "prompt": "hi"})), "uid is required");
        assert_eq!(bad_request(json!({"uid": "u1"})), "prompt is required");
        assert_eq!(bad_request(json!({"uid": "u1", "prompt": ""})), "prompt is required");
        assert_eq!(bad_request(json!(["u1", "hi"])), "request body must be a JSON object");
    }

    #[test]
    fn non_array_history_is_rejected() {
        assert_eq!(
            bad_request(json!({"uid": "u1", "prompt": "hi", "history": "nope"})),
            "history must be an array"
        );
        assert_eq!(
            bad_request(json!({"uid": "u1", "prompt": "hi", "history": {"role": "user"}})),
            "history must be an array"
        );
    }

    #[test]
    fn incomplete_history_entries_are_skipped() {
        let body = json!({
            "uid": "u1",
            "prompt": "hi",
            "history": [
                {"role": "user", "content": "a"},
                {"role": "assistant"},
                {"role": 7, "content": "b"},
                "loose string",
                {"role": "assistant", "content": "c", "extra": true}
            ]
        });
        let req = parse_chat_request(&body).unwrap();
        assert_eq!(
            req.history,
            vec![HistoryEntry::new("user", "a"), HistoryEntry::new("assistant", "c")]
        );
    }

    #[test]
    fn blank_name_falls_back_to_default() {
        let req = parse_chat_request(&json!({"uid": "u1", "prompt": "hi", "name": ""})).unwrap();
        assert_eq!(req.display_name, "User");
    }
}
