//! End-to-end: HTTP request in, server-sent frames out, over a real socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use relay_core::errors::GatewayError;
use relay_engine::{OrchestratorConfig, StreamOrchestrator};
use relay_llm::{CollectingSink, ScriptedGenerator, ScriptedResponse};
use relay_server::{start, ServerConfig, ServerHandle, TransportConfig};
use relay_store::{Database, MemoryConfig, MemoryStore};

struct TestServer {
    handle: ServerHandle,
    scripted: Arc<ScriptedGenerator>,
    sink: Arc<CollectingSink>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(responses: Vec<ScriptedResponse>, sink: CollectingSink) -> Self {
        let store = MemoryStore::new(Database::in_memory().unwrap(), MemoryConfig::default());
        let scripted = Arc::new(ScriptedGenerator::new(responses));
        let sink = Arc::new(sink);
        let orchestrator = StreamOrchestrator::new(
            scripted.clone(),
            store,
            sink.clone(),
            OrchestratorConfig::default(),
        );
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            transport: TransportConfig {
                delta_chunk_chars: 4,
                idle_keepalive: Duration::from_secs(15),
            },
        };
        let handle = start(config, orchestrator).await.unwrap();
        Self {
            handle,
            scripted,
            sink,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port())
    }

    async fn chat(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/chat"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

/// JSON payloads of every `data:` frame; comment frames are skipped.
fn payloads(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[tokio::test]
async fn chat_streams_frames_in_order() {
    let server = TestServer::start(
        vec![ScriptedResponse::deltas(&["Hello", " world"])
            .with_usage(json!({"input_tokens": 11, "output_tokens": 2}))],
        CollectingSink::new(),
    )
    .await;

    let resp = server.chat(json!({"uid": "u1", "prompt": "test"})).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = resp.text().await.unwrap();
    assert!(body.ends_with("data: {\"done\":true}\n\n"));
    assert_eq!(
        payloads(&body),
        vec![
            json!({"ready": true}),
            json!({"delta": "Hell"}),
            json!({"delta": "o"}),
            json!({"delta": " wor"}),
            json!({"delta": "ld"}),
            json!({"done": true}),
        ]
    );

    let records = server.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].input_tokens, 11);
}

#[tokio::test]
async fn memory_endpoint_reflects_the_run() {
    let server = TestServer::start(
        vec![ScriptedResponse::text("first answer"), ScriptedResponse::text("second")],
        CollectingSink::new(),
    )
    .await;

    let _ = server
        .chat(json!({"session_id": "u7", "displayName": "Ana", "prompt": "first"}))
        .await
        .text()
        .await
        .unwrap();
    let _ = server
        .chat(json!({"uid": "u7", "prompt": "second question"}))
        .await
        .text()
        .await
        .unwrap();

    assert_eq!(
        server.scripted.requests()[1].input,
        "[MEMORY]\nuser: first\nassistant: first answer\n[/MEMORY]\n\n[USER QUESTION]\nsecond question"
    );

    let memory: Value = server
        .client
        .get(server.url("/memory/u7?limit=3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let turns = memory["turns"].as_array().unwrap();
    assert_eq!(memory["uid"], "u7");
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0]["content"], "first answer");
    assert_eq!(turns[1]["content"], "second question");
    assert_eq!(turns[2]["role"], "assistant");
}

#[tokio::test]
async fn missing_fields_are_rejected_before_streaming() {
    let server = TestServer::start(Vec::new(), CollectingSink::new()).await;

    let resp = server.chat(json!({"prompt": "hi"})).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "uid is required");

    let resp = server.chat(json!({"uid": "u1", "prompt": "   "})).await;
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url("/chat"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.json::<Value>().await.unwrap()["error"].is_string());

    assert_eq!(server.scripted.call_count(), 0);
}

#[tokio::test]
async fn collaborator_failure_still_ends_with_done() {
    let server = TestServer::start(
        vec![ScriptedResponse::start_error(GatewayError::AuthenticationFailed(
            "bad key".into(),
        ))],
        CollectingSink::new(),
    )
    .await;

    let resp = server.chat(json!({"uid": "u1", "prompt": "test"})).await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert_eq!(payloads(&body), vec![json!({"ready": true}), json!({"done": true})]);
}

#[tokio::test]
async fn sink_refusal_is_reported_once() {
    let server = TestServer::start(
        vec![ScriptedResponse::text("ok")],
        CollectingSink::rejecting("ledger offline"),
    )
    .await;

    let body = server
        .chat(json!({"uid": "u1", "prompt": "test"}))
        .await
        .text()
        .await
        .unwrap();
    assert_eq!(
        payloads(&body),
        vec![
            json!({"ready": true}),
            json!({"delta": "ok"}),
            json!({"usage_error": "usage record rejected: ledger offline"}),
            json!({"done": true}),
        ]
    );
}
