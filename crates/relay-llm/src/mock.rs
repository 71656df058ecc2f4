use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use relay_core::errors::GatewayError;
use relay_core::provider::{AnswerGenerator, QueryHandle, QueryRequest};
use relay_core::stream::RawEvent;

/// One step of a scripted event stream.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Event(RawEvent),
    /// Yield an error from `next_event`.
    Fail(GatewayError),
    /// Sleep before the next step.
    Pause(Duration),
}

/// A pre-programmed answer for deterministic testing without API calls.
#[derive(Clone, Debug, Default)]
pub struct ScriptedResponse {
    steps: Vec<ScriptStep>,
    start_error: Option<GatewayError>,
    start_delay: Option<Duration>,
    context_usage: Option<Value>,
    final_response: Option<Value>,
    embedding: Option<(u64, String)>,
}

impl ScriptedResponse {
    /// Text fragments followed by a bare completion.
    pub fn deltas(fragments: &[&str]) -> Self {
        let mut steps: Vec<ScriptStep> = fragments
            .iter()
            .map(|f| ScriptStep::Event(RawEvent::text(*f)))
            .collect();
        steps.push(ScriptStep::Event(RawEvent::Completed { response: None }));
        Self {
            steps,
            ..Default::default()
        }
    }

    /// A single text fragment followed by a bare completion.
    pub fn text(text: &str) -> Self {
        Self::deltas(&[text])
    }

    /// `start()` itself fails.
    pub fn start_error(error: GatewayError) -> Self {
        Self {
            start_error: Some(error),
            ..Default::default()
        }
    }

    /// Raw steps, no implicit completion.
    pub fn steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Attach a response payload to the completion event.
    pub fn with_completed_response(mut self, response: Value) -> Self {
        for step in &mut self.steps {
            if let ScriptStep::Event(RawEvent::Completed { response: slot }) = step {
                *slot = Some(response.clone());
            }
        }
        self
    }

    /// Shorthand for a completion payload carrying only `usage`.
    pub fn with_usage(self, usage: Value) -> Self {
        self.with_completed_response(json!({ "usage": usage }))
    }

    pub fn with_context_usage(mut self, usage: Value) -> Self {
        self.context_usage = Some(usage);
        self
    }

    pub fn with_final_response(mut self, response: Value) -> Self {
        self.final_response = Some(response);
        self
    }

    /// Insert a pause before the step at `index`.
    pub fn with_pause_before(mut self, index: usize, pause: Duration) -> Self {
        let index = index.min(self.steps.len());
        self.steps.insert(index, ScriptStep::Pause(pause));
        self
    }

    /// Fail after the scripted steps instead of completing.
    pub fn then_fail(mut self, error: GatewayError) -> Self {
        self.steps.retain(|s| !matches!(s, ScriptStep::Event(RawEvent::Completed { .. })));
        self.steps.push(ScriptStep::Fail(error));
        self
    }

    /// Delay `start()` by `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Simulate a retrieval call that embedded `tokens` prompt tokens.
    pub fn with_embedding(mut self, tokens: u64, model: &str) -> Self {
        self.embedding = Some((tokens, model.to_string()));
        self
    }
}

/// Answer generator that replays scripted responses in sequence.
///
/// In echo mode an exhausted script answers with the user question instead
/// of failing, which keeps the binary usable without credentials.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<QueryRequest>>,
    call_count: AtomicUsize,
    echo: bool,
    model: String,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            echo: false,
            model: "scripted".to_string(),
        }
    }

    pub fn echo() -> Self {
        Self {
            echo: true,
            model: "echo".to_string(),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, request: &QueryRequest) -> Result<ScriptedResponse, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(response) = self.responses.lock().pop_front() {
            return Ok(response);
        }
        if self.echo {
            let question = request
                .input
                .rsplit_once("[USER QUESTION]\n")
                .map_or(request.input.as_str(), |(_, q)| q);
            return Ok(ScriptedResponse::deltas(&["You said: ", question]));
        }
        Err(GatewayError::InvalidRequest(format!(
            "ScriptedGenerator: no response configured for call {idx}"
        )))
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn start(&self, request: QueryRequest) -> Result<Box<dyn QueryHandle>, GatewayError> {
        self.requests.lock().push(request.clone());
        let response = self.next_response(&request)?;

        if let Some(delay) = response.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = response.start_error {
            return Err(error);
        }
        if let Some((tokens, model)) = &response.embedding {
            request.embedding_usage.add(*tokens, Some(model.as_str()));
        }

        Ok(Box::new(ScriptedHandle {
            steps: response.steps.into(),
            context_usage: response.context_usage,
            final_response: response.final_response,
        }))
    }
}

struct ScriptedHandle {
    steps: VecDeque<ScriptStep>,
    context_usage: Option<Value>,
    final_response: Option<Value>,
}

#[async_trait]
impl QueryHandle for ScriptedHandle {
    async fn next_event(&mut self) -> Option<Result<RawEvent, GatewayError>> {
        loop {
            match self.steps.pop_front()? {
                ScriptStep::Pause(pause) => tokio::time::sleep(pause).await,
                ScriptStep::Event(event) => return Some(Ok(event)),
                ScriptStep::Fail(error) => return Some(Err(error)),
            }
        }
    }

    fn context_usage(&self) -> Option<Value> {
        self.context_usage.clone()
    }

    async fn final_response(&mut self) -> Option<Value> {
        self.final_response.take()
    }
}
