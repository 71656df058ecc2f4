//! Stream orchestration.
//!
//! [`StreamOrchestrator::run`] spawns a producer task per request and hands
//! back a [`RunStream`] that yields, on every path:
//!
//! `Ready → Delta* → UsageError? → Done`
//!
//! The producer walks `Loading → Querying → Streaming → Finalizing →
//! Completed`, or ends in `Errored` when the collaborator fails before the
//! first fragment. Persistence and usage failures are logged, never surfaced
//! to the client except for one `UsageError` when the sink refuses a record.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use relay_core::errors::GatewayError;
use relay_core::events::StreamEvent;
use relay_core::ids::{RunId, UserId};
use relay_core::messages::HistoryEntry;
use relay_core::provider::{AnswerGenerator, QueryHandle, QueryRequest};
use relay_core::sink::UsageSink;
use relay_core::stream::{self, RawEvent};
use relay_core::usage::{self, EmbeddingUsage};
use relay_settings::{ModelSettings, RelaySettings};
use relay_store::{MemoryMode, MemoryStore, StoreError};

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Instruction template and embedding label.
    pub model: ModelSettings,
    /// Capacity of the producer → consumer queue.
    pub channel_capacity: usize,
    /// How long usage accounting may continue after the consumer went away.
    pub cancel_grace: Duration,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            model: settings.model.clone(),
            channel_capacity: settings.server.channel_capacity,
            cancel_grace: settings.server.cancel_grace(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            channel_capacity: 64,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// One validated chat request.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub uid: UserId,
    pub display_name: String,
    pub prompt: String,
    /// Caller-supplied history, used only when local memory has nothing.
    pub history: Vec<HistoryEntry>,
}

impl RunRequest {
    pub fn new(uid: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            uid: UserId::from_raw(uid),
            display_name: "User".to_string(),
            prompt: prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Querying,
    Streaming,
    Finalizing,
    Completed,
    Errored,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// The consumer side of a run. Dropping it cancels the producer.
pub struct RunStream {
    run_id: RunId,
    rx: mpsc::Receiver<StreamEvent>,
    state: Arc<Mutex<RunState>>,
    _cancel: DropGuard,
}

impl RunStream {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current producer state.
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }
}

impl Stream for RunStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Runs queries against the answer-generation collaborator.
///
/// Cheap to clone; every run gets its own producer task.
#[derive(Clone)]
pub struct StreamOrchestrator {
    generator: Arc<dyn AnswerGenerator>,
    memory: MemoryStore,
    sink: Arc<dyn UsageSink>,
    config: OrchestratorConfig,
}

impl StreamOrchestrator {
    pub fn new(
        generator: Arc<dyn AnswerGenerator>,
        memory: MemoryStore,
        sink: Arc<dyn UsageSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            generator,
            memory,
            sink,
            config,
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn model(&self) -> &str {
        self.generator.model()
    }

    /// Start a run. Must be called from within a Tokio runtime.
    ///
    /// `Ready` is queued before the producer performs any I/O.
    pub fn run(&self, request: RunRequest) -> RunStream {
        let run_id = RunId::new();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(2));
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(RunState::Idle));

        // A fresh channel always has room for the first event.
        let _ = tx.try_send(StreamEvent::Ready);

        let span = info_span!("run", uid = %request.uid, run_id = %run_id);
        let producer = Producer {
            orchestrator: self.clone(),
            request,
            tx,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        };
        let _ = tokio::spawn(producer.drive().instrument(span));

        RunStream {
            run_id,
            rx,
            state,
            _cancel: cancel.drop_guard(),
        }
    }
}

#[derive(Default)]
struct Streamed {
    answer: String,
    fragments: usize,
    /// Response payload delivered with the completion signal.
    completion: Option<Value>,
    cancelled: bool,
}

struct Producer {
    orchestrator: StreamOrchestrator,
    request: RunRequest,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    state: Arc<Mutex<RunState>>,
}

impl Producer {
    async fn drive(self) {
        let started = Instant::now();
        let outcome = self.execute().await;
        let _ = self.emit(StreamEvent::Done).await;
        info!(
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
    }

    async fn execute(&self) -> RunState {
        let uid = self.request.uid.clone();
        let prompt = self.request.prompt.clone();
        let mode = self.orchestrator.memory.mode();

        self.enter(RunState::Loading);
        let input = {
            let (uid, prompt, history) = (uid.clone(), prompt.clone(), self.request.history.clone());
            self.with_store(move |store| Ok(store.build_input(&uid, &prompt, &history)))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "building input failed, sending bare prompt");
                    self.request.prompt.clone()
                })
        };
        {
            let (uid, prompt) = (uid.clone(), prompt.clone());
            if let Err(e) = self.with_store(move |store| store.record_user(&uid, &prompt)).await {
                warn!(error = %e, "failed to persist user turn");
            }
        }
        let continuity_key = if mode == MemoryMode::SessionContinuity {
            let uid = uid.clone();
            self.with_store(move |store| store.continuity_key(&uid))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "failed to read continuity key");
                    None
                })
        } else {
            None
        };

        self.enter(RunState::Querying);
        let config = &self.orchestrator.config;
        let embeddings = Arc::new(EmbeddingUsage::new(config.model.embedding_model.clone()));
        let query = QueryRequest {
            input,
            display_name: self.request.display_name.clone(),
            instructions: config.model.render_instructions(&self.request.display_name),
            continuity_key,
            embedding_usage: Arc::clone(&embeddings),
        };
        let started = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            result = self.orchestrator.generator.start(query) => result,
        };
        let mut handle = match started {
            Ok(handle) => handle,
            Err(e) => return self.errored(&e),
        };

        self.enter(RunState::Streaming);
        let streamed = match self.stream(handle.as_mut()).await {
            Ok(streamed) => streamed,
            Err(e) => return self.errored(&e),
        };

        self.enter(RunState::Finalizing);
        if !streamed.answer.is_empty() {
            let (uid, answer) = (uid.clone(), streamed.answer.clone());
            if let Err(e) = self.with_store(move |store| store.record_assistant(&uid, &answer)).await {
                warn!(error = %e, "failed to persist assistant turn");
            }
        }
        if mode == MemoryMode::SessionContinuity {
            self.store_continuity_key(&uid, streamed.completion.as_ref()).await;
        }

        let grace = self.orchestrator.config.cancel_grace;
        let cancelled_and_graced = async {
            self.cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::select! {
            biased;
            () = self.account(handle.as_mut(), &streamed, &embeddings) => {}
            () = cancelled_and_graced => {
                warn!(grace_ms = grace.as_millis() as u64, "usage accounting abandoned after disconnect");
            }
        }

        self.enter(RunState::Completed);
        RunState::Completed
    }

    /// Forward text fragments until the collaborator finishes.
    ///
    /// Errors before the first fragment are returned; later ones end the
    /// stream with the partial answer kept.
    async fn stream(&self, handle: &mut dyn QueryHandle) -> Result<Streamed, GatewayError> {
        let mut streamed = Streamed::default();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    streamed.cancelled = true;
                    break;
                }
                next = handle.next_event() => next,
            };
            match next {
                None => break,
                Some(Ok(RawEvent::TextDelta { delta })) => {
                    if delta.is_empty() {
                        continue;
                    }
                    streamed.answer.push_str(&delta);
                    streamed.fragments += 1;
                    if !self.emit(StreamEvent::Delta(delta)).await {
                        streamed.cancelled = true;
                        break;
                    }
                }
                Some(Ok(RawEvent::Completed { response })) => {
                    if response.is_some() {
                        streamed.completion = response;
                    }
                }
                Some(Ok(RawEvent::Other { kind })) => trace!(kind, "ignoring collaborator event"),
                Some(Err(e)) if streamed.fragments == 0 => return Err(e),
                Some(Err(e)) => {
                    warn!(
                        error = %e,
                        kind = e.error_kind(),
                        fragments = streamed.fragments,
                        "collaborator failed mid-stream, keeping partial answer"
                    );
                    break;
                }
            }
        }
        if streamed.cancelled {
            info!(fragments = streamed.fragments, "consumer went away, stopping stream");
        }
        Ok(streamed)
    }

    /// Resolve usage, reconcile it and hand the record to the sink.
    async fn account(
        &self,
        handle: &mut dyn QueryHandle,
        streamed: &Streamed,
        embeddings: &EmbeddingUsage,
    ) {
        let mut llm_usage = streamed.completion.as_ref().and_then(response_usage);
        if llm_usage.is_none() {
            llm_usage = handle.context_usage().filter(|u| usage::is_present(Some(u)));
        }
        if llm_usage.is_none() {
            llm_usage = handle.final_response().await.as_ref().and_then(response_usage);
        }

        let record = usage::merge(
            &self.request.uid,
            self.orchestrator.generator.model(),
            llm_usage.as_ref(),
            embeddings,
        );
        debug!(
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            embedding_input_tokens = record.embedding_input_tokens,
            "usage reconciled"
        );
        if let Err(e) = self.orchestrator.sink.record(&record).await {
            warn!(error = %e, "usage sink refused record");
            let _ = self.emit(StreamEvent::UsageError(e.to_string())).await;
        }
    }

    async fn store_continuity_key(&self, uid: &UserId, completion: Option<&Value>) {
        let Some(id) = completion.and_then(stream::response_id).map(str::to_string) else {
            debug!("completion carried no response id");
            return;
        };
        let uid = uid.clone();
        if let Err(e) = self.with_store(move |store| store.set_continuity_key(&uid, &id)).await {
            warn!(error = %e, "failed to store continuity key");
        }
    }

    /// Run a store call on the blocking pool, inside the run's span.
    async fn with_store<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&MemoryStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.orchestrator.memory.clone();
        let span = Span::current();
        let result = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            f(&store)
        })
        .await?;
        Ok(result?)
    }

    async fn emit(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    fn enter(&self, next: RunState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        trace!(from = ?previous, to = ?next, "run state");
    }

    fn errored(&self, e: &GatewayError) -> RunState {
        if matches!(e, GatewayError::Cancelled) {
            info!("run cancelled before the first fragment");
        } else {
            warn!(error = %e, kind = e.error_kind(), "collaborator failed before the first fragment");
        }
        self.enter(RunState::Errored);
        RunState::Errored
    }
}

/// Usage nested in a response payload: `usage`, else `output[0].usage`.
fn response_usage(response: &Value) -> Option<Value> {
    [response.get("usage"), response.pointer("/output/0/usage")]
        .into_iter()
        .flatten()
        .find(|u| usage::is_present(Some(u)))
        .cloned()
}
