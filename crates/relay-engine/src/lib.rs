//! # relay-engine
//!
//! Drives one query per request: builds the composite input from memory,
//! streams the collaborator's answer as [`StreamEvent`](relay_core::StreamEvent)s,
//! persists both turns and reconciles usage.

pub mod error;
pub mod orchestrator;

pub use error::EngineError;
pub use orchestrator::{OrchestratorConfig, RunRequest, RunState, RunStream, StreamOrchestrator};
