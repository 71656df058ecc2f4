//! # relay-llm
//!
//! Answer-generation and retrieval collaborators: the streaming Responses
//! API client, the scripted generator used by tests and the credential-less
//! binary, similarity search with per-run embedding accounting, and the
//! simple usage sinks.

pub mod reliable;
pub mod responses;
pub mod search;
pub mod sink;
pub mod sse;

pub mod mock;

pub use mock::{ScriptStep, ScriptedGenerator, ScriptedResponse};
pub use reliable::{ReliableGenerator, RetryConfig};
pub use responses::ResponsesGenerator;
pub use search::{CountingEmbedder, Embedder, OpenAiEmbedder, SearchHit, SimilaritySearch, VectorIndex};
pub use sink::{CollectingSink, TracingSink};
