pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod sink;
pub mod stream;
pub mod usage;

pub use errors::GatewayError;
pub use events::StreamEvent;
pub use ids::{RunId, UserId};
pub use messages::{ConversationTurn, HistoryEntry, Role};
pub use provider::{AnswerGenerator, QueryHandle, QueryRequest};
pub use sink::{SinkError, UsageSink};
pub use stream::RawEvent;
pub use usage::{EmbeddingUsage, TokenCounts, UsageRecord};
