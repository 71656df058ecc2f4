//! # relay-server
//!
//! HTTP surface: `POST /chat` streams a run as server-sent events,
//! `GET /memory/{uid}` returns recent turns and `GET /health` reports status.

pub mod compat;
pub mod error;
pub mod handlers;
pub mod server;
pub mod transport;

pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use transport::{encode, TransportConfig};
