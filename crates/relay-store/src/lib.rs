//! # relay-store
//!
//! SQLite persistence: the per-user conversation log ([`MemoryStore`]),
//! session continuity keys and the usage ledger ([`UsageRepo`]).

pub mod database;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod usage;

pub use database::Database;
pub use error::StoreError;
pub use memory::{MemoryConfig, MemoryMode, MemoryStore};
pub use usage::{UsageRepo, UsageTotals};
