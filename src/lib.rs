//! Keeper - personal-assistant gateway core
//!
//! Retrieval and scheduling subsystems: an incremental markdown memory
//! index with hybrid search, a transcript indexer with scoped queries,
//! and a persistent cron scheduler.

pub mod chunker;
pub mod config;
pub mod cron;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod storage;
pub mod transcript;
pub mod util;

pub use config::Config;
pub use error::{KeeperError, Result};
pub use storage::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
