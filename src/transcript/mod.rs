//! Transcript retrieval: grouping session messages into conversational
//! chunks and answering scoped hybrid plus analytical queries.

mod indexer;
mod search;

pub use indexer::{SqliteMessageSource, TranscriptIndexer};
pub use search::{
    GapResult, QueryFilter, RecentMessage, TranscriptSearchOptions, TranscriptSearchResult,
    TranscriptSearcher, TranscriptStats,
};

use std::sync::Arc;

use crate::error::Result;
use crate::storage::transcript::Message;

/// Read-only view of stored session messages.
///
/// The chat channel collaborator owns the message store; the indexer
/// consumes it through this seam and writes back only the indexed mark.
pub trait MessageSource: Send + Sync {
    /// Up to `limit` unindexed user/assistant messages ordered by
    /// `(session_key, timestamp)`
    fn select_unindexed(&self, limit: usize) -> Result<Vec<Message>>;

    /// Record that a message was absorbed into the transcript index
    fn mark_indexed(&self, message_id: &str, at_ms: i64) -> Result<()>;
}

/// Convenience alias used by the indexer
pub type SharedMessageSource = Arc<dyn MessageSource>;
