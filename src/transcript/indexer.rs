//! Transcript indexer: groups session messages into conversational
//! chunks and backfills embeddings opportunistically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{MessageSource, SharedMessageSource};
use crate::config::TranscriptConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::storage::transcript::{self as queries, Message, TranscriptChunkRow};
use crate::storage::{memory, Store};
use crate::util::{now_ms, sha256_hex};

/// Minimum message length worth indexing
const MIN_INDEXABLE_CHARS: usize = 50;

/// Messages whose code blocks exceed this share of their length are noise
const MAX_CODE_SHARE: f64 = 0.8;

static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Message source backed by the shared SQLite store
pub struct SqliteMessageSource {
    store: Store,
}

impl SqliteMessageSource {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

impl MessageSource for SqliteMessageSource {
    fn select_unindexed(&self, limit: usize) -> Result<Vec<Message>> {
        self.store
            .with_conn(|conn| queries::select_unindexed_messages(conn, limit))
    }

    fn mark_indexed(&self, message_id: &str, at_ms: i64) -> Result<()> {
        self.store
            .with_conn(|conn| queries::mark_message_indexed(conn, message_id, at_ms))
    }
}

/// Background indexer for session transcripts
pub struct TranscriptIndexer {
    store: Store,
    provider: EmbeddingProvider,
    source: SharedMessageSource,
    config: TranscriptConfig,
    syncing: AtomicBool,
    sync_tx: async_channel::Sender<()>,
    sync_rx: async_channel::Receiver<()>,
}

impl TranscriptIndexer {
    pub fn new(
        store: Store,
        provider: EmbeddingProvider,
        source: SharedMessageSource,
        config: TranscriptConfig,
    ) -> Arc<Self> {
        let (sync_tx, sync_rx) = async_channel::bounded(1);
        Arc::new(Self {
            store,
            provider,
            source,
            config,
            syncing: AtomicBool::new(false),
            sync_tx,
            sync_rx,
        })
    }

    /// Request an immediate sync; requests coalesce
    pub fn trigger_sync(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Ticker loop: sync then backfill every interval, or on trigger
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.index_interval_seconds.max(1)));

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => self.run_cycle().await,
                _ = self.sync_rx.recv() => self.run_cycle().await,
            }
        }
    }

    async fn run_cycle(&self) {
        if self.syncing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.run_sync().await {
            warn!("transcript sync failed: {e}");
        }
        if let Err(e) = self.run_backfill().await {
            warn!("transcript backfill failed: {e}");
        }
        self.syncing.store(false, Ordering::Release);
    }

    /// One indexing pass: filter, group, embed, commit.
    pub async fn run_sync(&self) -> Result<()> {
        let messages = self.source.select_unindexed(self.config.batch_size)?;
        if messages.is_empty() {
            return Ok(());
        }

        let now = now_ms();
        let mut retained: Vec<Message> = Vec::with_capacity(messages.len());
        let mut dropped = 0usize;
        for message in messages {
            if should_index(&message) {
                retained.push(message);
            } else {
                // Marked so filtered messages are never re-examined
                self.source.mark_indexed(&message.id, now)?;
                dropped += 1;
            }
        }

        let groups = group_messages(
            &retained,
            self.config.max_group_gap_seconds,
            self.config.max_messages_per_chunk,
        );

        let mut written = 0usize;
        for group in &groups {
            match self.commit_group(group).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!("skipping transcript chunk: {e}"),
            }
        }

        self.store.with_conn(|conn| {
            memory::meta_set(conn, "transcript_last_sync_ms", &now_ms().to_string())
        })?;

        info!(
            retained = retained.len(),
            dropped, chunks = written, "transcript sync complete"
        );
        Ok(())
    }

    /// Write one chunk and mark its source messages.
    ///
    /// When the provider is available but the embed fails, nothing is
    /// written and the messages stay eligible for retry. When the
    /// provider is unavailable from the start, the chunk is stored
    /// unembedded for later backfill.
    async fn commit_group(&self, group: &[Message]) -> Result<bool> {
        let text = render_group(group, &self.config.agent_name);
        if text.is_empty() {
            return Ok(false);
        }

        let id = sha256_hex(text.as_bytes())[..32].to_string();

        let embedding = if self.provider.available() {
            let truncated = truncate_chars(&text, self.config.max_embedding_content_len);
            Some(self.provider.embed_query(&truncated).await?)
        } else {
            None
        };

        let first = &group[0];
        let last = &group[group.len() - 1];
        let chunk = TranscriptChunkRow {
            id,
            user_id: first.user_id.clone(),
            session_key: first.session_key.clone(),
            message_ids: group.iter().map(|m| m.id.clone()).collect(),
            timestamp_start: first.timestamp,
            timestamp_end: last.timestamp,
            role: "conversation".to_string(),
            content: text,
            embedding,
            embedding_model: Some(self.provider.model()).filter(|m| !m.is_empty()),
            created_at: now_ms(),
        };

        self.store.with_tx(|conn| queries::upsert_chunk(conn, &chunk))?;

        let now = now_ms();
        for message in group {
            self.source.mark_indexed(&message.id, now)?;
        }

        debug!(chunk = %chunk.id, messages = group.len(), "committed transcript chunk");
        Ok(true)
    }

    /// Attach embeddings to chunks that were stored without them
    pub async fn run_backfill(&self) -> Result<()> {
        if !self.provider.available() {
            return Ok(());
        }

        let pending = self
            .store
            .with_conn(|conn| queries::unembedded_chunks(conn, self.config.backfill_batch_size))?;
        if pending.is_empty() {
            return Ok(());
        }

        let model = self.provider.model();
        let mut repaired = 0usize;
        let mut failed = 0usize;

        for (id, content) in pending {
            let truncated = truncate_chars(&content, self.config.max_embedding_content_len);
            match self.provider.embed_query(&truncated).await {
                Ok(embedding) => {
                    self.store.with_conn(|conn| {
                        queries::set_chunk_embedding(conn, &id, &embedding, &model)
                    })?;
                    repaired += 1;
                }
                Err(e) => {
                    warn!(chunk = %id, "backfill embed failed: {e}");
                    failed += 1;
                }
            }
        }

        info!(repaired, failed, "transcript backfill complete");
        Ok(())
    }
}

/// Whether a message carries content worth indexing.
///
/// Drops tool/system traffic, heartbeat and checkpoint chatter, short
/// messages, and messages that are mostly code.
pub fn should_index(message: &Message) -> bool {
    if message.role != "user" && message.role != "assistant" {
        return false;
    }

    let lowered = message.content.to_lowercase();
    if lowered.contains("heartbeat") || lowered.contains("memory checkpoint") {
        return false;
    }

    if message.content.chars().count() < MIN_INDEXABLE_CHARS {
        return false;
    }

    let code_chars: usize = CODE_BLOCK_RE
        .find_iter(&message.content)
        .map(|m| m.as_str().len())
        .sum();
    if !message.content.is_empty()
        && code_chars as f64 / message.content.len() as f64 > MAX_CODE_SHARE
    {
        return false;
    }

    true
}

/// Split retained messages into chunk groups.
///
/// A new group starts when the session or user changes, when the gap
/// between consecutive timestamps exceeds `max_gap_seconds`, or when the
/// group reaches `max_messages`.
pub fn group_messages(
    messages: &[Message],
    max_gap_seconds: i64,
    max_messages: usize,
) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();

    for message in messages {
        let split = match current.last() {
            None => false,
            Some(prev) => {
                prev.session_key != message.session_key
                    || prev.user_id != message.user_id
                    || message.timestamp - prev.timestamp > max_gap_seconds
                    || current.len() >= max_messages
            }
        };

        if split {
            groups.push(std::mem::take(&mut current));
        }
        current.push(message.clone());
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Canonical chunk text: one labeled line per message, blank-line
/// separated. Code blocks collapse to a marker before whitespace
/// normalization so the text embeds as prose.
fn render_group(group: &[Message], agent_name: &str) -> String {
    group
        .iter()
        .filter_map(|message| {
            let cleaned = clean_content(&message.content);
            if cleaned.is_empty() {
                return None;
            }
            let label = if message.role == "user" {
                if message.user_id.is_empty() {
                    "user"
                } else {
                    message.user_id.as_str()
                }
            } else {
                agent_name
            };
            Some(format!("{label}: {cleaned}"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn clean_content(content: &str) -> String {
    let without_code = CODE_BLOCK_RE.replace_all(content, " [code block] ");
    WHITESPACE_RE
        .replace_all(&without_code, " ")
        .trim()
        .to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
