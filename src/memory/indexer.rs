//! File-watcher-driven incremental memory indexer.
//!
//! Watches MEMORY.md, memory/**/*.md, and configured extra paths. File
//! events mark the indexer dirty and arm a debounce timer; an explicit
//! trigger channel requests immediate sync. Sync passes skip unchanged
//! files by content hash, replace changed files' chunks atomically, and
//! sweep records for files that disappeared from the watched set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunker::chunk_markdown;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::storage::memory as queries;
use crate::storage::Store;
use crate::util::{now_ms, sha256_hex};

/// Counters from the most recent sync pass
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub last_sync_ms: Option<i64>,
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
}

/// Incremental indexer for workspace markdown
pub struct MemoryIndexer {
    store: Store,
    provider: EmbeddingProvider,
    workspace: PathBuf,
    extra_paths: Vec<PathBuf>,
    chunk_tokens: usize,
    overlap_tokens: usize,
    debounce: Duration,
    dirty: AtomicBool,
    force_reindex: AtomicBool,
    syncing: AtomicBool,
    synced_once: AtomicBool,
    sync_tx: async_channel::Sender<()>,
    sync_rx: async_channel::Receiver<()>,
    stats: RwLock<IndexStats>,
}

impl MemoryIndexer {
    pub fn new(store: Store, provider: EmbeddingProvider, config: &Config) -> Arc<Self> {
        // Capacity-1 channel: extra trigger requests coalesce
        let (sync_tx, sync_rx) = async_channel::bounded(1);

        Arc::new(Self {
            store,
            provider,
            workspace: config.workspace.clone(),
            extra_paths: config.memory.extra_paths.clone(),
            chunk_tokens: config.memory.chunk_tokens,
            overlap_tokens: config.memory.overlap_tokens,
            debounce: Duration::from_millis(config.memory.debounce_ms),
            dirty: AtomicBool::new(false),
            force_reindex: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            synced_once: AtomicBool::new(false),
            sync_tx,
            sync_rx,
            stats: RwLock::new(IndexStats::default()),
        })
    }

    /// Flag every file for re-examination on the next sync, including the
    /// embedding repair path for chunks stored without vectors.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.force_reindex.store(true, Ordering::Release);
    }

    /// Request an immediate sync. Non-blocking; requests coalesce while
    /// one is already pending.
    pub fn trigger_sync(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Wire the provider's ready notification to an embedding-repair sync
    pub fn watch_provider_ready(self: &Arc<Self>) {
        let indexer = self.clone();
        self.provider.on_ready(move || {
            info!("embedding provider ready, scheduling memory re-index");
            indexer.mark_dirty();
            indexer.trigger_sync();
        });
    }

    /// Snapshot of the latest sync counters
    pub fn stats(&self) -> IndexStats {
        self.stats.read().clone()
    }

    /// Watcher loop. Runs until the stop signal fires; exits within one
    /// debounce interval of receiving stop.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<()> {
        let (events_tx, events_rx) = async_channel::bounded::<notify::Result<notify::Event>>(256);

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = events_tx.try_send(event);
        })
        .map_err(|e| crate::error::KeeperError::Internal(format!("watcher init: {e}")))?;

        if let Err(e) = watcher.watch(&self.workspace, RecursiveMode::Recursive) {
            warn!(path = %self.workspace.display(), "cannot watch workspace: {e}");
        }
        for extra in &self.extra_paths {
            if let Err(e) = watcher.watch(extra, RecursiveMode::Recursive) {
                warn!(path = %extra.display(), "cannot watch extra path: {e}");
            }
        }

        let mut deadline: Option<Instant> = None;
        let far_future = || Instant::now() + Duration::from_secs(3600);

        loop {
            tokio::select! {
                _ = stop.changed() => break,

                event = events_rx.recv() => match event {
                    Ok(Ok(event)) => {
                        if event.paths.iter().any(|p| self.is_watched_markdown(p)) {
                            self.dirty.store(true, Ordering::Release);
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Ok(Err(e)) => warn!("watch error: {e}"),
                    Err(_) => break,
                },

                _ = self.sync_rx.recv() => {
                    if self.dirty.load(Ordering::Acquire) || !self.synced_once.load(Ordering::Acquire) {
                        self.run_sync().await;
                        deadline = None;
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                        if deadline.is_some() => {
                    if self.dirty.load(Ordering::Acquire) {
                        self.run_sync().await;
                    }
                    deadline = None;
                }
            }
        }

        Ok(())
    }

    /// Run one sync pass unless another is already in flight
    pub async fn run_sync(&self) {
        if self.syncing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sync_inner().await {
            warn!("memory sync failed: {e}");
        }
        self.syncing.store(false, Ordering::Release);
    }

    async fn sync_inner(&self) -> Result<()> {
        let force = self.force_reindex.load(Ordering::Acquire);
        let files = self.enumerate_files();

        let mut indexed = 0usize;
        let mut chunks_written = 0usize;

        for (abs, rel) in &files {
            match self.sync_file(abs, rel, force).await {
                Ok(Some(count)) => {
                    indexed += 1;
                    chunks_written += count;
                }
                Ok(None) => {}
                Err(e) => warn!(path = %rel, "skipping file: {e}"),
            }
        }

        // Sweep records for files no longer present
        let current: HashSet<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();
        let known = self.store.with_conn(queries::list_file_paths)?;
        let mut removed = 0usize;
        for path in known {
            if !current.contains(path.as_str()) {
                self.store.with_tx(|conn| queries::delete_file(conn, &path))?;
                debug!(path = %path, "removed stale index entry");
                removed += 1;
            }
        }

        let now = now_ms();
        self.store
            .with_conn(|conn| queries::meta_set(conn, "last_sync_ms", &now.to_string()))?;

        {
            let mut stats = self.stats.write();
            stats.last_sync_ms = Some(now);
            stats.files_seen = files.len();
            stats.files_indexed = indexed;
            stats.files_removed = removed;
            stats.chunks_indexed = chunks_written;
        }

        self.dirty.store(false, Ordering::Release);
        self.force_reindex.store(false, Ordering::Release);
        self.synced_once.store(true, Ordering::Release);

        info!(
            files = files.len(),
            indexed, removed, "memory sync complete"
        );
        Ok(())
    }

    /// Index one file if its content changed, or repair missing
    /// embeddings when forced. Returns the number of chunks written, or
    /// None when the file was skipped.
    async fn sync_file(&self, abs: &Path, rel: &str, force: bool) -> Result<Option<usize>> {
        let bytes = std::fs::read(abs)?;
        let hash = sha256_hex(&bytes);

        if let Some(record) = self.store.with_conn(|conn| queries::get_file(conn, rel))? {
            if record.content_hash == hash {
                let repair = force
                    && self.provider.available()
                    && self
                        .store
                        .with_conn(|conn| queries::has_unembedded_chunks(conn, rel))?;
                if !repair {
                    return Ok(None);
                }
            }
        }

        let text = String::from_utf8_lossy(&bytes);
        let chunks = chunk_markdown(&text, self.chunk_tokens, self.overlap_tokens);

        let embeddings = if self.provider.available() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            self.provider.embed_batch(&texts).await
        } else {
            vec![None; chunks.len()]
        };

        let id_prefix = &hash[..16];
        let new_chunks: Vec<queries::NewMemoryChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| queries::NewMemoryChunk {
                id: format!("{id_prefix}:{}:{}", chunk.start_line, chunk.end_line),
                start_line: chunk.start_line as i64,
                end_line: chunk.end_line as i64,
                content_hash: chunk.content_hash,
                text: chunk.text,
                embedding,
            })
            .collect();

        let metadata = std::fs::metadata(abs)?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let record = queries::FileRecord {
            path: rel.to_string(),
            content_hash: hash,
            mtime_ms,
            size: metadata.len() as i64,
            indexed_at: now_ms(),
        };

        let count = new_chunks.len();
        let model = self.provider.model();
        self.store
            .with_tx(|conn| queries::replace_file_chunks(conn, &record, &new_chunks, &model))?;

        debug!(path = %rel, chunks = count, "indexed file");
        Ok(Some(count))
    }

    /// Enumerate watched markdown files as (absolute, workspace-relative)
    /// pairs, sorted for deterministic processing order.
    fn enumerate_files(&self) -> Vec<(PathBuf, String)> {
        let mut paths: Vec<PathBuf> = Vec::new();

        let memory_md = self.workspace.join("MEMORY.md");
        if memory_md.is_file() {
            paths.push(memory_md);
        }
        walk_markdown(&self.workspace.join("memory"), &mut paths);

        for extra in &self.extra_paths {
            if extra.is_dir() {
                walk_markdown(extra, &mut paths);
            } else if is_markdown(extra) && extra.is_file() {
                paths.push(extra.clone());
            }
        }

        let mut files: Vec<(PathBuf, String)> = paths
            .into_iter()
            .map(|abs| {
                let rel = abs
                    .strip_prefix(&self.workspace)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| abs.to_string_lossy().into_owned());
                (abs, rel)
            })
            .collect();
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files.dedup_by(|a, b| a.1 == b.1);
        files
    }

    fn is_watched_markdown(&self, path: &Path) -> bool {
        if !is_markdown(path) {
            return false;
        }
        path == self.workspace.join("MEMORY.md")
            || path.starts_with(self.workspace.join("memory"))
            || self.extra_paths.iter().any(|extra| path.starts_with(extra))
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("md")
}

/// Recursively collect markdown files, skipping hidden dotfiles
fn walk_markdown(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk_markdown(&path, out);
        } else if is_markdown(&path) {
            out.push(path);
        }
    }
}
