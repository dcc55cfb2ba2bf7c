//! Typed configuration tree for the gateway core.
//!
//! Configuration is a fixed tree of named sections rather than a dynamic
//! map. Partial updates are expressed as a [`ConfigPatch`] (an all-optional
//! mirror of the tree) applied with [`Config::overlay`]; fields left `None`
//! keep their current value.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Absolute workspace root containing MEMORY.md and memory/
    pub workspace: PathBuf,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

/// Memory indexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Extra directories indexed in addition to MEMORY.md and memory/
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    /// Target chunk size in estimated tokens (chars / 4)
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    /// Overlap between consecutive chunks in estimated tokens
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Quiet period after a file event before a sync runs
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Transcript indexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// Messages fetched per sync pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Gap between consecutive messages that starts a new chunk
    #[serde(default = "default_max_group_gap_seconds")]
    pub max_group_gap_seconds: i64,
    /// Upper bound on messages grouped into one chunk
    #[serde(default = "default_max_messages_per_chunk")]
    pub max_messages_per_chunk: usize,
    /// Chunk text is truncated to this length before embedding
    #[serde(default = "default_max_embedding_content_len")]
    pub max_embedding_content_len: usize,
    /// Unembedded chunks repaired per backfill pass
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,
    /// Seconds between scheduled sync passes
    #[serde(default = "default_index_interval_seconds")]
    pub index_interval_seconds: u64,
    /// Label used for assistant messages in chunk text
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

/// Embedding provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    /// None disables dense vectors entirely (null provider).
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_embed_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Cron scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Path of the versioned jobs document
    pub jobs_path: PathBuf,
    /// Directory holding per-job run history files
    pub runs_dir: PathBuf,
    /// Scheduler tick granularity
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Partial configuration applied over a base [`Config`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub memory: MemoryPatch,
    #[serde(default)]
    pub transcript: TranscriptPatch,
    #[serde(default)]
    pub embedding: EmbeddingPatch,
    #[serde(default)]
    pub cron: CronPatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryPatch {
    pub extra_paths: Option<Vec<PathBuf>>,
    pub chunk_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptPatch {
    pub batch_size: Option<usize>,
    pub max_group_gap_seconds: Option<i64>,
    pub max_messages_per_chunk: Option<usize>,
    pub max_embedding_content_len: Option<usize>,
    pub backfill_batch_size: Option<usize>,
    pub index_interval_seconds: Option<u64>,
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingPatch {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronPatch {
    pub jobs_path: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub tick_interval_ms: Option<u64>,
}

impl Config {
    /// Build a configuration rooted at `workspace` with all defaults
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let cron = CronConfig {
            jobs_path: workspace.join("cron").join("jobs.json"),
            runs_dir: workspace.join("cron").join("runs"),
            tick_interval_ms: default_tick_interval_ms(),
        };
        Self {
            workspace,
            memory: MemoryConfig::default(),
            transcript: TranscriptConfig::default(),
            embedding: EmbeddingConfig::default(),
            cron,
        }
    }

    /// Check that the configuration is usable.
    ///
    /// Callers applying a patched configuration surface this result to
    /// the operator before swapping it in.
    pub fn validate(&self) -> Result<()> {
        if !self.workspace.is_absolute() {
            return Err(KeeperError::Validation(format!(
                "workspace must be an absolute path: {}",
                self.workspace.display()
            )));
        }
        if self.memory.chunk_tokens == 0 {
            return Err(KeeperError::Validation(
                "memory.chunk_tokens must be positive".to_string(),
            ));
        }
        if self.transcript.max_messages_per_chunk == 0 {
            return Err(KeeperError::Validation(
                "transcript.max_messages_per_chunk must be positive".to_string(),
            ));
        }
        if self.transcript.batch_size == 0 {
            return Err(KeeperError::Validation(
                "transcript.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Overlay a patch onto this configuration.
    ///
    /// Named fields present in the patch replace the current values;
    /// absent fields are untouched.
    pub fn overlay(&mut self, patch: ConfigPatch) {
        if let Some(workspace) = patch.workspace {
            self.workspace = workspace;
        }

        let m = patch.memory;
        set(&mut self.memory.extra_paths, m.extra_paths);
        set(&mut self.memory.chunk_tokens, m.chunk_tokens);
        set(&mut self.memory.overlap_tokens, m.overlap_tokens);
        set(&mut self.memory.debounce_ms, m.debounce_ms);

        let t = patch.transcript;
        set(&mut self.transcript.batch_size, t.batch_size);
        set(
            &mut self.transcript.max_group_gap_seconds,
            t.max_group_gap_seconds,
        );
        set(
            &mut self.transcript.max_messages_per_chunk,
            t.max_messages_per_chunk,
        );
        set(
            &mut self.transcript.max_embedding_content_len,
            t.max_embedding_content_len,
        );
        set(
            &mut self.transcript.backfill_batch_size,
            t.backfill_batch_size,
        );
        set(
            &mut self.transcript.index_interval_seconds,
            t.index_interval_seconds,
        );
        set(&mut self.transcript.agent_name, t.agent_name);

        let e = patch.embedding;
        if e.base_url.is_some() {
            self.embedding.base_url = e.base_url;
        }
        if e.api_key.is_some() {
            self.embedding.api_key = e.api_key;
        }
        set(&mut self.embedding.model, e.model);
        set(&mut self.embedding.timeout_seconds, e.timeout_seconds);

        let c = patch.cron;
        set(&mut self.cron.jobs_path, c.jobs_path);
        set(&mut self.cron.runs_dir, c.runs_dir);
        set(&mut self.cron.tick_interval_ms, c.tick_interval_ms);
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            extra_paths: Vec::new(),
            chunk_tokens: default_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_group_gap_seconds: default_max_group_gap_seconds(),
            max_messages_per_chunk: default_max_messages_per_chunk(),
            max_embedding_content_len: default_max_embedding_content_len(),
            backfill_batch_size: default_backfill_batch_size(),
            index_interval_seconds: default_index_interval_seconds(),
            agent_name: default_agent_name(),
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            jobs_path: PathBuf::from("cron/jobs.json"),
            runs_dir: PathBuf::from("cron/runs"),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    400
}

fn default_overlap_tokens() -> usize {
    80
}

fn default_debounce_ms() -> u64 {
    1500
}

fn default_batch_size() -> usize {
    200
}

fn default_max_group_gap_seconds() -> i64 {
    1800
}

fn default_max_messages_per_chunk() -> usize {
    10
}

fn default_max_embedding_content_len() -> usize {
    8000
}

fn default_backfill_batch_size() -> usize {
    50
}

fn default_index_interval_seconds() -> u64 {
    300
}

fn default_agent_name() -> String {
    "assistant".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embed_timeout_seconds() -> u64 {
    60
}

fn default_tick_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::for_workspace("/tmp/ws");
        assert_eq!(config.memory.chunk_tokens, 400);
        assert_eq!(config.memory.overlap_tokens, 80);
        assert_eq!(config.memory.debounce_ms, 1500);
        assert_eq!(config.transcript.max_messages_per_chunk, 10);
        assert_eq!(config.cron.tick_interval_ms, 1000);
        assert!(config.embedding.base_url.is_none());
    }

    #[test]
    fn test_overlay_replaces_named_fields_only() {
        let mut config = Config::for_workspace("/tmp/ws");
        let patch: ConfigPatch = serde_json::from_str(
            r#"{
                "memory": {"chunk_tokens": 200},
                "embedding": {"base_url": "http://localhost:11434/v1"}
            }"#,
        )
        .unwrap();

        config.overlay(patch);

        assert_eq!(config.memory.chunk_tokens, 200);
        assert_eq!(config.memory.overlap_tokens, 80);
        assert_eq!(
            config.embedding.base_url.as_deref(),
            Some("http://localhost:11434/v1")
        );
        assert_eq!(config.embedding.model, "text-embedding-3-small");
    }

    #[test]
    fn test_validate() {
        let config = Config::for_workspace("/tmp/ws");
        assert!(config.validate().is_ok());

        let mut relative = Config::for_workspace("relative/path");
        assert!(relative.validate().is_err());
        relative.workspace = PathBuf::from("/tmp/ws");
        relative.memory.chunk_tokens = 0;
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_overlay_empty_patch_is_identity() {
        let mut config = Config::for_workspace("/tmp/ws");
        let before = serde_json::to_value(&config).unwrap();
        config.overlay(ConfigPatch::default());
        let after = serde_json::to_value(&config).unwrap();
        assert_eq!(before, after);
    }
}
