//! Scoped search over transcript chunks and messages.
//!
//! Every query carries `(user_id, is_owner)`. Owners see everything;
//! non-owner callers with a user id only ever receive rows belonging to
//! that user.

use std::collections::HashMap;

use rusqlite::ToSql;
use tracing::warn;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::storage::memory as meta_queries;
use crate::storage::transcript as queries;
use crate::storage::Store;
use crate::util::{
    build_fts_query, cosine_similarity, normalize_bm25_rank, now_ms, sha256_hex, truncate_snippet,
};

/// Snippet budget for chunk search results
const SNIPPET_MAX_CHARS: usize = 700;

/// Display budget for recent/exact message previews
const MESSAGE_PREVIEW_CHARS: usize = 200;

/// Default multiplier bonus applied to exact-substring matches
const DEFAULT_EXACT_BOOST: f32 = 0.25;

/// Hybrid search tuning
#[derive(Debug, Clone)]
pub struct TranscriptSearchOptions {
    pub max_results: usize,
    pub min_score: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Score multiplier bonus for chunks containing the literal query
    /// (case-insensitive); None disables the boost
    pub exact_boost: Option<f32>,
}

impl Default for TranscriptSearchOptions {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.35,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            exact_boost: Some(DEFAULT_EXACT_BOOST),
        }
    }
}

/// A scored transcript chunk hit
#[derive(Debug, Clone)]
pub struct TranscriptSearchResult {
    pub id: String,
    pub user_id: String,
    pub session_key: String,
    pub score: f32,
    pub snippet: String,
    pub timestamp_start: i64,
    pub timestamp_end: i64,
}

/// A message row from the analytical queries
#[derive(Debug, Clone)]
pub struct RecentMessage {
    pub id: String,
    pub session_key: String,
    pub timestamp: i64,
    pub role: String,
    pub content: String,
    pub user_id: String,
    pub source: String,
}

/// A pair of consecutive user messages with a long silence between them
#[derive(Debug, Clone)]
pub struct GapResult {
    pub user_id: String,
    pub before: RecentMessage,
    pub after: RecentMessage,
    pub gap_hours: f64,
}

/// Index health counters
#[derive(Debug, Clone)]
pub struct TranscriptStats {
    pub total_chunks: i64,
    pub chunks_with_embeddings: i64,
    pub chunks_needing_embeddings: i64,
    pub pending_messages: i64,
    pub last_sync_ms: Option<i64>,
    pub provider: String,
}

/// Row filters applied uniformly across the message-level queries
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub source: Option<String>,
    pub exclude_sources: Vec<String>,
    /// Excludes the cron and heartbeat sources
    pub human_only: bool,
    /// Seconds since the Unix epoch, inclusive
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub last_days: Option<i64>,
    pub role: Option<String>,
}

impl QueryFilter {
    /// Append WHERE clauses for this filter to a messages query
    fn apply(&self, sql: &mut String, params: &mut Vec<Box<dyn ToSql>>, now_secs: i64) {
        if let Some(ref source) = self.source {
            sql.push_str(" AND source = ?");
            params.push(Box::new(source.clone()));
        }
        if !self.exclude_sources.is_empty() {
            let placeholders: Vec<&str> = self.exclude_sources.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND source NOT IN ({})", placeholders.join(", ")));
            for source in &self.exclude_sources {
                params.push(Box::new(source.clone()));
            }
        }
        if self.human_only {
            sql.push_str(" AND source NOT IN ('cron', 'heartbeat')");
        }
        if let Some(after) = self.after {
            sql.push_str(" AND timestamp >= ?");
            params.push(Box::new(after));
        }
        if let Some(before) = self.before {
            sql.push_str(" AND timestamp <= ?");
            params.push(Box::new(before));
        }
        if let Some(days) = self.last_days {
            sql.push_str(" AND timestamp >= ?");
            params.push(Box::new(now_secs - days * 86_400));
        }
        if let Some(ref role) = self.role {
            sql.push_str(" AND role = ?");
            params.push(Box::new(role.clone()));
        }
    }
}

/// Caller identity for scoping
fn user_scope<'a>(user_id: &'a str, is_owner: bool) -> Option<&'a str> {
    if !is_owner && !user_id.is_empty() {
        Some(user_id)
    } else {
        None
    }
}

/// Scoped searcher over transcript chunks and messages
#[derive(Clone)]
pub struct TranscriptSearcher {
    store: Store,
    provider: EmbeddingProvider,
}

impl TranscriptSearcher {
    pub fn new(store: Store, provider: EmbeddingProvider) -> Self {
        Self { store, provider }
    }

    /// Hybrid search over transcript chunks with optional exact boost
    pub async fn search(
        &self,
        query: &str,
        user_id: &str,
        is_owner: bool,
        options: &TranscriptSearchOptions,
    ) -> Result<Vec<TranscriptSearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let scope = user_scope(user_id, is_owner);
        let candidate_limit = options.max_results * 4;

        let keyword_scores = self.keyword_candidates(query, scope, candidate_limit)?;
        let vector_scores = match self.query_embedding(query).await {
            Some(embedding) => self.vector_candidates(&embedding, scope, candidate_limit)?,
            None => HashMap::new(),
        };

        let query_lower = query.to_lowercase();
        let mut merged: Vec<TranscriptSearchResult> = Vec::new();

        self.store.with_conn(|conn| {
            let mut seen = std::collections::HashSet::new();
            for id in keyword_scores.keys().chain(vector_scores.keys()) {
                if !seen.insert(id.clone()) {
                    continue;
                }

                let mut score = match (keyword_scores.get(id), vector_scores.get(id)) {
                    (Some(&kw), Some(&vec)) => {
                        options.keyword_weight * kw + options.vector_weight * vec
                    }
                    (Some(&kw), None) => kw,
                    (None, Some(&vec)) => vec,
                    (None, None) => continue,
                };

                let Some(chunk) = queries::get_chunk(conn, id)? else {
                    continue;
                };
                if let Some(scoped_user) = scope {
                    if chunk.user_id != scoped_user {
                        continue;
                    }
                }

                if let Some(boost) = options.exact_boost {
                    if chunk.content.to_lowercase().contains(&query_lower) {
                        score *= 1.0 + boost;
                    }
                }

                if score < options.min_score {
                    continue;
                }

                merged.push(TranscriptSearchResult {
                    id: chunk.id,
                    user_id: chunk.user_id,
                    session_key: chunk.session_key,
                    score,
                    snippet: truncate_snippet(&chunk.content, SNIPPET_MAX_CHARS),
                    timestamp_start: chunk.timestamp_start,
                    timestamp_end: chunk.timestamp_end,
                });
            }
            Ok(())
        })?;

        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(options.max_results);
        Ok(merged)
    }

    /// Most recent messages, newest first, content truncated for display
    pub fn recent(
        &self,
        user_id: &str,
        is_owner: bool,
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<RecentMessage>> {
        let scope = user_scope(user_id, is_owner);

        self.store.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, session_key, timestamp, role, content, user_id, source
                 FROM messages WHERE 1=1",
            );
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(scoped_user) = scope {
                sql.push_str(" AND user_id = ?");
                params.push(Box::new(scoped_user.to_string()));
            }
            filter.apply(&mut sql, &mut params, now_ms() / 1000);

            sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
            params.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    let content: String = row.get(4)?;
                    Ok(RecentMessage {
                        id: row.get(0)?,
                        session_key: row.get(1)?,
                        timestamp: row.get(2)?,
                        role: row.get(3)?,
                        content: truncate_snippet(&content, MESSAGE_PREVIEW_CHARS),
                        user_id: row.get(5)?,
                        source: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Case-insensitive substring search over raw message content
    pub fn exact_search(
        &self,
        query: &str,
        user_id: &str,
        is_owner: bool,
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<RecentMessage>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let scope = user_scope(user_id, is_owner);

        self.store.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, session_key, timestamp, role, content, user_id, source
                 FROM messages WHERE instr(lower(content), lower(?)) > 0",
            );
            let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(query.to_string())];

            if let Some(scoped_user) = scope {
                sql.push_str(" AND user_id = ?");
                params.push(Box::new(scoped_user.to_string()));
            }
            filter.apply(&mut sql, &mut params, now_ms() / 1000);

            sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
            params.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    let content: String = row.get(4)?;
                    Ok(RecentMessage {
                        id: row.get(0)?,
                        session_key: row.get(1)?,
                        timestamp: row.get(2)?,
                        role: row.get(3)?,
                        content: truncate_snippet(&content, MESSAGE_PREVIEW_CHARS),
                        user_id: row.get(5)?,
                        source: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Pairs of consecutive user messages separated by more than
    /// `min_hours`, newest first. Gaps are computed within each user's
    /// own message stream.
    pub fn gaps(
        &self,
        user_id: &str,
        is_owner: bool,
        min_hours: f64,
        limit: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<GapResult>> {
        let scope = user_scope(user_id, is_owner);

        let messages = self.store.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, session_key, timestamp, role, content, user_id, source
                 FROM messages WHERE role = 'user'",
            );
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(scoped_user) = scope {
                sql.push_str(" AND user_id = ?");
                params.push(Box::new(scoped_user.to_string()));
            }
            filter.apply(&mut sql, &mut params, now_ms() / 1000);

            sql.push_str(" ORDER BY user_id, timestamp");

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    let content: String = row.get(4)?;
                    Ok(RecentMessage {
                        id: row.get(0)?,
                        session_key: row.get(1)?,
                        timestamp: row.get(2)?,
                        role: row.get(3)?,
                        content: truncate_snippet(&content, MESSAGE_PREVIEW_CHARS),
                        user_id: row.get(5)?,
                        source: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let min_seconds = (min_hours * 3600.0) as i64;
        let mut gaps: Vec<GapResult> = Vec::new();

        for pair in messages.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            if before.user_id != after.user_id {
                continue;
            }
            let gap = after.timestamp - before.timestamp;
            if gap > min_seconds {
                gaps.push(GapResult {
                    user_id: before.user_id.clone(),
                    before: before.clone(),
                    after: after.clone(),
                    gap_hours: gap as f64 / 3600.0,
                });
            }
        }

        gaps.sort_by(|a, b| b.after.timestamp.cmp(&a.after.timestamp));
        gaps.truncate(limit);
        Ok(gaps)
    }

    /// Index health summary
    pub fn stats(&self) -> Result<TranscriptStats> {
        let counts = self.store.with_conn(queries::counts)?;
        let last_sync_ms = self
            .store
            .with_conn(|conn| meta_queries::meta_get(conn, "transcript_last_sync_ms"))?
            .and_then(|v| v.parse().ok());

        Ok(TranscriptStats {
            total_chunks: counts.total_chunks,
            chunks_with_embeddings: counts.chunks_with_embeddings,
            chunks_needing_embeddings: counts.total_chunks - counts.chunks_with_embeddings,
            pending_messages: counts.pending_messages,
            last_sync_ms,
            provider: self.provider.id().to_string(),
        })
    }

    fn keyword_candidates(
        &self,
        query: &str,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<HashMap<String, f32>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(HashMap::new());
        }

        self.store.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT c.id, bm25(transcript_fts) AS rank
                 FROM transcript_fts
                 JOIN transcript_chunks c ON transcript_fts.rowid = c.rowid
                 WHERE transcript_fts MATCH ?",
            );
            let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(fts_query.clone())];

            if let Some(scoped_user) = scope {
                sql.push_str(" AND c.user_id = ?");
                params.push(Box::new(scoped_user.to_string()));
            }
            sql.push_str(" ORDER BY bm25(transcript_fts) LIMIT ?");
            params.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), |row| {
                let id: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((id, normalize_bm25_rank(rank)))
            })?;

            let mut scores = HashMap::new();
            for row in rows {
                let (id, score) = row?;
                scores.insert(id, score);
            }
            Ok(scores)
        })
    }

    fn vector_candidates(
        &self,
        query_embedding: &[f32],
        scope: Option<&str>,
        limit: usize,
    ) -> Result<HashMap<String, f32>> {
        let embedded = self
            .store
            .with_conn(|conn| queries::embedded_chunks(conn, scope))?;

        let mut scored: Vec<(String, f32)> = embedded
            .into_iter()
            .map(|(id, embedding)| {
                let similarity = cosine_similarity(query_embedding, &embedding);
                (id, similarity)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored.into_iter().collect())
    }

    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if !self.provider.available() {
            return None;
        }

        let model = self.provider.model();
        let hash = sha256_hex(query.as_bytes());

        let cached = self
            .store
            .with_conn(|conn| meta_queries::cached_embedding(conn, &hash, &model))
            .ok()
            .flatten();
        if cached.is_some() {
            return cached;
        }

        match self.provider.embed_query(query).await {
            Ok(embedding) => {
                let stored = self.store.with_conn(|conn| {
                    meta_queries::store_cached_embedding(conn, &hash, &model, &embedding, now_ms())
                });
                if let Err(e) = stored {
                    warn!("failed to cache query embedding: {e}");
                }
                Some(embedding)
            }
            Err(e) => {
                warn!("query embedding failed, falling back to keyword-only: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transcript::TranscriptChunkRow;
    use rusqlite::params;

    fn insert_message(
        store: &Store,
        id: &str,
        ts: i64,
        role: &str,
        content: &str,
        user: &str,
        source: &str,
    ) {
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO messages
                        (id, session_key, timestamp, role, content, user_id, source)
                     VALUES (?1, 's1', ?2, ?3, ?4, ?5, ?6)",
                    params![id, ts, role, content, user, source],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn insert_chunk(store: &Store, id: &str, user: &str, content: &str) {
        let chunk = TranscriptChunkRow {
            id: id.to_string(),
            user_id: user.to_string(),
            session_key: "s1".to_string(),
            message_ids: vec![],
            timestamp_start: 100,
            timestamp_end: 200,
            role: "conversation".to_string(),
            content: content.to_string(),
            embedding: None,
            embedding_model: None,
            created_at: 0,
        };
        store
            .with_conn(|conn| queries::upsert_chunk(conn, &chunk))
            .unwrap();
    }

    fn searcher(store: &Store) -> TranscriptSearcher {
        TranscriptSearcher::new(store.clone(), EmbeddingProvider::Null)
    }

    #[tokio::test]
    async fn test_search_scopes_to_user() {
        let store = Store::open_in_memory().unwrap();
        insert_chunk(&store, "c1", "u1", "discussing the rollout plan for the feature");
        insert_chunk(&store, "c2", "u1", "more rollout details and timing");
        insert_chunk(&store, "c3", "u2", "someone else talks about the rollout");

        let searcher = searcher(&store);
        let options = TranscriptSearchOptions {
            min_score: 0.0,
            ..Default::default()
        };

        let scoped = searcher.search("rollout", "u1", false, &options).await.unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|r| r.user_id == "u1"));

        let all = searcher.search("rollout", "u1", true, &options).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_exact_boost_prefers_literal_matches() {
        let store = Store::open_in_memory().unwrap();
        insert_chunk(&store, "c1", "u1", "the database migration plan moved forward");
        insert_chunk(&store, "c2", "u1", "databases and migrations were discussed loosely");

        let searcher = searcher(&store);
        let boosted = TranscriptSearchOptions {
            min_score: 0.0,
            exact_boost: Some(0.25),
            ..Default::default()
        };
        let results = searcher
            .search("database migration", "u1", true, &boosted)
            .await
            .unwrap();
        assert_eq!(results[0].id, "c1");
    }

    #[test]
    fn test_recent_is_scoped_and_truncated() {
        let store = Store::open_in_memory().unwrap();
        let long_content = "x".repeat(500);
        insert_message(&store, "m1", 100, "user", &long_content, "u1", "chat");
        insert_message(&store, "m2", 200, "user", "short", "u2", "chat");

        let searcher = searcher(&store);
        let scoped = searcher.recent("u1", false, 10, &QueryFilter::default()).unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(scoped[0].content.chars().count() <= MESSAGE_PREVIEW_CHARS + 1);

        let all = searcher.recent("u1", true, 10, &QueryFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].id, "m2");
    }

    #[test]
    fn test_exact_search_substring_and_scoping() {
        let store = Store::open_in_memory().unwrap();
        insert_message(&store, "m1", 100, "user", "planning the Rollout today", "u1", "chat");
        insert_message(&store, "m2", 200, "user", "rollout went well", "u1", "chat");
        insert_message(&store, "m3", 300, "user", "my rollout notes", "u2", "chat");

        let searcher = searcher(&store);

        let scoped = searcher
            .exact_search("rollout", "u1", false, 10, &QueryFilter::default())
            .unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|m| m.user_id == "u1"));

        let all = searcher
            .exact_search("rollout", "u1", true, 10, &QueryFilter::default())
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_gaps_finds_long_silences_per_user() {
        let store = Store::open_in_memory().unwrap();
        let hour = 3600;
        insert_message(&store, "m1", 0, "user", "morning", "u1", "chat");
        insert_message(&store, "m2", 2 * hour, "user", "after a two hour gap", "u1", "chat");
        insert_message(&store, "m3", 2 * hour + 60, "user", "right after", "u1", "chat");
        // Another user's message inside the window must not break the gap
        insert_message(&store, "m4", hour, "user", "unrelated", "u2", "chat");

        let searcher = searcher(&store);
        let gaps = searcher
            .gaps("u1", false, 1.0, 10, &QueryFilter::default())
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].before.id, "m1");
        assert_eq!(gaps[0].after.id, "m2");
        assert!((gaps[0].gap_hours - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_query_filter_sources_and_time() {
        let store = Store::open_in_memory().unwrap();
        insert_message(&store, "m1", 100, "user", "from chat", "u1", "chat");
        insert_message(&store, "m2", 200, "user", "from cron", "u1", "cron");
        insert_message(&store, "m3", 300, "user", "from heartbeat", "u1", "heartbeat");

        let searcher = searcher(&store);

        let human = QueryFilter {
            human_only: true,
            ..Default::default()
        };
        let results = searcher.recent("u1", true, 10, &human).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "m1");

        let windowed = QueryFilter {
            after: Some(150),
            before: Some(250),
            ..Default::default()
        };
        let results = searcher.recent("u1", true, 10, &windowed).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "m2");

        let excluded = QueryFilter {
            exclude_sources: vec!["cron".to_string()],
            ..Default::default()
        };
        let results = searcher.recent("u1", true, 10, &excluded).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_stats_counts() {
        let store = Store::open_in_memory().unwrap();
        insert_chunk(&store, "c1", "u1", "content without embedding");
        insert_message(&store, "m1", 100, "user", "pending message with enough length here", "u1", "chat");

        let searcher = searcher(&store);
        let stats = searcher.stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.chunks_with_embeddings, 0);
        assert_eq!(stats.chunks_needing_embeddings, 1);
        assert_eq!(stats.pending_messages, 1);
        assert_eq!(stats.provider, "null");
    }
}
