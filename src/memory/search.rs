//! Hybrid search over memory chunks.
//!
//! Keyword candidates come from the FTS index with normalized BM25
//! ranks; vector candidates from a linear cosine scan over embedded
//! chunks. Scores merge with configurable weights and results below the
//! minimum score are dropped.

use std::collections::HashMap;

use tracing::warn;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::storage::{memory as queries, Store};
use crate::util::{
    build_fts_query, cosine_similarity, normalize_bm25_rank, now_ms, sha256_hex, truncate_snippet,
};

/// Snippet budget for result text
const SNIPPET_MAX_CHARS: usize = 700;

/// Search tuning knobs
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    /// Results scoring below this are dropped (0.0 - 1.0)
    pub min_score: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.35,
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

/// A scored memory search hit
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f32,
    pub snippet: String,
}

/// Hybrid searcher over the memory index
#[derive(Clone)]
pub struct MemorySearcher {
    store: Store,
    provider: EmbeddingProvider,
}

impl MemorySearcher {
    pub fn new(store: Store, provider: EmbeddingProvider) -> Self {
        Self { store, provider }
    }

    /// Search memory chunks, combining keyword and vector candidates.
    ///
    /// Degrades to keyword-only ranking when the embedding provider is
    /// unavailable or the query embed fails.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let candidate_limit = options.max_results * 4;

        let keyword_scores = self.keyword_candidates(query, candidate_limit)?;
        let vector_scores = match self.query_embedding(query).await {
            Some(embedding) => self.vector_candidates(&embedding, candidate_limit)?,
            None => HashMap::new(),
        };

        let mut merged: Vec<SearchResult> = Vec::new();
        let ids: Vec<&String> = keyword_scores.keys().chain(vector_scores.keys()).collect();

        self.store.with_conn(|conn| {
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }

                let score = match (keyword_scores.get(id), vector_scores.get(id)) {
                    (Some(&kw), Some(&vec)) => {
                        options.keyword_weight * kw + options.vector_weight * vec
                    }
                    (Some(&kw), None) => kw,
                    (None, Some(&vec)) => vec,
                    (None, None) => continue,
                };

                if score < options.min_score {
                    continue;
                }

                if let Some(chunk) = queries::get_chunk(conn, id)? {
                    merged.push(SearchResult {
                        path: chunk.path,
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        score,
                        snippet: truncate_snippet(&chunk.text, SNIPPET_MAX_CHARS),
                    });
                }
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

    fn keyword_candidates(&self, query: &str, limit: usize) -> Result<HashMap<String, f32>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(HashMap::new());
        }

        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, bm25(memory_fts) AS rank
                 FROM memory_fts
                 JOIN memory_chunks c ON memory_fts.rowid = c.rowid
                 WHERE memory_fts MATCH ?1
                 ORDER BY bm25(memory_fts)
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![fts_query, limit as i64],
                |row| {
                    let id: String = row.get(0)?;
                    let rank: f64 = row.get(1)?;
                    Ok((id, normalize_bm25_rank(rank)))
                },
            )?;

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
        limit: usize,
    ) -> Result<HashMap<String, f32>> {
        let embedded = self.store.with_conn(queries::embedded_chunks)?;

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

    /// Embed the query, consulting the persistent cache first.
    ///
    /// Returns None when vectors are unavailable so the caller degrades
    /// to keyword-only search.
    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if !self.provider.available() {
            return None;
        }

        let model = self.provider.model();
        let hash = sha256_hex(query.as_bytes());

        let cached = self
            .store
            .with_conn(|conn| queries::cached_embedding(conn, &hash, &model))
            .ok()
            .flatten();
        if cached.is_some() {
            return cached;
        }

        match self.provider.embed_query(query).await {
            Ok(embedding) => {
                let stored = self.store.with_conn(|conn| {
                    queries::store_cached_embedding(conn, &hash, &model, &embedding, now_ms())
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
