//! Row-level queries for the transcript index tables.
//!
//! The `messages` table is owned by the chat channel collaborator: the
//! core reads rows and writes only `transcript_indexed_at`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::util::{deserialize_embedding, serialize_embedding};

/// A stored session message (read-only input)
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_key: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub role: String,
    pub content: String,
    pub user_id: String,
    pub source: String,
    pub transcript_indexed_at: Option<i64>,
}

/// A conversational chunk grouped from messages
#[derive(Debug, Clone)]
pub struct TranscriptChunkRow {
    pub id: String,
    pub user_id: String,
    pub session_key: String,
    pub message_ids: Vec<String>,
    pub timestamp_start: i64,
    pub timestamp_end: i64,
    pub role: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: i64,
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        session_key: row.get("session_key")?,
        timestamp: row.get("timestamp")?,
        role: row.get("role")?,
        content: row.get("content")?,
        user_id: row.get("user_id")?,
        source: row.get("source")?,
        transcript_indexed_at: row.get("transcript_indexed_at")?,
    })
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<TranscriptChunkRow> {
    let message_ids: String = row.get("message_ids")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(TranscriptChunkRow {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_key: row.get("session_key")?,
        message_ids: serde_json::from_str(&message_ids).unwrap_or_default(),
        timestamp_start: row.get("timestamp_start")?,
        timestamp_end: row.get("timestamp_end")?,
        role: row.get("role")?,
        content: row.get("content")?,
        embedding: embedding.map(|b| deserialize_embedding(&b)),
        embedding_model: row.get("embedding_model")?,
        created_at: row.get("created_at")?,
    })
}

/// Select up to `limit` user/assistant messages not yet indexed, ordered
/// by session and timestamp so grouping sees conversations in order.
pub fn select_unindexed_messages(conn: &Connection, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_key, timestamp, role, content, user_id, source,
                transcript_indexed_at
         FROM messages
         WHERE transcript_indexed_at IS NULL AND role IN ('user', 'assistant')
         ORDER BY session_key, timestamp
         LIMIT ?1",
    )?;
    let messages = stmt
        .query_map([limit as i64], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// Record that a message has been absorbed into the transcript index
pub fn mark_message_indexed(conn: &Connection, message_id: &str, at_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE messages SET transcript_indexed_at = ?2 WHERE id = ?1",
        params![message_id, at_ms],
    )?;
    Ok(())
}

/// Insert a transcript chunk.
///
/// Idempotent on id: re-inserting an existing chunk refreshes its
/// embedding, so a crash between chunk insert and message marking can be
/// replayed safely.
pub fn upsert_chunk(conn: &Connection, chunk: &TranscriptChunkRow) -> Result<()> {
    conn.execute(
        "INSERT INTO transcript_chunks
            (id, user_id, session_key, message_ids, timestamp_start,
             timestamp_end, role, content, embedding, embedding_model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            embedding = excluded.embedding,
            embedding_model = excluded.embedding_model",
        params![
            chunk.id,
            chunk.user_id,
            chunk.session_key,
            serde_json::to_string(&chunk.message_ids)?,
            chunk.timestamp_start,
            chunk.timestamp_end,
            chunk.role,
            chunk.content,
            chunk.embedding.as_deref().map(serialize_embedding),
            chunk.embedding_model,
            chunk.created_at,
        ],
    )?;
    Ok(())
}

/// Fetch a single chunk by id
pub fn get_chunk(conn: &Connection, id: &str) -> Result<Option<TranscriptChunkRow>> {
    let chunk = conn
        .query_row(
            "SELECT id, user_id, session_key, message_ids, timestamp_start,
                    timestamp_end, role, content, embedding, embedding_model, created_at
             FROM transcript_chunks WHERE id = ?1",
            [id],
            chunk_from_row,
        )
        .optional()?;
    Ok(chunk)
}

/// Oldest chunks still missing embeddings (backfill input)
pub fn unembedded_chunks(conn: &Connection, limit: usize) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, content FROM transcript_chunks
         WHERE embedding IS NULL
         ORDER BY created_at
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Attach an embedding to an existing chunk
pub fn set_chunk_embedding(
    conn: &Connection,
    id: &str,
    embedding: &[f32],
    model: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE transcript_chunks SET embedding = ?2, embedding_model = ?3 WHERE id = ?1",
        params![id, serialize_embedding(embedding), model],
    )?;
    Ok(())
}

/// Embedded chunks for the linear cosine scan, optionally scoped to a user
pub fn embedded_chunks(conn: &Connection, user_scope: Option<&str>) -> Result<Vec<(String, Vec<f32>)>> {
    let mut sql = String::from(
        "SELECT id, embedding FROM transcript_chunks WHERE embedding IS NOT NULL",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(user_id) = user_scope {
        sql.push_str(" AND user_id = ?1");
        params_vec.push(Box::new(user_id.to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, deserialize_embedding(&blob)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Counters surfaced by `TranscriptSearcher::stats`
#[derive(Debug, Clone, Default)]
pub struct TranscriptCounts {
    pub total_chunks: i64,
    pub chunks_with_embeddings: i64,
    pub pending_messages: i64,
}

pub fn counts(conn: &Connection) -> Result<TranscriptCounts> {
    let total_chunks: i64 =
        conn.query_row("SELECT COUNT(*) FROM transcript_chunks", [], |row| {
            row.get(0)
        })?;
    let chunks_with_embeddings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transcript_chunks WHERE embedding IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    let pending_messages: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE transcript_indexed_at IS NULL AND role IN ('user', 'assistant')",
        [],
        |row| row.get(0),
    )?;
    Ok(TranscriptCounts {
        total_chunks,
        chunks_with_embeddings,
        pending_messages,
    })
}
