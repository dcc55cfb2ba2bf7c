//! Row-level queries for the memory index tables.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::util::{deserialize_embedding, serialize_embedding};

/// Tracked state of an indexed file
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub mtime_ms: i64,
    pub size: i64,
    pub indexed_at: i64,
}

/// A stored memory chunk
#[derive(Debug, Clone)]
pub struct MemoryChunkRow {
    pub id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content_hash: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub updated_at: i64,
}

/// A chunk ready to be written during a file re-index
#[derive(Debug, Clone)]
pub struct NewMemoryChunk {
    pub id: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content_hash: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<MemoryChunkRow> {
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(MemoryChunkRow {
        id: row.get("id")?,
        path: row.get("path")?,
        start_line: row.get("start_line")?,
        end_line: row.get("end_line")?,
        content_hash: row.get("content_hash")?,
        text: row.get("text")?,
        embedding: embedding.map(|b| deserialize_embedding(&b)),
        embedding_model: row.get("embedding_model")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Look up the file record for `path`
pub fn get_file(conn: &Connection, path: &str) -> Result<Option<FileRecord>> {
    let record = conn
        .query_row(
            "SELECT path, content_hash, mtime_ms, size, indexed_at
             FROM memory_files WHERE path = ?1",
            [path],
            |row| {
                Ok(FileRecord {
                    path: row.get(0)?,
                    content_hash: row.get(1)?,
                    mtime_ms: row.get(2)?,
                    size: row.get(3)?,
                    indexed_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

/// All indexed file paths
pub fn list_file_paths(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM memory_files")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(paths)
}

/// Replace all chunks for a file and upsert its record.
///
/// Must run inside a transaction: readers see either the previous chunk
/// set or the new one. Chunks are inserted in ascending line order.
pub fn replace_file_chunks(
    conn: &Connection,
    record: &FileRecord,
    chunks: &[NewMemoryChunk],
    embedding_model: &str,
) -> Result<()> {
    conn.execute("DELETE FROM memory_chunks WHERE path = ?1", [&record.path])?;

    let mut stmt = conn.prepare(
        "INSERT INTO memory_chunks
            (id, path, start_line, end_line, content_hash, text,
             embedding, embedding_model, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;

    for chunk in chunks {
        let blob = chunk.embedding.as_deref().map(serialize_embedding);
        let model = chunk.embedding.as_ref().map(|_| embedding_model);
        stmt.execute(params![
            chunk.id,
            record.path,
            chunk.start_line,
            chunk.end_line,
            chunk.content_hash,
            chunk.text,
            blob,
            model,
            record.indexed_at,
        ])?;
    }

    conn.execute(
        "INSERT INTO memory_files (path, content_hash, mtime_ms, size, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
            content_hash = excluded.content_hash,
            mtime_ms = excluded.mtime_ms,
            size = excluded.size,
            indexed_at = excluded.indexed_at",
        params![
            record.path,
            record.content_hash,
            record.mtime_ms,
            record.size,
            record.indexed_at,
        ],
    )?;

    Ok(())
}

/// Delete a file record and its chunks
pub fn delete_file(conn: &Connection, path: &str) -> Result<()> {
    conn.execute("DELETE FROM memory_chunks WHERE path = ?1", [path])?;
    conn.execute("DELETE FROM memory_files WHERE path = ?1", [path])?;
    Ok(())
}

/// Whether any chunk of `path` is missing its embedding
pub fn has_unembedded_chunks(conn: &Connection, path: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_chunks WHERE path = ?1 AND embedding IS NULL",
        [path],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Load id + vector for every embedded chunk (linear cosine scan input)
pub fn embedded_chunks(conn: &Connection) -> Result<Vec<(String, Vec<f32>)>> {
    let mut stmt =
        conn.prepare("SELECT id, embedding FROM memory_chunks WHERE embedding IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, deserialize_embedding(&blob)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Fetch a single chunk by id
pub fn get_chunk(conn: &Connection, id: &str) -> Result<Option<MemoryChunkRow>> {
    let chunk = conn
        .query_row(
            "SELECT id, path, start_line, end_line, content_hash, text,
                    embedding, embedding_model, updated_at
             FROM memory_chunks WHERE id = ?1",
            [id],
            chunk_from_row,
        )
        .optional()?;
    Ok(chunk)
}

/// All chunks for a file in line order
pub fn chunks_for_path(conn: &Connection, path: &str) -> Result<Vec<MemoryChunkRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, path, start_line, end_line, content_hash, text,
                embedding, embedding_model, updated_at
         FROM memory_chunks WHERE path = ?1
         ORDER BY start_line, end_line",
    )?;
    let chunks = stmt
        .query_map([path], chunk_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(chunks)
}

/// Total chunk count
pub fn count_chunks(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM memory_chunks", [], |row| row.get(0))?)
}

/// Read an indexer metadata value
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM memory_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Write an indexer metadata value
pub fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Look up a cached query embedding by content hash and model
pub fn cached_embedding(conn: &Connection, hash: &str, model: &str) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM embedding_cache WHERE hash = ?1 AND model = ?2",
            params![hash, model],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob.map(|b| deserialize_embedding(&b)))
}

/// Store a query embedding in the cache
pub fn store_cached_embedding(
    conn: &Connection,
    hash: &str,
    model: &str,
    embedding: &[f32],
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO embedding_cache (hash, model, embedding, dims, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(hash, model) DO UPDATE SET
            embedding = excluded.embedding,
            dims = excluded.dims,
            created_at = excluded.created_at",
        params![
            hash,
            model,
            serialize_embedding(embedding),
            embedding.len() as i64,
            now_ms,
        ],
    )?;
    Ok(())
}
