//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run pending migrations inside a single transaction.
///
/// The version is read before any writes are opened; a database at the
/// current version is untouched.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| {
                let value: String = row.get(0)?;
                Ok(value.parse().unwrap_or(0))
            },
        )
        .unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch("BEGIN")?;
    let result = migrate_v1(conn).and_then(|_| {
        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Initial schema: memory index, transcript index, embedding cache, and
/// the FTS mirror triggers that keep the virtual tables in lockstep with
/// their base tables.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Indexer metadata (last sync times, counters)
        CREATE TABLE IF NOT EXISTS memory_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Indexed file records
        CREATE TABLE IF NOT EXISTS memory_files (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            mtime_ms INTEGER NOT NULL,
            size INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        );

        -- Markdown chunks
        CREATE TABLE IF NOT EXISTS memory_chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL REFERENCES memory_files(path) ON DELETE CASCADE,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memory_chunks_path ON memory_chunks(path);

        CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
            text,
            id UNINDEXED,
            path UNINDEXED,
            start_line UNINDEXED,
            end_line UNINDEXED,
            content='memory_chunks',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS memory_chunks_ai AFTER INSERT ON memory_chunks BEGIN
            INSERT INTO memory_fts(rowid, text, id, path, start_line, end_line)
            VALUES (new.rowid, new.text, new.id, new.path, new.start_line, new.end_line);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_chunks_ad AFTER DELETE ON memory_chunks BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, id, path, start_line, end_line)
            VALUES ('delete', old.rowid, old.text, old.id, old.path, old.start_line, old.end_line);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_chunks_au AFTER UPDATE ON memory_chunks BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, id, path, start_line, end_line)
            VALUES ('delete', old.rowid, old.text, old.id, old.path, old.start_line, old.end_line);
            INSERT INTO memory_fts(rowid, text, id, path, start_line, end_line)
            VALUES (new.rowid, new.text, new.id, new.path, new.start_line, new.end_line);
        END;

        -- Query embedding cache keyed by content hash and model
        CREATE TABLE IF NOT EXISTS embedding_cache (
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (hash, model)
        );

        -- Conversational chunks grouped from stored messages
        CREATE TABLE IF NOT EXISTS transcript_chunks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_key TEXT NOT NULL,
            message_ids TEXT NOT NULL,
            timestamp_start INTEGER NOT NULL,
            timestamp_end INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'conversation',
            content TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transcript_chunks_user ON transcript_chunks(user_id);
        CREATE INDEX IF NOT EXISTS idx_transcript_chunks_session ON transcript_chunks(session_key);

        CREATE VIRTUAL TABLE IF NOT EXISTS transcript_fts USING fts5(
            content,
            id UNINDEXED,
            user_id UNINDEXED,
            session_key UNINDEXED,
            content='transcript_chunks',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS transcript_chunks_ai AFTER INSERT ON transcript_chunks BEGIN
            INSERT INTO transcript_fts(rowid, content, id, user_id, session_key)
            VALUES (new.rowid, new.content, new.id, new.user_id, new.session_key);
        END;

        CREATE TRIGGER IF NOT EXISTS transcript_chunks_ad AFTER DELETE ON transcript_chunks BEGIN
            INSERT INTO transcript_fts(transcript_fts, rowid, content, id, user_id, session_key)
            VALUES ('delete', old.rowid, old.content, old.id, old.user_id, old.session_key);
        END;

        CREATE TRIGGER IF NOT EXISTS transcript_chunks_au AFTER UPDATE ON transcript_chunks BEGIN
            INSERT INTO transcript_fts(transcript_fts, rowid, content, id, user_id, session_key)
            VALUES ('delete', old.rowid, old.content, old.id, old.user_id, old.session_key);
            INSERT INTO transcript_fts(rowid, content, id, user_id, session_key)
            VALUES (new.rowid, new.content, new.id, new.user_id, new.session_key);
        END;

        -- Session messages. Owned by the chat channel collaborator; the
        -- core only reads rows and writes transcript_indexed_at. Created
        -- here so the crate works standalone (IF NOT EXISTS keeps an
        -- externally provisioned table intact).
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_key TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            user_id TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL DEFAULT '',
            transcript_indexed_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_messages_unindexed
            ON messages(transcript_indexed_at) WHERE transcript_indexed_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_key, timestamp);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = open();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: String = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_fts_triggers_mirror_memory_chunks() {
        let conn = open();

        conn.execute(
            "INSERT INTO memory_files (path, content_hash, mtime_ms, size, indexed_at)
             VALUES ('a.md', 'h', 0, 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memory_chunks
                (id, path, start_line, end_line, content_hash, text, updated_at)
             VALUES ('c1', 'a.md', 1, 3, 'ch', 'alpha beta gamma', 0)",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute(
            "UPDATE memory_chunks SET text = 'delta only' WHERE id = 'c1'",
            [],
        )
        .unwrap();
        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);

        conn.execute("DELETE FROM memory_chunks WHERE id = 'c1'", [])
            .unwrap();
        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH 'delta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_fts_triggers_mirror_transcript_chunks() {
        let conn = open();

        conn.execute(
            "INSERT INTO transcript_chunks
                (id, user_id, session_key, message_ids, timestamp_start,
                 timestamp_end, content, created_at)
             VALUES ('t1', 'u1', 's1', '[]', 0, 0, 'rollout planning call', 0)",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM transcript_fts WHERE transcript_fts MATCH 'rollout'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
