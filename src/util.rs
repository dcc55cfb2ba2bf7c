//! Shared utilities: hashing, vector math, snippet shaping, time parsing

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::error::{KeeperError, Result};

/// Lowercase hex SHA-256 of arbitrary bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Current time as milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Cosine similarity between two vectors
///
/// Returns 0.0 when lengths differ or either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Normalize a raw BM25 rank to (0, 1]
///
/// FTS5 bm25() returns negative values where closer to 0 is better.
pub fn normalize_bm25_rank(rank: f64) -> f32 {
    (1.0 / (1.0 + rank.abs())) as f32
}

/// Build an FTS5 MATCH expression from a user query.
///
/// Tokenizes on whitespace, strips characters with FTS5 meaning, and
/// appends `*` to each token for prefix matching. Tokens are joined with
/// a space (implicit AND). Returns an empty string for empty input.
pub fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter_map(|token| {
            let cleaned: String = token.chars().filter(|c| !"*\"'".contains(*c)).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(format!("\"{}\"*", cleaned))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shorten chunk text for display in search results.
///
/// Keeps at most `max_chars` characters, cutting at the last word boundary
/// when that boundary lies past the midpoint, and appends an ellipsis.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let head: String = text.chars().take(max_chars).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if pos > max_chars / 2 => pos,
        _ => head.len(),
    };
    let mut snippet = head[..cut].trim_end().to_string();
    snippet.push('…');
    snippet
}

/// Serialize an embedding as a little-endian f32 blob
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from a little-endian f32 blob
pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Parse a duration like `30s`, `5m`, `2h`, `1d`, `1w`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.len() < 2 {
        return Err(KeeperError::Validation(format!(
            "invalid duration: {input:?}"
        )));
    }

    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let value: i64 = number
        .parse()
        .map_err(|_| KeeperError::Validation(format!("invalid duration: {input:?}")))?;

    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        "w" => Ok(Duration::weeks(value)),
        _ => Err(KeeperError::Validation(format!(
            "invalid duration unit: {unit:?}"
        ))),
    }
}

/// Parse a point in time relative to `now`.
///
/// Accepts `+<duration>` offsets, 13-digit Unix millisecond timestamps,
/// and ISO 8601 datetimes. Returns milliseconds since the Unix epoch.
pub fn parse_relative_time(input: &str, now: DateTime<Utc>) -> Result<i64> {
    let trimmed = input.trim();

    if let Some(offset) = trimmed.strip_prefix('+') {
        let duration = parse_duration(offset)?;
        return Ok((now + duration).timestamp_millis());
    }

    if trimmed.len() == 13 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed
            .parse::<i64>()
            .map_err(|_| KeeperError::Validation(format!("invalid timestamp: {input:?}")));
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| KeeperError::Validation(format!("invalid time: {input:?}")))
}
