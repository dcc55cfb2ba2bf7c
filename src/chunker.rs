//! Line-aware overlapping chunking of markdown text.
//!
//! Chunks never split inside a line, so every result carries an exact
//! 1-indexed inclusive line range suitable for deep-linking back into the
//! source file.

use crate::util::sha256_hex;

/// A contiguous slice of a markdown file indexed as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Chunk text with trailing whitespace trimmed
    pub text: String,
    /// First source line (1-indexed)
    pub start_line: usize,
    /// Last source line (1-indexed, inclusive)
    pub end_line: usize,
    /// Lowercase hex SHA-256 of the chunk text
    pub content_hash: String,
}

/// Split markdown text into overlapping line-aligned chunks.
///
/// `target_tokens` and `overlap_tokens` are estimated as chars / 4. A new
/// chunk is emitted whenever adding the next line would push the buffer
/// past the target; the following chunk is seeded with the tail lines of
/// the previous one up to the overlap budget. A single line longer than
/// the target becomes its own chunk rather than being split mid-line.
pub fn chunk_markdown(text: &str, target_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let max_chars = target_tokens * 4;
    let overlap_chars = overlap_tokens * 4;

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks = Vec::new();

    // Buffer of pending line indices and their combined length
    let mut buffer: Vec<usize> = Vec::new();
    let mut buffer_chars = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        let line_chars = line.len() + 1;

        // A line longer than the whole budget cannot merge with anything:
        // flush pending lines without overlap and emit it on its own.
        if line_chars > max_chars {
            if !buffer.is_empty() {
                emit(&lines, &buffer, &mut chunks);
                buffer.clear();
                buffer_chars = 0;
            }
            emit(&lines, &[idx], &mut chunks);
            continue;
        }

        if !buffer.is_empty() && buffer_chars + line_chars > max_chars {
            emit(&lines, &buffer, &mut chunks);

            // Seed the next buffer with tail lines within the overlap budget,
            // walking backwards from the line just buffered.
            let mut tail: Vec<usize> = Vec::new();
            let mut tail_chars = 0usize;
            for &prev in buffer.iter().rev() {
                let prev_chars = lines[prev].len() + 1;
                if tail_chars + prev_chars > overlap_chars {
                    break;
                }
                tail_chars += prev_chars;
                tail.push(prev);
            }
            tail.reverse();
            buffer = tail;
            buffer_chars = tail_chars;
        }

        buffer.push(idx);
        buffer_chars += line_chars;
    }

    if !buffer.is_empty() {
        emit(&lines, &buffer, &mut chunks);
    }

    chunks
}

fn emit(lines: &[&str], buffer: &[usize], chunks: &mut Vec<Chunk>) {
    let first = buffer[0];
    let last = buffer[buffer.len() - 1];
    let text = lines[first..=last].join("\n").trim_end().to_string();
    if text.is_empty() {
        return;
    }

    let content_hash = sha256_hex(text.as_bytes());
    chunks.push(Chunk {
        text,
        start_line: first + 1,
        end_line: last + 1,
        content_hash,
    });
}
