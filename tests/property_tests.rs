//! Property-based tests for keeper
//!
//! These tests verify invariants that must hold for all inputs:
//! - The chunker covers every non-whitespace line with valid line ranges
//! - Query sanitization and snippet shaping never panic
//! - Parsers reject garbage without panicking
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// CHUNKER TESTS
// ============================================================================

mod chunker_tests {
    use super::*;
    use keeper::chunker::chunk_markdown;

    proptest! {
        /// Invariant: chunking never panics on any input or budget
        #[test]
        fn never_panics(text in ".{0,2000}", target in 1usize..200, overlap in 0usize..100) {
            let _ = chunk_markdown(&text, target, overlap);
        }

        /// Invariant: line ranges are 1-indexed, ordered, and within the
        /// input's line count
        #[test]
        fn line_ranges_valid(text in "[ -~\n]{0,1500}", target in 1usize..100, overlap in 0usize..40) {
            let total_lines = text.split('\n').count();
            for chunk in chunk_markdown(&text, target, overlap) {
                prop_assert!(chunk.start_line >= 1);
                prop_assert!(chunk.start_line <= chunk.end_line);
                prop_assert!(chunk.end_line <= total_lines);
            }
        }

        /// Invariant: every non-whitespace line of the input is
        /// reproduced by some chunk
        #[test]
        fn covers_all_content_lines(text in "[ -~\n]{0,1500}", target in 1usize..100, overlap in 0usize..40) {
            let chunks = chunk_markdown(&text, target, overlap);
            let chunk_lines: std::collections::HashSet<&str> = chunks
                .iter()
                .flat_map(|c| c.text.split('\n'))
                .map(|l| l.trim_end())
                .collect();

            for line in text.split('\n') {
                if !line.trim().is_empty() {
                    prop_assert!(
                        chunk_lines.contains(line.trim_end()),
                        "line {:?} missing from chunks",
                        line
                    );
                }
            }
        }

        /// Invariant: chunk hashes are stable hex sha256 of the text
        #[test]
        fn hashes_are_hex(text in "[ -~\n]{1,500}") {
            for chunk in chunk_markdown(&text, 50, 10) {
                prop_assert_eq!(chunk.content_hash.len(), 64);
                prop_assert!(chunk.content_hash.chars().all(|c| c.is_ascii_hexdigit()));
            }
        }
    }
}

// ============================================================================
// QUERY SANITIZATION TESTS
// ============================================================================

mod fts_query_tests {
    use super::*;
    use keeper::util::build_fts_query;

    proptest! {
        /// Invariant: query building never panics on any string
        #[test]
        fn never_panics(s in "\\PC{0,200}") {
            let _ = build_fts_query(&s);
        }

        /// Invariant: every emitted token is a quoted prefix query
        #[test]
        fn tokens_are_quoted_prefix(s in "[a-zA-Z0-9*'\" ]{0,100}") {
            let query = build_fts_query(&s);
            if !query.is_empty() {
                for token in query.split(' ') {
                    prop_assert!(token.starts_with('"'), "token {:?}", token);
                    prop_assert!(token.ends_with("\"*"), "token {:?}", token);
                }
            }
        }

        /// Invariant: stripped characters never survive inside a token
        #[test]
        fn special_chars_stripped(s in "\\PC{0,100}") {
            let query = build_fts_query(&s);
            let inner: String = query
                .split(' ')
                .filter_map(|t| t.strip_prefix('"'))
                .filter_map(|t| t.strip_suffix("\"*"))
                .collect();
            prop_assert!(!inner.contains('"'));
            prop_assert!(!inner.contains('*'));
            prop_assert!(!inner.contains('\''));
        }
    }
}

// ============================================================================
// SNIPPET TESTS
// ============================================================================

mod snippet_tests {
    use super::*;
    use keeper::util::truncate_snippet;

    proptest! {
        /// Invariant: snippets respect the character budget (plus the
        /// ellipsis) and never panic on multi-byte input
        #[test]
        fn bounded_and_safe(s in "\\PC{0,2000}", max in 10usize..800) {
            let snippet = truncate_snippet(&s, max);
            prop_assert!(snippet.chars().count() <= max + 1);
        }

        /// Invariant: short input passes through unchanged
        #[test]
        fn short_input_unchanged(s in "\\PC{0,50}") {
            prop_assert_eq!(truncate_snippet(&s, 700), s);
        }
    }
}

// ============================================================================
// TIME PARSING TESTS
// ============================================================================

mod time_parsing_tests {
    use super::*;
    use chrono::Utc;
    use keeper::util::{parse_duration, parse_relative_time};

    proptest! {
        /// Invariant: duration parsing never panics
        #[test]
        fn duration_never_panics(s in "\\PC{0,30}") {
            let _ = parse_duration(&s);
        }

        /// Invariant: well-formed durations round-trip through seconds
        #[test]
        fn valid_durations_parse(n in 1i64..10_000, unit in prop::sample::select(vec!["s", "m", "h", "d", "w"])) {
            let parsed = parse_duration(&format!("{n}{unit}")).unwrap();
            let seconds = match unit {
                "s" => n,
                "m" => n * 60,
                "h" => n * 3_600,
                "d" => n * 86_400,
                _ => n * 604_800,
            };
            prop_assert_eq!(parsed.num_seconds(), seconds);
        }

        /// Invariant: relative time parsing never panics
        #[test]
        fn relative_never_panics(s in "\\PC{0,40}") {
            let _ = parse_relative_time(&s, Utc::now());
        }
    }
}

// ============================================================================
// COSINE SIMILARITY TESTS
// ============================================================================

mod cosine_tests {
    use super::*;
    use keeper::util::cosine_similarity;

    proptest! {
        /// Invariant: similarity is symmetric and within [-1, 1] for
        /// finite inputs
        #[test]
        fn symmetric_and_bounded(
            a in prop::collection::vec(-100.0f32..100.0, 1..64),
            b in prop::collection::vec(-100.0f32..100.0, 1..64),
        ) {
            let ab = cosine_similarity(&a, &b);
            let ba = cosine_similarity(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-5);
            prop_assert!((-1.0001..=1.0001).contains(&ab));
        }

        /// Invariant: mismatched lengths always score zero
        #[test]
        fn length_mismatch_is_zero(
            a in prop::collection::vec(-10.0f32..10.0, 1..8),
            b in prop::collection::vec(-10.0f32..10.0, 9..16),
        ) {
            prop_assert_eq!(cosine_similarity(&a, &b), 0.0);
        }
    }
}
