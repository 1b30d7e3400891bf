//! crates/bedtime_core/src/chunking.rs
//!
//! Splits long text into model-sized pieces on natural boundaries.

use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;

/// Splits `text` into pieces of at most `max_length` characters.
///
/// Paragraph and line breaks are preferred over sentence ends, which are
/// preferred over word gaps; only a single unbroken run longer than
/// `max_length` gets cut mid-word. Whitespace is kept, so joining the pieces
/// gives back `text` unchanged. Empty input yields no pieces.
pub fn split(text: &str, max_length: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let capacity = max_length.max(1);
    if text.chars().count() <= capacity {
        return vec![text.to_string()];
    }

    let splitter = TextSplitter::new(ChunkConfig::new(capacity).with_trim(false));
    let chunks: Vec<String> = splitter.chunks(text).map(str::to_string).collect();

    debug!(
        input_len = text.len(),
        chunk_count = chunks.len(),
        max_length = capacity,
        "Text chunked"
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(text: &str, max_length: usize) -> Vec<String> {
        let chunks = split(text, max_length);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= max_length, "chunk too long: {:?}", chunk);
        }
        chunks
    }

    #[test]
    fn test_empty_text() {
        assert!(split("", 10).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        assert_eq!(split("once upon a time", 100), vec!["once upon a time"]);
    }

    #[test]
    fn test_chunks_rejoin_to_input() {
        let text = "The fox ran. The owl slept!\nA new day began.\n\nPart two? Yes. ".repeat(20);
        for max_length in [7, 16, 33, 100, 2000] {
            assert_well_formed(&text, max_length);
        }
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = "First paragraph here.\n\nSecond paragraph there.";
        let chunks = assert_well_formed(text, 30);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].trim(), "First paragraph here.");
        assert_eq!(chunks[1].trim(), "Second paragraph there.");
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "x".repeat(25);
        let chunks = assert_well_formed(&text, 10);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_multibyte_text_counts_characters() {
        let text = "ünïcødé wörds hère ".repeat(10);
        assert_well_formed(&text, 12);
    }
}
