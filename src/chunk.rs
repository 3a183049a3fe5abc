//! Paragraph-boundary text chunker used by the text-file ingestion path.
//!
//! Splits on blank lines (`\n\n`) and packs consecutive paragraphs into
//! chunks of at most `max_chars` bytes. Paragraphs longer than the limit are
//! hard-split at the last newline or space before the limit.

use sha2::{Digest, Sha256};

/// One piece of a split text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Split text into chunks with contiguous indices starting at 0.
///
/// Whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<TextChunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[split_at..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk {
            index,
            hash: hex::encode(Sha256::digest(text.as_bytes())),
            text,
        })
        .collect()
}

/// Byte offset at which to cut `s` so the head fits in `max_chars`.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let mut limit = max_chars;
    while !s.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // a single char wider than the limit
        return s.chars().next().map(char::len_utf8).unwrap_or(s.len());
    }
    s[..limit]
        .rfind('\n')
        .or_else(|| s[..limit].rfind(' '))
        .filter(|&pos| pos > 0)
        .map(|pos| pos + 1)
        .unwrap_or(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 2000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].hash.len(), 64);
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("", 2000).is_empty());
        assert!(chunk_text(" \n\n \n\n", 2000).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, 2000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, 40);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "Index mismatch at position {}", i);
            assert!(c.text.len() <= 40);
        }
    }

    #[test]
    fn test_long_paragraph_split_on_spaces() {
        let text = "word ".repeat(30);
        let chunks = chunk_text(&text, 22);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 22);
            assert!(!c.text.starts_with(' '));
        }
    }

    #[test]
    fn test_multibyte_hard_split() {
        let text = "é".repeat(20);
        let chunks = chunk_text(&text, 7);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }
}
