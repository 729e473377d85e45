//! Sliding-window text chunker.
//!
//! Normalizes whitespace, then cuts the text into windows of `size`
//! characters where consecutive windows share `overlap` characters. Windows
//! are measured in Unicode scalar values, so a chunk never ends inside a
//! multi-byte sequence.

/// Collapse every run of whitespace to a single space and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into overlapping passages.
///
/// Every chunk except possibly the last has exactly `size` characters, and
/// the chunks cover the whole normalized text. An `overlap >= size` never
/// stalls the loop: the window then advances by a full chunk instead.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let size = size.max(1);
    let chars: Vec<char> = normalized.chars().collect();
    let len = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + size).min(len);
        chunks.push(chars[start..end].iter().collect::<String>());
        if end == len {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }
    chunks
}
