/// Splits confirmed document text into fixed-size overlapping chunks.
///
/// The overlap carries context across chunk boundaries so a sentence cut in
/// half remains retrievable from either side. Boundaries are aligned to
/// `char` boundaries, never bytes.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    assert!(overlap < chunk_size, "overlap must be smaller than chunk_size");

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let stride = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::split_text;

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = split_text("hello world", 1000, 200);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn chunks_overlap_by_configured_amount() {
        let text = "a".repeat(25);
        let chunks = split_text(&text, 10, 4);
        assert_eq!(chunks[0].chars().count(), 10);
        // stride is 6, so the second chunk starts at offset 6
        assert_eq!(chunks.len(), 4);
        let total_new: usize = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| if i == 0 { c.chars().count() } else { c.chars().count().saturating_sub(4) })
            .sum();
        assert!(total_new >= 25);
    }

    #[test]
    fn consecutive_chunks_share_overlap_text() {
        let text: String = ('a'..='z').collect();
        let chunks = split_text(&text, 10, 4);
        let first_tail: String = chunks[0].chars().skip(6).collect();
        let second_head: String = chunks[1].chars().take(4).collect();
        assert_eq!(first_tail, second_head);
    }

    #[test]
    fn empty_and_whitespace_text_yield_no_chunks() {
        assert!(split_text("", 100, 10).is_empty());
        assert!(split_text("   \n\t  ", 100, 10).is_empty());
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ünïcode tèxt".repeat(10);
        let chunks = split_text(&text, 50, 10);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50);
        }
    }
}
