//! Sliding-window document chunking.
//!
//! Windows are measured in characters, not bytes, so multi-byte text is
//! never split inside a code point. Each window after the first starts
//! `overlap` characters before the previous window's end.

use parlance_core::error::RetrievalError;
use parlance_core::memory::DocumentChunk;

/// Window size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 200,
        }
    }
}

impl ChunkOptions {
    pub fn new(size: usize, overlap: usize) -> Result<Self, RetrievalError> {
        let options = Self { size, overlap };
        options.validate()?;
        Ok(options)
    }

    /// `overlap >= size` would never advance the window.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.size == 0 || self.overlap >= self.size {
            return Err(RetrievalError::InvalidChunking {
                size: self.size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }
}

/// Split `text` into overlapping windows.
///
/// Empty text yields no chunks; text no longer than `size` yields one.
pub fn chunk_text(text: &str, options: ChunkOptions) -> Result<Vec<String>, RetrievalError> {
    options.validate()?;

    // Byte offset of every char boundary, including the end of the text.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let len = boundaries.len() - 1;

    let mut chunks = Vec::new();
    if len == 0 {
        return Ok(chunks);
    }

    let mut start = 0;
    loop {
        let end = (start + options.size).min(len);
        chunks.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == len {
            break;
        }
        start = end - options.overlap;
    }

    Ok(chunks)
}

/// Chunk a source document into [`DocumentChunk`]s indexed from 0.
pub fn chunk_document(
    source_name: &str,
    text: &str,
    options: ChunkOptions,
) -> Result<Vec<DocumentChunk>, RetrievalError> {
    Ok(chunk_text(text, options)?
        .into_iter()
        .enumerate()
        .map(|(index, content)| DocumentChunk::new(source_name, index, content))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_count(len: usize, size: usize, overlap: usize) -> usize {
        if len <= size {
            return 1;
        }
        (len - overlap).div_ceil(size - overlap)
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", ChunkOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = chunk_text("hello world", ChunkOptions::default()).unwrap();
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn exact_size_is_single_chunk() {
        let text = "a".repeat(1000);
        assert_eq!(chunk_text(&text, ChunkOptions::default()).unwrap().len(), 1);
    }

    #[test]
    fn chunk_count_matches_formula() {
        for (len, size, overlap) in [(1001, 1000, 200), (2500, 1000, 200), (97, 10, 3), (50, 7, 1)] {
            let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let chunks = chunk_text(&text, ChunkOptions::new(size, overlap).unwrap()).unwrap();
            assert_eq!(
                chunks.len(),
                expected_count(len, size, overlap),
                "len={len} size={size} overlap={overlap}"
            );
        }
    }

    #[test]
    fn neighbours_overlap_exactly() {
        let text: String = (0..97).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_text(&text, ChunkOptions::new(10, 3).unwrap()).unwrap();

        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(3).collect::<Vec<_>>().into_iter().rev().collect();
            let head: String = pair[1].chars().take(3).collect();
            assert_eq!(tail, head);
        }

        // Every non-final window is full-sized.
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.chars().count(), 10);
        }
        assert!(chunks.last().unwrap().chars().count() <= 10);
        assert!(chunks.last().unwrap().ends_with(&text[text.len() - 1..]));
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "héllo wörld ünïcode ✓✓✓ done";
        let chunks = chunk_text(text, ChunkOptions::new(6, 2).unwrap()).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 6));
        assert!(chunks.last().unwrap().ends_with("done"));
    }

    #[test]
    fn degenerate_overlap_rejected() {
        assert!(matches!(
            chunk_text("abc", ChunkOptions { size: 5, overlap: 5 }),
            Err(RetrievalError::InvalidChunking { size: 5, overlap: 5 })
        ));
        assert!(ChunkOptions::new(0, 0).is_err());
        assert!(ChunkOptions::new(5, 9).is_err());
    }

    #[test]
    fn document_chunks_are_contiguous() {
        let text = "x".repeat(2500);
        let chunks = chunk_document("report.txt", &text, ChunkOptions::default()).unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index, i);
            assert_eq!(chunk.source_name(), "report.txt");
        }
    }
}
