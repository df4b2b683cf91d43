#[cfg(test)]
mod tests;

use tracing::debug;

use crate::database::models::ContentType;

/// Configuration for splitting source text into embedding-ready chunks.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size in characters
    pub target_chunk_size: usize,
    /// Minimum size for a trailing chunk; shorter remainders are dropped
    pub min_chunk_size: usize,
    /// Number of words carried over from the previous chunk
    pub overlap_words: usize,
    /// Provider token ceiling; chunk sizes stay well under this
    pub max_tokens: usize,
}

impl Default for ChunkerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_chunk_size: 4000,
            min_chunk_size: 200,
            overlap_words: 50,
            max_tokens: 8000,
        }
    }
}

/// Split text into overlapping, size-bounded chunks.
///
/// Pure and deterministic. Input shorter than the target size comes back as
/// a single chunk, untouched. Longer input is split on blank-line paragraph
/// boundaries and accumulated greedily; each new chunk is seeded with the
/// tail words of the previous one so context survives the boundary.
#[inline]
pub fn chunk_text(content: &str, content_type: ContentType, config: &ChunkerConfig) -> Vec<String> {
    if content.len() < config.target_chunk_size {
        return vec![content.to_string()];
    }

    let paragraphs = content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let mut chunks = Vec::new();
    let mut buffer = String::new();

    for paragraph in paragraphs {
        let projected = buffer.len() + 2 + paragraph.len();
        if !buffer.is_empty()
            && buffer.len() >= config.min_chunk_size
            && projected > config.target_chunk_size
        {
            let overlap = overlap_tail(&buffer, config.overlap_words);
            chunks.push(std::mem::take(&mut buffer));
            buffer.push_str(&overlap);
        }

        if !buffer.is_empty() {
            buffer.push_str("\n\n");
        }
        buffer.push_str(paragraph);
    }

    // A short trailing remainder is dropped rather than embedded
    if buffer.len() >= config.min_chunk_size {
        chunks.push(buffer);
    }

    debug!(
        "Chunked {} content of {} chars into {} chunks",
        content_type,
        content.len(),
        chunks.len()
    );

    chunks
}

/// Approximate token cost as ceil(len/4). Four characters per token is a
/// documented approximation, not exact tokenization.
#[inline]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// The last `words` whitespace-separated words of `text`, joined by spaces.
fn overlap_tail(text: &str, words: usize) -> String {
    if words == 0 {
        return String::new();
    }

    let all: Vec<&str> = text.split_whitespace().collect();
    let start = all.len().saturating_sub(words);
    all[start..].join(" ")
}
