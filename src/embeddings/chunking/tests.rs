use super::overlap_tail as overlap_tail_impl;
use super::*;

fn paragraph(word: &str, target_len: usize) -> String {
    let mut text = String::new();
    while text.len() < target_len {
        text.push_str(word);
        text.push(' ');
    }
    text.trim_end().to_string()
}

#[test]
fn short_input_is_a_single_chunk() {
    let config = ChunkerConfig::default();
    let content = "Just a short post body.";

    let chunks = chunk_text(content, ContentType::Post, &config);

    assert_eq!(chunks, vec![content.to_string()]);
}

#[test]
fn short_input_ignores_minimum_size() {
    let config = ChunkerConfig::default();
    // Far below min_chunk_size, still returned as-is
    let chunks = chunk_text("hi", ContentType::Comment, &config);
    assert_eq!(chunks, vec!["hi".to_string()]);
}

#[test]
fn two_large_paragraphs_split_with_overlap() {
    let config = ChunkerConfig::default();
    let first = paragraph("alpha beta gamma delta", 4500);
    let second = paragraph("epsilon zeta eta theta", 4500);
    let content = format!("{first}\n\n{second}");
    assert!(content.len() >= 9000);

    let chunks = chunk_text(&content, ContentType::Post, &config);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0], first);

    let overlap = overlap_tail_impl(&first, config.overlap_words);
    assert!(!overlap.is_empty());
    assert!(chunks[1].starts_with(&overlap));
    assert!(chunks[1].contains(&second));
}

#[test]
fn closed_chunks_respect_target_bound() {
    let config = ChunkerConfig::default();
    let paragraphs: Vec<String> = (0..30).map(|_| paragraph("lorem ipsum dolor", 500)).collect();
    let content = paragraphs.join("\n\n");

    let chunks = chunk_text(&content, ContentType::Post, &config);

    assert!(chunks.len() > 1);
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(
            chunk.len() <= config.target_chunk_size + 2,
            "closed chunk of {} chars exceeds target",
            chunk.len()
        );
    }
    for chunk in &chunks {
        assert!(chunk.len() >= config.min_chunk_size);
    }
}

#[test]
fn short_trailing_remainder_is_dropped() {
    let config = ChunkerConfig {
        overlap_words: 5,
        ..ChunkerConfig::default()
    };
    let body = paragraph("quantified discussion thread", 4200);
    let content = format!("{body}\n\ntiny tail");

    let chunks = chunk_text(&content, ContentType::Post, &config);

    // The 5-word overlap plus "tiny tail" stays under min_chunk_size
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0], body);
}

#[test]
fn undersized_buffer_absorbs_next_paragraph() {
    let config = ChunkerConfig::default();
    let lead = "A short intro line.";
    let rest = paragraph("substantive follow-up content", 4500);
    let content = format!("{lead}\n\n{rest}");

    let chunks = chunk_text(&content, ContentType::Post, &config);

    // The intro is too small to stand alone, so it merges forward
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with(lead));
    assert!(chunks[0].ends_with(rest.trim_end()));
}

#[test]
fn blank_heavy_input_drops_empty_paragraphs() {
    let config = ChunkerConfig {
        target_chunk_size: 40,
        min_chunk_size: 10,
        overlap_words: 2,
        max_tokens: 8000,
    };
    let content = "first paragraph here\n\n\n\n\n\nsecond paragraph here\n\n   \n\nthird one";

    let chunks = chunk_text(content, ContentType::Comment, &config);

    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(!chunk.trim().is_empty());
    }
}

#[test]
fn estimate_four_chars_per_token() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("abcd"), 1);
    assert_eq!(estimate_tokens("abcde"), 2);
    assert_eq!(estimate_tokens(&"a".repeat(9000)), 2250);
}

#[test]
fn overlap_tail_takes_last_words() {
    assert_eq!(overlap_tail_impl("one two three four", 2), "three four");
    assert_eq!(overlap_tail_impl("one two", 10), "one two");
    assert_eq!(overlap_tail_impl("", 5), "");
    assert_eq!(overlap_tail_impl("anything", 0), "");
}
