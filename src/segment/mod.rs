//! Sentence-respecting segmentation of newly finalized transcript text.
//!
//! Long stretches of transcript are cut into bounded segments so each
//! translation call stays low-latency. Splits happen on sentence-terminal
//! punctuation where possible; a single oversized sentence is hard-split
//! at the length boundary rather than dropped.

/// Split raw transcript text into ordered, trimmed, non-empty segments.
///
/// Consecutive sentences are greedily packed into one segment until adding
/// the next sentence would exceed `max_len`. Empty input yields an empty
/// list. Text without terminal punctuation is treated as one sentence.
pub fn split_segments(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in split_sentences(text) {
        let sentence_chars = sentence.chars().count();

        if sentence_chars > max_len {
            // Oversized sentence: flush what we have and hard-split it.
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            segments.extend(hard_split(sentence, max_len));
            continue;
        }

        if current.is_empty() {
            current = sentence.to_string();
            current_chars = sentence_chars;
        } else if current_chars + 1 + sentence_chars <= max_len {
            current.push(' ');
            current.push_str(sentence);
            current_chars += 1 + sentence_chars;
        } else {
            segments.push(std::mem::take(&mut current));
            current = sentence.to_string();
            current_chars = sentence_chars;
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Split text into trimmed sentences on `.`, `!` or `?` followed by
/// whitespace. The terminal punctuation stays with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            let boundary = match chars.peek() {
                Some((_, next)) if next.is_whitespace() => true,
                None => true,
                _ => false,
            };
            if boundary {
                let end = idx + ch.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
}

/// Fallback split of one oversized sentence into chunks of at most
/// `max_len` characters. Never drops text.
fn hard_split(sentence: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in sentence.chars() {
        current.push(ch);
        count += 1;
        if count == max_len {
            let chunk = current.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            current.clear();
            count = 0;
        }
    }

    let chunk = current.trim();
    if !chunk.is_empty() {
        chunks.push(chunk.to_string());
    }

    chunks
}
