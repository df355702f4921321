//! Sentence splitting used by extractive compression and citation
//! extraction. Deliberately simple punctuation-based splitting rather
//! than a full sentence boundary detector.

/// Split `text` into trimmed, non-empty sentences on `.`/`!`/`?`.
pub fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Rough token estimate: ~4 characters per token. Used only for budgeting,
/// never for billing-grade accounting.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentence_terminators() {
        let sentences = split_sentences("BM25 ranks by term frequency. It also uses IDF! Does it normalize length?");
        assert_eq!(sentences.len(), 3);
    }

    #[test]
    fn ignores_empty_fragments() {
        let sentences = split_sentences("One sentence.. Another.");
        assert_eq!(sentences, vec!["One sentence", "Another"]);
    }
}
