//! Language-aware tokenization for the sparse index.
//!
//! `en`: unicode word segmentation, lowercased, stopwords removed.
//! `zh`: each CJK character plus every adjacent character bigram, so that
//! two-character and longer terms still get a matchable unit without a
//! language-specific segmenter.

use unicode_segmentation::UnicodeSegmentation;

const EN_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "were", "will", "with", "this", "these",
    "those", "but", "or", "not", "no",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    Zh,
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0xF900..=0xFAFF
    )
}

/// Guess the dominant language of `text` by the fraction of CJK codepoints.
pub fn detect_language(text: &str) -> Language {
    let total = text.chars().filter(|c| c.is_alphanumeric()).count();
    if total == 0 {
        return Language::En;
    }
    let cjk = text.chars().filter(|&c| is_cjk(c)).count();
    if cjk * 10 > total * 3 {
        Language::Zh
    } else {
        Language::En
    }
}

fn tokenize_en(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| !EN_STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn tokenize_zh(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().filter(|c| is_cjk(*c) || c.is_alphanumeric()).collect();
    let mut tokens = Vec::with_capacity(chars.len() * 2);
    for c in &chars {
        tokens.push(c.to_string());
    }
    for pair in chars.windows(2) {
        tokens.push(format!("{}{}", pair[0], pair[1]));
    }
    tokens
}

/// Tokenize `text`, auto-detecting language unless `lang` is given.
pub fn tokenize(text: &str, lang: Option<Language>) -> Vec<String> {
    match lang.unwrap_or_else(|| detect_language(text)) {
        Language::En => tokenize_en(text),
        Language::Zh => tokenize_zh(text),
    }
}
