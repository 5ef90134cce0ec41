//! Tokenization shared by the lexicon classifier and topic detector

use regex::Regex;
use std::sync::OnceLock;

fn word_regex() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| {
        Regex::new(r"[\p{L}\p{N}]+(?:['\-][\p{L}\p{N}]+)*").expect("static word pattern")
    })
}

/// Lowercased word tokens, keeping in-word hyphens and apostrophes
pub fn tokenize(text: &str) -> Vec<String> {
    word_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}
