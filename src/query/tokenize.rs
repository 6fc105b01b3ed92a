//! Search tokenization.
//!
//! Stored corpus text and incoming queries are tokenized identically:
//! split on whitespace, lowercased, stopwords removed. Positions are
//! assigned **after** stopword removal, so positional matching is closed
//! under the same rule on both sides.

use crate::value::Text;

/// Small built-in English stopword list. Terms on this list are never
/// indexed and are dropped from queries.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// True when `term` is a stopword (expects lowercased input).
pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(&term)
}

/// Tokenize `text`: whitespace split, lowercase, stopwords removed.
///
/// The index of each returned token is its corpus position.
pub fn tokenize(text: &str) -> Vec<Text> {
    text.split_whitespace()
        .map(str::to_lowercase)
        .filter(|term| !term.is_empty() && !is_stopword(term))
        .map(|term| Text::new(&term))
        .collect()
}
