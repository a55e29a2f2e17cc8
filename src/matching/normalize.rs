//! Name normalization shared by the matcher and the price-stage registry.

use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Tokens that carry no identity in product, market or stage names.
pub const DEFAULT_STOP_TOKENS: &[&str] = &[
    "and", "average", "avg", "fresh", "national", "of", "per", "price", "prices", "the",
];

/// Lowercase and strip diacritics.
///
/// Letters without a canonical decomposition that commonly show up in the
/// source feeds are folded by hand (Azerbaijani schwa and dotless i, Nordic
/// o-slash, German sharp s).
pub fn fold(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.nfd().filter(|c| !is_combining_mark(*c)) {
        match c {
            'ə' | 'Ə' => folded.push('e'),
            'ı' => folded.push('i'),
            'ø' | 'Ø' => folded.push('o'),
            'ß' => folded.push_str("ss"),
            'đ' | 'Đ' => folded.push('d'),
            'ł' | 'Ł' => folded.push('l'),
            _ => folded.extend(c.to_lowercase()),
        }
    }
    folded
}

/// Folded word tokens of `text`, without any stop-token filtering.
pub fn words(text: &str) -> Vec<String> {
    fold(text)
        .unicode_words()
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug)]
pub struct NameNormalizer {
    stop_tokens: HashSet<String>,
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self::new::<&str>(&[])
    }
}

impl NameNormalizer {
    pub fn new<S: AsRef<str>>(extra_stop_tokens: &[S]) -> Self {
        let stop_tokens = DEFAULT_STOP_TOKENS
            .iter()
            .map(|t| t.to_string())
            .chain(extra_stop_tokens.iter().map(|t| fold(t.as_ref())))
            .collect();
        NameNormalizer { stop_tokens }
    }

    /// Folded tokens with stop tokens removed. A name made only of stop tokens
    /// keeps them, otherwise it could never be matched.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        let all = words(name);
        let kept: Vec<String> = all
            .iter()
            .filter(|t| !self.stop_tokens.contains(t.as_str()))
            .cloned()
            .collect();
        if kept.is_empty() {
            all
        } else {
            kept
        }
    }

    pub fn key(&self, name: &str) -> String {
        self.tokens(name).join(" ")
    }
}
