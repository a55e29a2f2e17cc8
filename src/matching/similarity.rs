//! Similarity scores between normalized names.

use std::collections::HashSet;

/// Calculate the Levenshtein (edit) distance between two strings.
/// Returns the minimum number of single-character edits (insertions,
/// deletions, or substitutions) required to change one string into the other.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Two rows instead of the full matrix
    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;

        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = if a_char == b_char { 0 } else { 1 };

            curr_row[j + 1] = (prev_row[j + 1] + 1) // deletion
                .min(curr_row[j] + 1) // insertion
                .min(prev_row[j] + cost); // substitution
        }

        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

/// Dice coefficient over the two token sets.
pub fn token_overlap(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    2.0 * shared as f64 / (a.len() + b.len()) as f64
}

/// `1 - distance / longest length`, over the space-joined tokens.
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / longest as f64
}

/// Score in `[0, 1]`: the mean of token overlap and edit similarity.
/// Identical non-empty token lists score exactly 1.0.
pub fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a_joined = a.join(" ");
    let b_joined = b.join(" ");
    if a_joined == b_joined {
        return 1.0;
    }
    0.5 * token_overlap(a, b) + 0.5 * edit_similarity(&a_joined, &b_joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("abc", ""), 3);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("potato", "potatoes"), 2);
        assert_eq!(levenshtein_distance("çay", "cay"), 1);
    }

    #[test]
    fn test_identical_scores_one() {
        assert_eq!(similarity(&tokens("red onion"), &tokens("red onion")), 1.0);
    }

    #[test]
    fn test_empty_scores_zero() {
        assert_eq!(similarity(&[], &tokens("onion")), 0.0);
    }

    #[test]
    fn test_word_order_is_partially_forgiven() {
        let score = similarity(&tokens("onion red"), &tokens("red onion"));
        assert!(score > 0.5 && score < 1.0, "{score}");
    }

    #[test]
    fn test_plural_forms_score_partially() {
        let score = similarity(&tokens("potatoes"), &tokens("potato"));
        // Dice is 0 on different tokens, the edit part alone gives 0.75 * 0.5
        assert!(score < 0.8, "{score}");
        let score = similarity(&tokens("white potatoes"), &tokens("white potato"));
        assert!(score > 0.6, "{score}");
    }

    #[test]
    fn test_unrelated_names_score_low() {
        assert!(similarity(&tokens("tomato"), &tokens("wheat")) < 0.3);
    }

    #[test]
    fn test_score_is_bounded() {
        for (a, b) in [("a", "b"), ("a b c", "c b a"), ("long name here", "x")] {
            let s = similarity(&tokens(a), &tokens(b));
            assert!((0.0..=1.0).contains(&s));
        }
    }
}
