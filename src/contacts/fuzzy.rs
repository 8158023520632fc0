//! Multi-strategy string similarity for contact name matching.
//!
//! Combines four measures and keeps the best per candidate: a word-order
//! insensitive comparison, a token-subset comparison, a sliding-window
//! substring comparison, and plain normalized edit distance. All scores
//! are in `[0, 1]`.

use strsim::normalized_levenshtein;

/// Best similarity between `query` and `target` across all strategies.
pub fn similarity(query: &str, target: &str) -> f64 {
    let a = query.to_lowercase();
    let b = target.to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let scores = [
        normalized_levenshtein(&a, &b),
        token_sort_ratio(&a, &b),
        token_set_ratio(&a, &b),
        partial_ratio(&a, &b),
    ];
    scores.into_iter().fold(0.0, f64::max).clamp(0.0, 1.0)
}

/// Compare with words sorted, so "Doe John" matches "John Doe".
fn token_sort_ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Compare token sets, so a query that is a subset of the target's words
/// ("John" vs "John Doe") scores as a full match.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let a_tokens: Vec<&str> = {
        let mut t: Vec<&str> = a.split_whitespace().collect();
        t.sort_unstable();
        t.dedup();
        t
    };
    let b_tokens: Vec<&str> = {
        let mut t: Vec<&str> = b.split_whitespace().collect();
        t.sort_unstable();
        t.dedup();
        t
    };

    let common: Vec<&str> = a_tokens
        .iter()
        .filter(|t| b_tokens.contains(t))
        .copied()
        .collect();
    if common.is_empty() {
        return 0.0;
    }

    let rest_a: Vec<&str> = a_tokens.iter().filter(|t| !common.contains(t)).copied().collect();
    let rest_b: Vec<&str> = b_tokens.iter().filter(|t| !common.contains(t)).copied().collect();

    let base = common.join(" ");
    let with_a = if rest_a.is_empty() { base.clone() } else { format!("{} {}", base, rest_a.join(" ")) };
    let with_b = if rest_b.is_empty() { base.clone() } else { format!("{} {}", base, rest_b.join(" ")) };

    [
        normalized_levenshtein(&base, &with_a),
        normalized_levenshtein(&base, &with_b),
        normalized_levenshtein(&with_a, &with_b),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

/// Slide the shorter string across the longer one and keep the best
/// aligned-window score, so a name embedded at any position still matches.
fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() { (a, b) } else { (b, a) };
    let short_len = short.chars().count();
    let long_chars: Vec<char> = long.chars().collect();
    if short_len == 0 || short_len > long_chars.len() {
        return 0.0;
    }

    let mut best: f64 = 0.0;
    for start in 0..=(long_chars.len() - short_len) {
        let window: String = long_chars[start..start + short_len].iter().collect();
        best = best.max(normalized_levenshtein(short, &window));
        if best >= 1.0 {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_one() {
        assert!(similarity("John Doe", "John Doe") > 0.99);
        assert!(similarity("john doe", "John Doe") > 0.99);
    }

    #[test]
    fn word_order_is_ignored() {
        assert!(similarity("Doe John", "John Doe") > 0.99);
    }

    #[test]
    fn token_subset_scores_high() {
        assert!(similarity("John", "John Doe") >= 0.85);
        assert!(similarity("Sarah", "Sarah Jane Smith") >= 0.85);
    }

    #[test]
    fn embedded_substring_scores_high() {
        assert!(partial_ratio("anna", "joanna lee") > 0.99);
    }

    #[test]
    fn typo_still_close() {
        assert!(similarity("Jhon Doe", "John Doe") >= 0.7);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(similarity("Zzyzx", "John Doe") < 0.5);
    }

    #[test]
    fn empty_inputs_score_zero() {
        assert_eq!(similarity("", "John"), 0.0);
        assert_eq!(similarity("John", ""), 0.0);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let s1 = similarity("Jon Do", "John Doe");
        let s2 = similarity("Jon Do", "John Doe");
        assert_eq!(s1, s2);
    }
}
