//! String similarity primitives shared by the translator and the resolver.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("valid token split regex"));

/// Levenshtein distance over case-folded input.
pub fn edit_distance(left: &str, right: &str) -> usize {
    strsim::levenshtein(&left.to_lowercase(), &right.to_lowercase())
}

/// `1 - distance / max(len)`, in `[0, 1]`. Two empty strings are identical.
pub fn similarity_ratio(left: &str, right: &str) -> f64 {
    let longest = left.chars().count().max(right.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(left, right) as f64 / longest as f64
}

/// Lowercased tokens longer than two characters.
pub fn tokenize(input: &str) -> Vec<String> {
    NON_WORD_RE
        .split(input)
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Identical, or within 30% of the shorter token's length in edits.
pub fn tokens_match(left: &str, right: &str) -> bool {
    if left == right {
        return true;
    }
    let shorter = left.chars().count().min(right.chars().count());
    let allowed = (shorter as f64 * 0.3).floor() as usize;
    edit_distance(left, right) <= allowed
}

/// Fraction of `label` tokens with a matching `candidate` token, normalized by the
/// smaller token count and capped at 1.
pub fn token_overlap(label: &str, candidate: &str) -> f64 {
    let label_tokens = tokenize(label);
    let candidate_tokens = tokenize(candidate);
    if label_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }

    let matched = label_tokens
        .iter()
        .filter(|token| candidate_tokens.iter().any(|other| tokens_match(token, other)))
        .count();
    let denominator = label_tokens.len().min(candidate_tokens.len());
    (matched as f64 / denominator as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::{edit_distance, similarity_ratio, token_overlap, tokenize, tokens_match};

    #[test]
    fn edit_distance_ignores_case() {
        assert_eq!(edit_distance("Orders", "orders"), 0);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn similarity_ratio_is_normalized() {
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", "abc"), 1.0);
        assert!((similarity_ratio("order_date", "order_dt") - 0.8).abs() < 1e-9);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
    }

    #[test]
    fn tokenize_drops_short_tokens() {
        assert_eq!(tokenize("Sales by Region (US)"), vec!["sales", "region"]);
        assert_eq!(tokenize("tbl_order_items"), vec!["tbl", "order", "items"]);
    }

    #[test]
    fn tokens_match_allows_small_typos() {
        assert!(tokens_match("orders", "order"));
        assert!(tokens_match("inventory", "inventroy"));
        assert!(!tokens_match("sales", "stock"));
    }

    #[test]
    fn token_overlap_normalizes_by_smaller_set() {
        assert_eq!(token_overlap("Monthly Sales", "SalesOrders"), 0.0);
        assert_eq!(token_overlap("Monthly Sales", "tbl_sales"), 0.5);
        assert_eq!(token_overlap("Sales", "sales_orders_archive"), 1.0);
        assert_eq!(token_overlap("", "orders"), 0.0);
    }
}
