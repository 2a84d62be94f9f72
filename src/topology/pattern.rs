//! Topic-exchange routing key matching.
//!
//! Keys and patterns are `.`-separated words. In a pattern `*` matches exactly
//! one word and `#` matches zero or more words.

/// Returns true if `routing_key` is routed by a binding with `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn test_exact_key_matches_itself() {
        assert!(matches("review.created", "review.created"));
        assert!(!matches("review.created", "review.deleted"));
    }

    #[test]
    fn test_star_matches_exactly_one_word() {
        assert!(matches("review.*", "review.created"));
        assert!(!matches("review.*", "review"));
        assert!(!matches("review.*", "review.created.v2"));
        assert!(matches("*.created", "order.created"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        assert!(matches("product.#", "product"));
        assert!(matches("product.#", "product.updated"));
        assert!(matches("product.#", "product.stock.low"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("#.low", "product.stock.low"));
        assert!(!matches("product.#", "order.created"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(matches("*.stock.#", "product.stock"));
        assert!(matches("*.stock.#", "product.stock.low.warehouse"));
        assert!(!matches("*.stock.#", "stock.low"));
    }
}
