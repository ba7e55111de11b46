//! Token estimation for mixed natural-language content.
//! Word-based heuristic, closer than a plain char/4 approximation.

/// Estimate tokens from text using word-based heuristic
/// Rule: avg ~1.3 tokens per word plus a small formatting overhead
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();

    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        // 7 words: 7 * 1.3 + 5 = 14.1 -> 15
        let text = "this document contains some test information here";
        assert_eq!(estimate_tokens(text), 15);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_whitespace_runs_count_once() {
        // 500 words -> 650 + 5
        let text = "word  \n".repeat(500);
        assert_eq!(estimate_tokens(&text), 655);
    }
}
