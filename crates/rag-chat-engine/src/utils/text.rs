use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:(?:\d+|[a-zA-Z])[.)]\s+|[-*•]\s+|#+\s+)").expect("valid list marker regex")
});

static FIRST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));

/// Lowercase and collapse whitespace. Used as the dedup key for queries.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip "1.", "2)", "-", "*" style prefixes and surrounding quotes.
pub fn strip_list_marker(line: &str) -> String {
    let stripped = LIST_MARKER.replace(line, "");
    stripped
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

/// Parse model output into one entry per non-empty line.
///
/// Header lines ending in ':' are dropped.
pub fn parse_model_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(strip_list_marker)
        .filter(|l| !l.is_empty() && !l.ends_with(':'))
        .collect()
}

/// Keep first occurrence of each normalized entry, preserving order.
pub fn dedup_normalized(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let key = normalize(item);
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

/// First number in the text, clamped to [0, 1]. None when no number is present.
pub fn parse_score(output: &str) -> Option<f64> {
    let raw = FIRST_NUMBER.find(output)?.as_str().parse::<f64>().ok()?;
    if raw.is_finite() {
        Some(raw.clamp(0.0, 1.0))
    } else {
        None
    }
}

/// SHA-256 of the normalized text, hex encoded.
pub fn normalized_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
