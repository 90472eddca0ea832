//! Text normalisation, tokenisation and keyword extraction shared by the
//! registry and the search engine.

use std::collections::HashSet;

/// Lowercase, replace anything outside `[A-Za-z0-9_\sа-яёА-ЯЁ]` with a space,
/// collapse whitespace runs, trim.
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase();
    let mut replaced = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if is_allowed(ch) {
            replaced.push(ch);
        } else {
            replaced.push(' ');
        }
    }
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_allowed(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || ch == '_'
        || ch.is_whitespace()
        || matches!(ch, 'а'..='я' | 'ё' | 'А'..='Я' | 'Ё')
}

/// `normalize(s)`, split on whitespace, drop tokens shorter than `min_len`.
pub fn tokenize(s: &str, min_len: usize) -> Vec<String> {
    normalize(s)
        .split_whitespace()
        .filter(|tok| tok.chars().count() >= min_len)
        .map(|tok| tok.to_string())
        .collect()
}

/// Derive a keyword set from a tool name and optional description:
/// the lowercased whole name, pieces split on `_`/`-` (len >= 2), and
/// `tokenize(description, 4)`.
pub fn extract_keywords(name: &str, description: Option<&str>) -> HashSet<String> {
    let mut keywords = HashSet::new();
    let lowered_name = name.to_lowercase();
    keywords.insert(lowered_name.clone());

    for piece in lowered_name.split(['_', '-']) {
        if piece.chars().count() >= 2 {
            keywords.insert(piece.to_string());
        }
    }

    if let Some(desc) = description {
        for tok in tokenize(desc, 4) {
            keywords.insert(tok);
        }
    }

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_cyrillic() {
        assert_eq!(normalize("Привет, Мир!"), "привет мир");
    }

    #[test]
    fn normalize_collapses_whitespace_and_strips_punctuation() {
        assert_eq!(normalize("  Get   Weather!! "), "get weather");
    }

    #[test]
    fn tokenize_drops_short_words() {
        let tokens = tokenize("Calculates the sum of two numbers.", 4);
        assert_eq!(
            tokens,
            vec!["calculates".to_string(), "numbers".to_string()]
        );
    }

    #[test]
    fn extract_keywords_from_underscored_name_and_description() {
        let keywords = extract_keywords(
            "calculate_sum",
            Some("Calculates the sum of two numbers."),
        );
        for expected in ["calculate_sum", "calculate", "sum", "calculates", "numbers"] {
            assert!(
                keywords.contains(expected),
                "missing keyword: {expected}"
            );
        }
    }

    #[test]
    fn extract_keywords_from_hyphenated_name() {
        let keywords = extract_keywords("my-tool", None);
        for expected in ["my-tool", "my", "tool"] {
            assert!(keywords.contains(expected), "missing keyword: {expected}");
        }
    }
}
