use std::collections::BTreeSet;

/// Lowercased runs of alphanumeric characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// The distinct word `k`-shingles of `text`. Text with fewer than `k` words
/// yields a single shingle of all of them, empty text yields none.
pub fn shingles(text: &str, k: usize) -> BTreeSet<String> {
    let tokens = tokenize(text);
    let k = k.max(1);
    if tokens.is_empty() {
        return BTreeSet::new();
    }
    if tokens.len() < k {
        return BTreeSet::from([tokens.join(" ")]);
    }
    tokens.windows(k).map(|w| w.join(" ")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_on_punctuation_and_lowercases() {
        assert_eq!(
            tokenize("User ADMIN logged-in from 10.0.0.1"),
            vec!["user", "admin", "logged", "in", "from", "10", "0", "0", "1"]
        );
        assert!(tokenize("  ,;- ").is_empty());
    }

    #[test]
    fn test_word_pairs() {
        let s = shingles("a b c b c", 2);
        let expected: BTreeSet<String> = ["a b", "b c", "c b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(s, expected);
    }

    #[test]
    fn test_short_text_is_one_shingle() {
        assert_eq!(shingles("Hello", 3), BTreeSet::from(["hello".to_string()]));
        assert!(shingles("", 2).is_empty());
    }
}
