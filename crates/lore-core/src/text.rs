//! Text normalization, fingerprints and fuzzy matching helpers.
//!
//! Normalization here is the single definition shared by the embedding cache,
//! the provider client and the lexical index, so that a string written through
//! one path is recognized by the others.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

/// Trim and collapse every run of whitespace to a single space.
///
/// Case is preserved: providers embed case-sensitively, so "Calm" and "calm"
/// are distinct inputs.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key for labels such as tags, aliases and fact types.
pub fn label_key(label: &str) -> String {
    clean_label(label).to_lowercase()
}

/// Display form of a label: normalized, without a leading `#`.
pub fn clean_label(label: &str) -> String {
    normalize(label.trim().trim_start_matches('#'))
}

/// Normalize a list of labels, dropping blanks and case-insensitive duplicates.
///
/// The first spelling of each label is kept as its display form.
pub fn dedup_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for label in labels {
        let display = clean_label(label.as_ref());
        if display.is_empty() {
            continue;
        }
        if seen.insert(display.to_lowercase()) {
            out.push(display);
        }
    }
    out
}

/// Stable content fingerprint: hex SHA-256 over the model id and normalized text.
pub fn fingerprint(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Keep the first `budget` characters. Returns the input unchanged when it fits.
pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Character trigrams of the lowercased, normalized text.
///
/// The text is padded with two leading spaces and one trailing space so that
/// short strings (including single CJK characters) still yield trigrams.
pub fn trigrams(text: &str) -> HashSet<String> {
    let padded: Vec<char> = format!("  {} ", normalize(text).to_lowercase())
        .chars()
        .collect();
    if padded.len() <= 3 {
        return HashSet::new();
    }
    padded.windows(3).map(|w| w.iter().collect()).collect()
}

/// Unpadded trigrams, suitable as tokens for an index lookup.
pub fn inner_trigrams(text: &str) -> Vec<String> {
    let chars: Vec<char> = normalize(text).to_lowercase().chars().collect();
    let mut seen = HashSet::new();
    chars
        .windows(3)
        .map(|w| w.iter().collect::<String>())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of the query's trigrams found in `text`, in [0, 1].
///
/// Asymmetric on purpose: a short query fully contained in a long fact scores
/// 1.0 regardless of the fact's length.
pub fn trigram_similarity(query: &str, text: &str) -> f64 {
    let q = trigrams(query);
    if q.is_empty() {
        return 0.0;
    }
    let t = trigrams(text);
    let shared = q.intersection(&t).count();
    shared as f64 / q.len() as f64
}

/// Jaccard similarity over lowercased whitespace tokens.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(&b).count();
    let union = a.union(&b).count();
    inter as f64 / union as f64
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "in", "is", "it", "its", "of", "on", "or", "she", "that", "the", "their",
    "they", "this", "to", "was", "were", "with",
];

/// The `limit` most frequent non-stop-word tokens, ties broken alphabetically.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() > 2 && !STOP_WORDS.contains(&t.as_str()))
    {
        *counts.entry(token).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  hello \t\n  world  "), "hello world");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("出身青帮，\u{3000}性格冷静"), "出身青帮， 性格冷静");
    }

    #[test]
    fn test_normalize_preserves_case() {
        assert_eq!(normalize("Calm"), "Calm");
    }

    #[test]
    fn test_label_key() {
        assert_eq!(label_key("  #Brave  Heart "), "brave heart");
        assert_eq!(label_key("冷静"), "冷静");
    }

    #[test]
    fn test_dedup_labels_keeps_first_display_form() {
        let out = dedup_labels(["Brave", "brave", " BRAVE ", "", "#loyal", "Loyal"]);
        assert_eq!(out, vec!["Brave", "loyal"]);
    }

    #[test]
    fn test_fingerprint_ignores_whitespace_differences() {
        let a = fingerprint("m", "hello   world");
        let b = fingerprint("m", " hello world ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_case_and_model() {
        assert_ne!(fingerprint("m", "Calm"), fingerprint("m", "calm"));
        assert_ne!(fingerprint("m1", "calm"), fingerprint("m2", "calm"));
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("李青在面对危险", 2), "李青");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_trigrams_pad_short_strings() {
        let t = trigrams("冷");
        assert!(t.contains("  冷"));
        assert!(t.contains(" 冷 "));
        assert!(trigrams("").is_empty());
    }

    #[test]
    fn test_inner_trigrams_are_unique() {
        assert_eq!(inner_trigrams("aaaa"), vec!["aaa"]);
        assert!(inner_trigrams("ab").is_empty());
        assert_eq!(inner_trigrams("冷静果断").len(), 2);
    }

    #[test]
    fn test_trigram_similarity_containment() {
        let sim = trigram_similarity("sword", "A master of the sword and the bow");
        assert!(sim > 0.6, "sim = {}", sim);
        assert_eq!(trigram_similarity("", "anything"), 0.0);
        assert!(trigram_similarity("xyzzy", "A master of the sword") < 0.2);
    }

    #[test]
    fn test_trigram_similarity_is_case_insensitive() {
        assert_eq!(trigram_similarity("SWORD", "sword"), 1.0);
    }

    #[test]
    fn test_jaccard_similarity() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        assert!((jaccard_similarity("a b c", "b c d") - 0.5).abs() < 1e-9);
        assert_eq!(jaccard_similarity("", ""), 0.0);
    }

    #[test]
    fn test_extract_keywords() {
        let kw = extract_keywords("The sword, the sword and the shield of the knight", 2);
        assert_eq!(kw, vec!["sword", "knight"]);
    }
}
