//! Query builders for trigram lexical matching.
//!
//! Candidates are fetched through the FTS5 trigram tokenizer and then scored
//! in Rust with [`trigram_similarity`](lore_core::text::trigram_similarity),
//! so the ranking does not depend on FTS5's bm25 weights.

use lore_core::text::{inner_trigrams, label_key, normalize};
use lore_core::types::SearchFilters;

/// Upper bound on rows pulled from FTS5 before scoring. Filters apply
/// before this cap.
pub const LEXICAL_CANDIDATE_LIMIT: usize = 500;

/// FTS5 MATCH expression OR-ing every trigram of `pattern`.
///
/// Returns `None` when the pattern is shorter than three characters, which
/// the trigram tokenizer cannot match; callers fall back to [`like_pattern`].
pub fn trigram_match_expression(pattern: &str) -> Option<String> {
    let tokens = inner_trigrams(pattern);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// `%pattern%` with LIKE wildcards escaped by `\`.
pub fn like_pattern(pattern: &str) -> String {
    let mut escaped = String::from("%");
    for c in normalize(pattern).chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Extra `WHERE` predicates for fact candidates (table alias `f`).
///
/// Placeholders are numbered from `first`; the returned values bind to them
/// in order.
pub fn fact_filter_sql(filters: &SearchFilters, first: usize) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut values = Vec::new();
    let mut next = first;
    if !filters.character_ids.is_empty() {
        let ids: Vec<String> = filters.character_ids.iter().map(|id| id.to_string()).collect();
        sql.push_str(&format!(" AND f.character_id IN ({})", placeholders(&mut next, ids.len())));
        values.extend(ids);
    }
    if !filters.fact_types.is_empty() {
        let keys = type_keys(filters);
        sql.push_str(&format!(" AND f.fact_type_key IN ({})", placeholders(&mut next, keys.len())));
        values.extend(keys);
    }
    (sql, values)
}

/// Extra `WHERE` predicates for character candidates (table alias `c`).
///
/// `fact_types` admits characters owning at least one fact of those types.
pub fn character_filter_sql(filters: &SearchFilters, first: usize) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut values = Vec::new();
    let mut next = first;
    if !filters.character_ids.is_empty() {
        let ids: Vec<String> = filters.character_ids.iter().map(|id| id.to_string()).collect();
        sql.push_str(&format!(" AND c.id IN ({})", placeholders(&mut next, ids.len())));
        values.extend(ids);
    }
    if !filters.fact_types.is_empty() {
        let keys = type_keys(filters);
        sql.push_str(&format!(
            " AND c.id IN (SELECT character_id FROM facts WHERE fact_type_key IN ({}))",
            placeholders(&mut next, keys.len())
        ));
        values.extend(keys);
    }
    (sql, values)
}

fn type_keys(filters: &SearchFilters) -> Vec<String> {
    let mut keys: Vec<String> = filters.fact_types.iter().map(|t| label_key(t)).collect();
    keys.sort();
    keys.dedup();
    keys
}

fn placeholders(next: &mut usize, n: usize) -> String {
    let list: Vec<String> = (*next..*next + n).map(|i| format!("?{}", i)).collect();
    *next += n;
    list.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_expression_quotes_tokens() {
        assert_eq!(
            trigram_match_expression("Sword").as_deref(),
            Some("\"swo\" OR \"wor\" OR \"ord\"")
        );
    }

    #[test]
    fn test_match_expression_escapes_quotes() {
        let expr = trigram_match_expression("a\"b").unwrap();
        assert_eq!(expr, "\"a\"\"b\"");
    }

    #[test]
    fn test_short_pattern_has_no_expression() {
        assert!(trigram_match_expression("冷静").is_none());
        assert!(trigram_match_expression("  ").is_none());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern(" 冷静 "), "%冷静%");
    }

    #[test]
    fn test_fact_filter_numbers_placeholders_in_order() {
        let owner = uuid::Uuid::new_v4();
        let filters = SearchFilters {
            character_ids: vec![owner],
            fact_types: vec!["Skill".into(), " skill ".into(), "性格".into()],
            ..Default::default()
        };
        let (sql, values) = fact_filter_sql(&filters, 2);
        assert_eq!(
            sql,
            " AND f.character_id IN (?2) AND f.fact_type_key IN (?3, ?4)"
        );
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], owner.to_string());
    }

    #[test]
    fn test_empty_filters_add_nothing() {
        let (sql, values) = character_filter_sql(&SearchFilters::default(), 2);
        assert!(sql.is_empty());
        assert!(values.is_empty());
    }
}
