// ABOUTME: Lightweight query checks run before anything is sent to the server
//
// This is string inspection, not a SQL parser: it rejects empty input,
// statements that are not SELECT, comment markers and statement separators.

use std::fmt;

use thiserror::Error;

/// Substrings that never belong in a subscription query.
const UNSAFE_PATTERNS: [&str; 4] = ["--", "/*", "*/", "sp_cmdshell"];

/// What is wrong with a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    #[error("at least one query is required")]
    NoQueries,

    #[error("query is empty")]
    EmptyQuery,

    #[error("only SELECT queries can be subscribed to")]
    NotSelect,

    #[error("multiple statements are not allowed")]
    MultipleStatements,

    #[error("query contains forbidden pattern `{0}`")]
    UnsafePattern(&'static str),
}

/// A rejected query, with its position in the input list when it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub index: Option<usize>,
    pub kind: ValidationErrorKind,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "query {i}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check every query; at most one error per query, in input order.
pub fn validate<S: AsRef<str>>(queries: &[S]) -> Vec<ValidationError> {
    if queries.is_empty() {
        return vec![ValidationError {
            index: None,
            kind: ValidationErrorKind::NoQueries,
        }];
    }

    queries
        .iter()
        .enumerate()
        .filter_map(|(index, query)| {
            check_query(query.as_ref()).map(|kind| ValidationError {
                index: Some(index),
                kind,
            })
        })
        .collect()
}

fn check_query(query: &str) -> Option<ValidationErrorKind> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Some(ValidationErrorKind::EmptyQuery);
    }

    let first_word: String = trimmed
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if !first_word.eq_ignore_ascii_case("select") {
        return Some(ValidationErrorKind::NotSelect);
    }

    let lowered = trimmed.to_ascii_lowercase();
    if let Some(pattern) = UNSAFE_PATTERNS.iter().find(|p| lowered.contains(*p)) {
        return Some(ValidationErrorKind::UnsafePattern(pattern));
    }

    // one trailing terminator is tolerated
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if body.contains(';') {
        return Some(ValidationErrorKind::MultipleStatements);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_an_error() {
        let errors = validate::<&str>(&[]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ValidationErrorKind::NoQueries);
        assert_eq!(errors[0].index, None);
    }

    #[test]
    fn test_one_error_for_empty_string() {
        let errors = validate(&["", "SELECT * FROM t"]);
        assert_eq!(
            errors,
            vec![ValidationError {
                index: Some(0),
                kind: ValidationErrorKind::EmptyQuery
            }]
        );
    }

    #[test]
    fn test_whitespace_only_is_empty() {
        let errors = validate(&["   \n\t"]);
        assert_eq!(errors[0].kind, ValidationErrorKind::EmptyQuery);
    }

    #[test]
    fn test_rejects_non_select() {
        for query in ["DELETE FROM t", "update t set x = 1", "SELECTED FROM t", "INSERT INTO t VALUES (1)"] {
            let errors = validate(&[query]);
            assert_eq!(errors[0].kind, ValidationErrorKind::NotSelect, "{query}");
        }
    }

    #[test]
    fn test_accepts_select_variants() {
        assert!(validate(&["select * from players"]).is_empty());
        assert!(validate(&["  SELECT * FROM t WHERE id = 3;  "]).is_empty());
        assert!(validate(&["SELECT*FROM t"]).is_empty());
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let errors = validate(&["SELECT * FROM t; DROP TABLE t"]);
        assert_eq!(errors[0].kind, ValidationErrorKind::MultipleStatements);
    }

    #[test]
    fn test_rejects_comment_markers() {
        let errors = validate(&["SELECT * FROM t --", "SELECT /* x */ 1"]);
        assert_eq!(errors[0].kind, ValidationErrorKind::UnsafePattern("--"));
        assert_eq!(errors[1].kind, ValidationErrorKind::UnsafePattern("/*"));
        assert_eq!(errors[1].index, Some(1));
    }

    #[test]
    fn test_error_message_includes_index() {
        let errors = validate(&["SELECT 1", "DROP TABLE t"]);
        assert_eq!(errors[0].to_string(), "query 1: only SELECT queries can be subscribed to");
    }
}
