//! Server-Side Row Filters
//!
//! The change feed narrows notifications with PostgREST-style filters of the
//! form `<column>=eq.<value>`. Only equality is supported; it is the single
//! operator used to scope a channel to one stream.

use std::fmt;

use serde_json::Value;

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    column: String,
    value: String,
}

impl Filter {
    /// Build `<column>=eq.<value>`.
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if the string has no `=`, an empty column, or an
    /// operator other than `eq`.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let (column, rest) = raw
            .split_once('=')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;

        if column.is_empty() {
            return Err(FilterError::Malformed(raw.to_string()));
        }

        let (operator, value) = rest
            .split_once('.')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;

        if operator != "eq" {
            return Err(FilterError::UnsupportedOperator(operator.to_string()));
        }

        Ok(Self::eq(column, value))
    }

    /// Filtered column.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Expected value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Evaluate against a row.
    ///
    /// Strings compare verbatim; numbers and booleans compare by their JSON
    /// text. Missing or null columns never match.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        match record.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string() == self.value,
            _ => false,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// Filter parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// Not of the form `<column>=<op>.<value>`.
    #[error("malformed filter: {0}")]
    Malformed(String),

    /// Operator other than `eq`.
    #[error("unsupported filter operator: {0}")]
    UnsupportedOperator(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn display_uses_wire_syntax() {
        let filter = Filter::eq("session_id", "btc-usd");
        assert_eq!(filter.to_string(), "session_id=eq.btc-usd");
    }

    #[test]
    fn parse_keeps_dots_in_value() {
        let filter = Filter::parse("session_id=eq.run.2026.03").unwrap();
        assert_eq!(filter.column(), "session_id");
        assert_eq!(filter.value(), "run.2026.03");
        assert_eq!(filter.to_string(), "session_id=eq.run.2026.03");
    }

    #[test_case("session_id" ; "no equals")]
    #[test_case("=eq.x" ; "empty column")]
    #[test_case("session_id=eq" ; "no value separator")]
    fn parse_rejects_malformed(raw: &str) {
        assert!(matches!(Filter::parse(raw), Err(FilterError::Malformed(_))));
    }

    #[test]
    fn parse_rejects_other_operators() {
        assert_eq!(
            Filter::parse("price=gt.10"),
            Err(FilterError::UnsupportedOperator("gt".to_string()))
        );
    }

    #[test]
    fn matches_string_and_numeric_columns() {
        let by_name = Filter::eq("session_id", "a");
        assert!(by_name.matches(&json!({"session_id": "a"})));
        assert!(!by_name.matches(&json!({"session_id": "b"})));
        assert!(!by_name.matches(&json!({"other": "a"})));
        assert!(!by_name.matches(&json!({"session_id": null})));

        let by_number = Filter::eq("session_id", "17");
        assert!(by_number.matches(&json!({"session_id": 17})));
    }
}
