//! Constraint-based filter expression builder.
//!
//! Builds parameterized WHERE clauses from typed predicate nodes instead of
//! ad hoc string assembly. Every value is bound as a positional parameter;
//! table and column names cannot be bound, so they are validated against a
//! strict identifier allow-list before interpolation.

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;

use super::error::StoreError;
use crate::state::{JobState, QaState};

/// A bindable constraint value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Int(i) => i.to_sql(),
            Value::Text(s) => s.to_sql(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<JobState> for Value {
    fn from(v: JobState) -> Self {
        Value::Text(v.code().to_string())
    }
}

impl From<QaState> for Value {
    fn from(v: QaState) -> Self {
        Value::Text(v.code().to_string())
    }
}

/// A constraint on a single column.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Equality.
    Eq(Value),
    /// Set membership.
    In(Vec<Value>),
    /// Range; one-sided when only one bound is present, no-op when neither.
    Range {
        min: Option<Value>,
        max: Option<Value>,
    },
    /// Case-insensitive substring match. `wildcards = false` matches the
    /// whole value exactly (still case-insensitively).
    Fuzzy { value: String, wildcards: bool },
    /// NULL test.
    Null,
    /// Membership in a parameterized sub-select.
    InSelect {
        table: String,
        column: String,
        preds: Vec<Predicate>,
    },
}

/// A column constraint with its own negation flag.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: String,
    pub constraint: Constraint,
    pub negate: bool,
}

impl Predicate {
    pub fn new(column: &str, constraint: Constraint) -> Self {
        Self {
            column: column.to_string(),
            constraint,
            negate: false,
        }
    }

    pub fn negated(column: &str, constraint: Constraint) -> Self {
        Self {
            column: column.to_string(),
            constraint,
            negate: true,
        }
    }
}

/// How predicates combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    And,
    Or,
}

/// A filter expression over one relation.
#[derive(Debug, Clone)]
pub struct ConstraintQuery {
    table: String,
    combine: Combine,
    predicates: Vec<Predicate>,
}

/// A lowered filter: SQL text (without the `WHERE` keyword, empty when
/// no predicate applied) plus its positional parameters.
#[derive(Debug)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<Value>,
}

impl WhereClause {
    /// Parameter slice in the form rusqlite expects.
    pub fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p as &dyn ToSql).collect()
    }
}

impl ConstraintQuery {
    pub fn new(table: &str) -> Result<Self, StoreError> {
        check_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
            combine: Combine::And,
            predicates: Vec::new(),
        })
    }

    pub fn new_any(table: &str) -> Result<Self, StoreError> {
        let mut query = Self::new(table)?;
        query.combine = Combine::Or;
        Ok(query)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn push(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Lowers the constraints to SQL text plus bind parameters.
    pub fn lower(&self) -> Result<WhereClause, StoreError> {
        let mut params = Vec::new();
        let mut terms = Vec::new();

        for pred in &self.predicates {
            if let Some(term) = lower_predicate(pred, &mut params)? {
                terms.push(term);
            }
        }

        let joiner = match self.combine {
            Combine::And => " AND ",
            Combine::Or => " OR ",
        };

        Ok(WhereClause {
            sql: terms.join(joiner),
            params,
        })
    }
}

/// Lowers one predicate; returns None for no-op constraints.
fn lower_predicate(
    pred: &Predicate,
    params: &mut Vec<Value>,
) -> Result<Option<String>, StoreError> {
    check_identifier(&pred.column)?;
    let col = &pred.column;

    let term = match &pred.constraint {
        Constraint::Eq(value) => {
            params.push(value.clone());
            if pred.negate {
                // Inequality admits NULL: a missing value is "not equal".
                format!("({} <> ? OR {} IS NULL)", col, col)
            } else {
                format!("{} = ?", col)
            }
        }

        Constraint::In(values) => {
            if values.is_empty() {
                // Nothing is a member of the empty set.
                if pred.negate {
                    "1 = 1".to_string()
                } else {
                    "1 = 0".to_string()
                }
            } else {
                let marks = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                if pred.negate {
                    format!("({} NOT IN ({}) OR {} IS NULL)", col, marks, col)
                } else {
                    format!("{} IN ({})", col, marks)
                }
            }
        }

        Constraint::Range { min, max } => match (min, max) {
            (Some(lo), Some(hi)) => {
                params.push(lo.clone());
                params.push(hi.clone());
                if pred.negate {
                    format!("{} NOT BETWEEN ? AND ?", col)
                } else {
                    format!("{} BETWEEN ? AND ?", col)
                }
            }
            (Some(lo), None) => {
                params.push(lo.clone());
                let op = if pred.negate { "<" } else { ">=" };
                format!("{} {} ?", col, op)
            }
            (None, Some(hi)) => {
                params.push(hi.clone());
                let op = if pred.negate { ">" } else { "<=" };
                format!("{} {} ?", col, op)
            }
            (None, None) => return Ok(None),
        },

        Constraint::Fuzzy { value, wildcards } => {
            let escaped = escape_like(value);
            let pattern = if *wildcards {
                format!("%{}%", escaped)
            } else {
                escaped
            };
            params.push(Value::Text(pattern));
            let op = if pred.negate { "NOT LIKE" } else { "LIKE" };
            format!("{} {} ? ESCAPE '\\'", col, op)
        }

        Constraint::Null => {
            if pred.negate {
                format!("{} IS NOT NULL", col)
            } else {
                format!("{} IS NULL", col)
            }
        }

        Constraint::InSelect {
            table,
            column,
            preds,
        } => {
            check_identifier(table)?;
            check_identifier(column)?;
            let mut inner_terms = Vec::new();
            for inner in preds {
                if let Some(term) = lower_predicate(inner, params)? {
                    inner_terms.push(term);
                }
            }
            let inner_where = if inner_terms.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", inner_terms.join(" AND "))
            };
            let op = if pred.negate { "NOT IN" } else { "IN" };
            format!(
                "{} {} (SELECT {} FROM {}{})",
                col, op, column, table, inner_where
            )
        }
    };

    Ok(Some(term))
}

/// Escapes LIKE metacharacters so user values match literally.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '%' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Validates a SQL identifier: ASCII alphanumeric plus underscore, not
/// starting with a digit. Identifiers cannot be bound as parameters, so
/// this allow-list is the only guard before interpolation.
pub fn check_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_one(pred: Predicate) -> (String, Vec<Value>) {
        let mut query = ConstraintQuery::new("job").unwrap();
        query.push(pred);
        let clause = query.lower().unwrap();
        (clause.sql, clause.params)
    }

    #[test]
    fn test_eq() {
        let (sql, params) = lower_one(Predicate::new("location", Constraint::Eq("SITE-A".into())));
        assert_eq!(sql, "location = ?");
        assert_eq!(params, vec![Value::Text("SITE-A".to_string())]);
    }

    #[test]
    fn test_eq_negated_admits_null() {
        let (sql, params) =
            lower_one(Predicate::negated("state", Constraint::Eq(JobState::Deleted.into())));
        assert_eq!(sql, "(state <> ? OR state IS NULL)");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_in() {
        let (sql, params) = lower_one(Predicate::new(
            "state",
            Constraint::In(vec![JobState::Queued.into(), JobState::Waiting.into()]),
        ));
        assert_eq!(sql, "state IN (?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_in_negated() {
        let (sql, _) = lower_one(Predicate::negated(
            "task",
            Constraint::In(vec!["coadd".into()]),
        ));
        assert_eq!(sql, "(task NOT IN (?) OR task IS NULL)");
    }

    #[test]
    fn test_in_empty_is_constant() {
        let (sql, params) = lower_one(Predicate::new("state", Constraint::In(vec![])));
        assert_eq!(sql, "1 = 0");
        assert!(params.is_empty());

        let (sql, _) = lower_one(Predicate::negated("state", Constraint::In(vec![])));
        assert_eq!(sql, "1 = 1");
    }

    #[test]
    fn test_range_both_bounds() {
        let (sql, params) = lower_one(Predicate::new(
            "priority",
            Constraint::Range {
                min: Some(1.into()),
                max: Some(10.into()),
            },
        ));
        assert_eq!(sql, "priority BETWEEN ? AND ?");
        assert_eq!(params, vec![Value::Int(1), Value::Int(10)]);
    }

    #[test]
    fn test_range_negated() {
        let (sql, _) = lower_one(Predicate::negated(
            "priority",
            Constraint::Range {
                min: Some(1.into()),
                max: Some(10.into()),
            },
        ));
        assert_eq!(sql, "priority NOT BETWEEN ? AND ?");
    }

    #[test]
    fn test_range_one_sided() {
        let (sql, _) = lower_one(Predicate::new(
            "priority",
            Constraint::Range {
                min: Some(5.into()),
                max: None,
            },
        ));
        assert_eq!(sql, "priority >= ?");

        // Negation flips the operator.
        let (sql, _) = lower_one(Predicate::negated(
            "priority",
            Constraint::Range {
                min: Some(5.into()),
                max: None,
            },
        ));
        assert_eq!(sql, "priority < ?");

        let (sql, _) = lower_one(Predicate::new(
            "priority",
            Constraint::Range {
                min: None,
                max: Some(5.into()),
            },
        ));
        assert_eq!(sql, "priority <= ?");
    }

    #[test]
    fn test_range_empty_is_noop() {
        let mut query = ConstraintQuery::new("job").unwrap();
        query.push(Predicate::new(
            "priority",
            Constraint::Range {
                min: None,
                max: None,
            },
        ));
        let clause = query.lower().unwrap();
        assert_eq!(clause.sql, "");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_fuzzy_with_wildcards() {
        let (sql, params) = lower_one(Predicate::new(
            "tag",
            Constraint::Fuzzy {
                value: "scuba2_2014".to_string(),
                wildcards: true,
            },
        ));
        assert_eq!(sql, "tag LIKE ? ESCAPE '\\'");
        // The underscore in the value is escaped like any other
        // LIKE metacharacter.
        assert_eq!(params, vec![Value::Text("%scuba2\\_2014%".to_string())]);
    }

    #[test]
    fn test_fuzzy_exact_escapes_metacharacters() {
        let (_, params) = lower_one(Predicate::new(
            "tag",
            Constraint::Fuzzy {
                value: "100%_raw".to_string(),
                wildcards: false,
            },
        ));
        assert_eq!(params, vec![Value::Text("100\\%\\_raw".to_string())]);
    }

    #[test]
    fn test_null() {
        let (sql, _) = lower_one(Predicate::new("foreign_id", Constraint::Null));
        assert_eq!(sql, "foreign_id IS NULL");
        let (sql, _) = lower_one(Predicate::negated("foreign_id", Constraint::Null));
        assert_eq!(sql, "foreign_id IS NOT NULL");
    }

    #[test]
    fn test_in_select() {
        let (sql, params) = lower_one(Predicate::new(
            "id",
            Constraint::InSelect {
                table: "tile".to_string(),
                column: "job_id".to_string(),
                preds: vec![Predicate::new("tile", Constraint::In(vec![5.into()]))],
            },
        ));
        assert_eq!(sql, "id IN (SELECT job_id FROM tile WHERE tile IN (?))");
        assert_eq!(params, vec![Value::Int(5)]);
    }

    #[test]
    fn test_combine_and_or() {
        let mut query = ConstraintQuery::new("job").unwrap();
        query.push(Predicate::new("location", Constraint::Eq("SITE-A".into())));
        query.push(Predicate::new("task", Constraint::Eq("reduce".into())));
        assert_eq!(query.lower().unwrap().sql, "location = ? AND task = ?");

        let mut query = ConstraintQuery::new_any("job").unwrap();
        query.push(Predicate::new("location", Constraint::Eq("SITE-A".into())));
        query.push(Predicate::new("task", Constraint::Eq("reduce".into())));
        assert_eq!(query.lower().unwrap().sql, "location = ? OR task = ?");
    }

    #[test]
    fn test_bad_identifiers_rejected() {
        assert!(ConstraintQuery::new("job; DROP TABLE job").is_err());
        assert!(ConstraintQuery::new("").is_err());
        assert!(ConstraintQuery::new("1job").is_err());

        let mut query = ConstraintQuery::new("job").unwrap();
        query.push(Predicate::new("state = '?' --", Constraint::Null));
        assert!(query.lower().is_err());
    }
}
