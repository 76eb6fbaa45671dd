//! Compilation of subscription filter objects into predicates.
//!
//! A filter like `{"kinds": [1], "#p": ["ab…"], "since": 1700000000}` becomes
//! a conjunction of [`Clause`]s plus a result limit. The same clauses can be
//! evaluated in memory ([`Predicate::matches`]) or rendered to a SQL
//! condition for the store.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::Event;

/// Limit applied when a filter does not carry one.
pub const DEFAULT_LIMIT: usize = 100;
/// Upper bound for any requested limit.
pub const MAX_LIMIT: usize = 100;

// ── Clauses ──────────────────────────────────────────────────────

/// Tag names that can be filtered on with `#<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagName {
    E,
    P,
    D,
}

impl TagName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagName::E => "e",
            TagName::P => "p",
            TagName::D => "d",
        }
    }

    fn from_filter_key(key: &str) -> Option<Self> {
        match key {
            "#e" => Some(TagName::E),
            "#p" => Some(TagName::P),
            "#d" => Some(TagName::D),
            _ => None,
        }
    }
}

/// One condition of a filter. All clauses of a filter must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Ids(BTreeSet<String>),
    Authors(BTreeSet<String>),
    Kinds(BTreeSet<u32>),
    /// Some tag named `.0` has its value in `.1`.
    Tag(TagName, BTreeSet<String>),
    /// `created_at` strictly greater.
    Since(i64),
    /// `created_at` strictly less.
    Until(i64),
}

impl Clause {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Clause::Ids(ids) => ids.contains(&event.id),
            Clause::Authors(authors) => authors.contains(&event.pubkey),
            Clause::Kinds(kinds) => kinds.contains(&event.kind),
            Clause::Tag(name, values) => event
                .tag_pairs()
                .any(|(n, v)| n == name.as_str() && values.contains(v)),
            Clause::Since(ts) => event.created_at > *ts,
            Clause::Until(ts) => event.created_at < *ts,
        }
    }

    /// Position in the canonical ordering used for cache keys.
    fn rank(&self) -> u8 {
        match self {
            Clause::Ids(_) => 0,
            Clause::Authors(_) => 1,
            Clause::Kinds(_) => 2,
            Clause::Tag(TagName::E, _) => 3,
            Clause::Tag(TagName::P, _) => 4,
            Clause::Tag(TagName::D, _) => 5,
            Clause::Since(_) => 6,
            Clause::Until(_) => 7,
        }
    }

    fn canonical_entry(&self) -> (String, Value) {
        match self {
            Clause::Ids(ids) => ("ids".into(), Value::from(ids.iter().cloned().collect::<Vec<_>>())),
            Clause::Authors(authors) => (
                "authors".into(),
                Value::from(authors.iter().cloned().collect::<Vec<_>>()),
            ),
            Clause::Kinds(kinds) => ("kinds".into(), Value::from(kinds.iter().copied().collect::<Vec<_>>())),
            Clause::Tag(name, values) => (
                format!("#{}", name.as_str()),
                Value::from(values.iter().cloned().collect::<Vec<_>>()),
            ),
            Clause::Since(ts) => ("since".into(), Value::from(*ts)),
            Clause::Until(ts) => ("until".into(), Value::from(*ts)),
        }
    }

    fn push_sql(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        match self {
            Clause::Ids(ids) => push_in(sql, params, "id", ids.iter().map(|s| SqlValue::Text(s.clone()))),
            Clause::Authors(authors) => push_in(
                sql,
                params,
                "pubkey",
                authors.iter().map(|s| SqlValue::Text(s.clone())),
            ),
            Clause::Kinds(kinds) => push_in(
                sql,
                params,
                "kind",
                kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))),
            ),
            Clause::Tag(name, values) => {
                params.push(SqlValue::Text(name.as_str().to_string()));
                sql.push_str(
                    "EXISTS (SELECT 1 FROM event_tags t WHERE t.event_seq = events.seq AND t.name = ? AND ",
                );
                push_in(sql, params, "t.value", values.iter().map(|s| SqlValue::Text(s.clone())));
                sql.push(')');
            }
            Clause::Since(ts) => {
                sql.push_str("created_at > ?");
                params.push(SqlValue::Integer(*ts));
            }
            Clause::Until(ts) => {
                sql.push_str("created_at < ?");
                params.push(SqlValue::Integer(*ts));
            }
        }
    }
}

fn push_in(
    sql: &mut String,
    params: &mut Vec<SqlValue>,
    column: &str,
    values: impl Iterator<Item = SqlValue>,
) {
    let start = params.len();
    params.extend(values);
    let count = params.len() - start;
    if count == 0 {
        // Membership in an empty set never holds.
        sql.push('0');
        return;
    }
    sql.push_str(column);
    sql.push_str(" IN (");
    sql.push_str(&vec!["?"; count].join(", "));
    sql.push(')');
}

// ── Predicate ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Conjunction of clauses; empty matches every event.
    All(Vec<Clause>),
    /// Matches no event. Produced for malformed filters.
    Nothing,
}

impl Predicate {
    pub fn everything() -> Self {
        Predicate::All(Vec::new())
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Predicate::All(clauses) => clauses.iter().all(|c| c.matches(event)),
            Predicate::Nothing => false,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Predicate::Nothing)
    }

    /// SQL condition over the `events` table with positional parameters.
    /// `None` for [`Predicate::Nothing`], which needs no query at all.
    pub(crate) fn to_sql(&self) -> Option<(String, Vec<SqlValue>)> {
        let Predicate::All(clauses) = self else {
            return None;
        };
        if clauses.is_empty() {
            return Some(("1".to_string(), Vec::new()));
        }
        let mut sql = String::new();
        let mut params = Vec::new();
        for (i, clause) in clauses.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            clause.push_sql(&mut sql, &mut params);
        }
        Some((sql, params))
    }
}

/// A filter ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    pub predicate: Predicate,
    pub limit: usize,
}

impl CompiledFilter {
    /// Filter that matches nothing.
    pub fn nothing() -> Self {
        Self {
            predicate: Predicate::Nothing,
            limit: 0,
        }
    }

    /// Canonical cache key. Two filters that select the same events with the
    /// same limit share a key regardless of field order or duplicate values.
    /// `None` when the filter matches nothing and needs no caching.
    pub fn cache_key(&self) -> Option<String> {
        let Predicate::All(clauses) = &self.predicate else {
            return None;
        };
        let mut map = Map::new();
        for clause in clauses {
            let (key, value) = clause.canonical_entry();
            map.insert(key, value);
        }
        map.insert("limit".into(), Value::from(self.limit));
        Some(format!("filter:{}", Value::Object(map)))
    }
}

// ── Compilation ──────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotAnObject,
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },
}

/// Compile a filter object. Never fails: malformed filters compile to a
/// predicate that matches nothing, and the problem is logged.
pub fn compile(filter: &Value) -> CompiledFilter {
    match try_compile(filter) {
        Ok(compiled) => compiled,
        Err(e) => {
            warn!("Malformed filter {}: {}", filter, e);
            CompiledFilter::nothing()
        }
    }
}

/// Strict variant of [`compile`] that reports what was wrong.
pub fn try_compile(filter: &Value) -> Result<CompiledFilter, FilterError> {
    let obj = filter.as_object().ok_or(FilterError::NotAnObject)?;
    let mut clauses = Vec::new();
    let mut limit = DEFAULT_LIMIT;

    for (key, value) in obj {
        match key.as_str() {
            "ids" => clauses.push(Clause::Ids(hex_set(key, value)?)),
            "authors" => clauses.push(Clause::Authors(hex_set(key, value)?)),
            "kinds" => clauses.push(Clause::Kinds(kind_set(key, value)?)),
            "since" => clauses.push(Clause::Since(timestamp(key, value)?)),
            "until" => clauses.push(Clause::Until(timestamp(key, value)?)),
            "limit" => {
                let requested = value.as_u64().ok_or_else(|| invalid(key, "a non-negative integer"))?;
                limit = usize::try_from(requested).unwrap_or(usize::MAX).min(MAX_LIMIT);
            }
            other => match TagName::from_filter_key(other) {
                Some(name) => clauses.push(Clause::Tag(name, string_set(key, value)?)),
                None => debug!("Ignoring unknown filter field `{}`", other),
            },
        }
    }

    clauses.sort_by_key(Clause::rank);
    Ok(CompiledFilter {
        predicate: Predicate::All(clauses),
        limit,
    })
}

fn invalid(field: &str, expected: &'static str) -> FilterError {
    FilterError::InvalidField {
        field: field.to_string(),
        expected,
    }
}

fn string_set(field: &str, value: &Value) -> Result<BTreeSet<String>, FilterError> {
    let arr = value.as_array().ok_or_else(|| invalid(field, "an array of strings"))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(field, "an array of strings"))
        })
        .collect()
}

/// Ids and pubkeys are stored as lowercase hex.
fn hex_set(field: &str, value: &Value) -> Result<BTreeSet<String>, FilterError> {
    Ok(string_set(field, value)?
        .into_iter()
        .map(|s| s.to_ascii_lowercase())
        .collect())
}

fn kind_set(field: &str, value: &Value) -> Result<BTreeSet<u32>, FilterError> {
    let arr = value
        .as_array()
        .ok_or_else(|| invalid(field, "an array of non-negative integers"))?;
    arr.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .ok_or_else(|| invalid(field, "an array of non-negative integers"))
        })
        .collect()
}

fn timestamp(field: &str, value: &Value) -> Result<i64, FilterError> {
    value.as_i64().ok_or_else(|| invalid(field, "an integer timestamp"))
}
