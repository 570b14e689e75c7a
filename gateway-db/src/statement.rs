//! Structured statements executed against the store.
//!
//! The sync path emits [`Upsert`]s, the query planner emits [`Select`]s.
//! Both carry enough structure for the embedded store to execute them
//! directly and render to parameterized CQL for a networked driver adapter.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

use crate::schema::TableId;

/// A single column value. Numbers are kept unsigned; the chain never
/// produces negative heights, indexes or amounts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Text(String),
    Number(u64),
    /// Ordered name/value tag pairs.
    Tags(Vec<(String, String)>),
    TextList(Vec<String>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&[(String, String)]> {
        match self {
            Self::Tags(tags) => Some(tags),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// Comparison operator of a [`Filter::Cmp`] predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ge,
    Le,
}

impl fmt::Display for Cmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ge => ">=",
            Self::Le => "<=",
        })
    }
}

/// One `WHERE` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Cmp {
        column: &'static str,
        cmp: Cmp,
        value: Value,
    },
    In {
        column: &'static str,
        values: Vec<Value>,
    },
    /// `column CONTAINS (name, value)` over a tag-list column.
    ContainsPair {
        column: &'static str,
        name: String,
        value: String,
    },
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self::Cmp {
            column,
            cmp: Cmp::Eq,
            value: value.into(),
        }
    }

    pub fn ge(column: &'static str, value: impl Into<Value>) -> Self {
        Self::Cmp {
            column,
            cmp: Cmp::Ge,
            value: value.into(),
        }
    }

    pub fn le(column: &'static str, value: impl Into<Value>) -> Self {
        Self::Cmp {
            column,
            cmp: Cmp::Le,
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(column: &'static str, values: Vec<V>) -> Self {
        Self::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Aggregate projection of a [`Select`]. Only `MAX` is needed: the sync
/// engine probes the highest stored height at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Max(&'static str),
}

/// A range/point read against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub table: TableId,
    /// Empty means all columns.
    pub columns: Vec<&'static str>,
    pub filters: Vec<Filter>,
    pub aggregate: Option<Aggregate>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from_table(table: TableId) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            aggregate: None,
            limit: None,
        }
    }

    pub fn max(table: TableId, column: &'static str) -> Self {
        Self {
            aggregate: Some(Aggregate::Max(column)),
            ..Self::from_table(table)
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Renders to `(cql, bind values)` with `?` placeholders.
    pub fn to_cql(&self, keyspace: &str) -> (String, Vec<Value>) {
        let projection = match self.aggregate {
            Some(Aggregate::Max(column)) => format!("MAX({column})"),
            None if self.columns.is_empty() => "*".to_owned(),
            None => self.columns.join(", "),
        };
        let mut cql = format!(
            "SELECT {projection} FROM {keyspace}.{}",
            self.table.name()
        );
        let mut params = Vec::new();
        for (i, filter) in self.filters.iter().enumerate() {
            cql.push_str(if i == 0 { " WHERE " } else { " AND " });
            match filter {
                Filter::Cmp { column, cmp, value } => {
                    cql.push_str(&format!("{column} {cmp} ?"));
                    params.push(value.clone());
                }
                Filter::In { column, values } => {
                    let placeholders = values.iter().map(|_| "?").join(", ");
                    cql.push_str(&format!("{column} IN ({placeholders})"));
                    params.extend(values.iter().cloned());
                }
                Filter::ContainsPair {
                    column,
                    name,
                    value,
                } => {
                    cql.push_str(&format!("{column} CONTAINS (?, ?)"));
                    params.push(Value::Text(name.clone()));
                    params.push(Value::Text(value.clone()));
                }
            }
        }
        if let Some(limit) = self.limit {
            cql.push_str(&format!(" LIMIT {limit}"));
        }
        cql.push_str(" ALLOW FILTERING");
        (cql, params)
    }
}

/// A primary-key-guarded insert. Re-writing an existing key overwrites the
/// row in place unless `if_not_exists` is set; fork recovery depends on the
/// overwrite behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    pub table: TableId,
    pub columns: Vec<(&'static str, Value)>,
    pub if_not_exists: bool,
}

impl Upsert {
    pub fn into_table(table: TableId) -> Self {
        Self {
            table,
            columns: Vec::new(),
            if_not_exists: false,
        }
    }

    pub fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.columns.push((column, value.into()));
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    pub fn to_cql(&self, keyspace: &str) -> (String, Vec<Value>) {
        let names = self.columns.iter().map(|(name, _)| *name).join(", ");
        let placeholders = self.columns.iter().map(|_| "?").join(", ");
        let mut cql = format!(
            "INSERT INTO {keyspace}.{} ({names}) VALUES ({placeholders})",
            self.table.name()
        );
        if self.if_not_exists {
            cql.push_str(" IF NOT EXISTS");
        }
        let params = self.columns.iter().map(|(_, v)| v.clone()).collect();
        (cql, params)
    }
}

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(pub BTreeMap<&'static str, Value>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_text)
    }

    pub fn number(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(Value::as_number)
    }

    pub fn tags(&self, column: &str) -> Option<&[(String, String)]> {
        self.get(column).and_then(Value::as_tags)
    }
}
