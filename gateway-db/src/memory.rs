//! Embedded store with wide-column semantics.
//!
//! Rows live in per-table maps keyed by primary key; reads honor the
//! table's clustering order and `LIMIT`, writes honor primary-key
//! overwrite and `IF NOT EXISTS`. Tests and local runs use it in place of
//! the networked service behind [`Store`].

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::schema::{Order, TableId};
use crate::statement::{Aggregate, Cmp, Filter, Row, Select, Upsert, Value};
use crate::store::{Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, HashMap<Vec<Value>, Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&self, table: TableId) -> usize {
        self.tables
            .read()
            .get(table.name())
            .map_or(0, HashMap::len)
    }

    fn primary_key_of(table: TableId, row: &Row) -> Result<Vec<Value>, StoreError> {
        table
            .primary_key()
            .iter()
            .map(|column| {
                row.get(column).cloned().ok_or_else(|| {
                    StoreError::Malformed(format!(
                        "upsert into {} misses primary key column {column}",
                        table.name()
                    ))
                })
            })
            .collect()
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Cmp { column, cmp, value } => match row.get(column) {
            Some(actual) => match cmp {
                Cmp::Eq => actual == value,
                Cmp::Ge => actual >= value,
                Cmp::Le => actual <= value,
            },
            None => false,
        },
        Filter::In { column, values } => row
            .get(column)
            .is_some_and(|actual| values.contains(actual)),
        Filter::ContainsPair {
            column,
            name,
            value,
        } => row.tags(column).is_some_and(|tags| {
            tags.iter()
                .any(|(n, v)| n == name && v == value)
        }),
    }
}

fn clustering_cmp(table: TableId, a: &Row, b: &Row) -> Ordering {
    for (column, _, order) in table.schema().clustering_key {
        let ordering = a.get(column).cmp(&b.get(column));
        let ordering = match order {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, select: Select) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(select.table.name())
            .map(|rows| {
                rows.values()
                    .filter(|row| select.filters.iter().all(|f| matches(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(Aggregate::Max(column)) = select.aggregate {
            let max = rows.iter().filter_map(|row| row.number(column)).max();
            return Ok(match max {
                Some(max) => {
                    let mut row = Row::default();
                    row.0.insert(column, Value::Number(max));
                    vec![row]
                }
                None => Vec::new(),
            });
        }

        rows.sort_by(|a, b| clustering_cmp(select.table, a, b));
        if let Some(limit) = select.limit {
            rows.truncate(limit);
        }
        if !select.columns.is_empty() {
            for row in &mut rows {
                row.0.retain(|column, _| select.columns.contains(column));
            }
        }
        Ok(rows)
    }

    async fn batch(&self, statements: Vec<Upsert>) -> Result<(), StoreError> {
        // Validate the whole batch before touching any table so the batch
        // stays atomic.
        let mut prepared = Vec::with_capacity(statements.len());
        for upsert in statements {
            let row = Row(upsert.columns.iter().cloned().collect());
            let key = Self::primary_key_of(upsert.table, &row)?;
            prepared.push((upsert.table, key, row, upsert.if_not_exists));
        }
        let mut tables = self.tables.write();
        for (table, key, row, if_not_exists) in prepared {
            let rows = tables.entry(table.name()).or_default();
            if if_not_exists && rows.contains_key(&key) {
                continue;
            }
            rows.insert(key, row);
        }
        Ok(())
    }
}
