//! Local store contract.
//!
//! The engine persists both the application's table replicas and its own
//! operation queue through [`LocalStore`]. Only a small CRUD and query surface
//! is required; [`MemoryStore`] is a complete in-memory implementation.

use crate::document::{self, Document};
use crate::error::StoreError;
use crate::{ItemId, TableName};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::RwLock;

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Filter over named document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        op: CompareOp,
        field: String,
        value: Value,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    fn compare(op: CompareOp, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            op,
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Eq, field, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Ne, field, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Gt, field, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Ge, field, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Lt, field, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Le, field, value)
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// `field == v1 or field == v2 or ...`; `None` for an empty list.
    pub fn any_of<I, V>(field: &str, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        values
            .into_iter()
            .map(|v| Predicate::eq(field, v))
            .reduce(Predicate::or)
    }

    /// Evaluate against a document. Missing fields read as null.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::Compare { op, field, value } => {
                let actual = doc.get(field).unwrap_or(&Value::Null);
                let ord = compare_values(actual, value);
                match op {
                    CompareOp::Eq => ord == Some(Ordering::Equal),
                    CompareOp::Ne => ord != Some(Ordering::Equal),
                    CompareOp::Gt => ord == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                    CompareOp::Lt => ord == Some(Ordering::Less),
                    CompareOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                }
            }
            Predicate::And(a, b) => a.matches(doc) && b.matches(doc),
            Predicate::Or(a, b) => a.matches(doc) || b.matches(doc),
        }
    }
}

/// Order values of the same JSON type; `None` across types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        _ => None,
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A query against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: TableName,
    pub filter: Option<Predicate>,
    pub ordering: Vec<OrderBy>,
    pub top: Option<usize>,
    pub skip: Option<usize>,
    pub include_total_count: bool,
}

impl Query {
    /// Select everything in `table`.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            ordering: Vec::new(),
            top: None,
            skip: None,
            include_total_count: false,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.ordering.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn top(mut self, n: usize) -> Self {
        self.top = Some(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn include_total_count(mut self) -> Self {
        self.include_total_count = true;
        self
    }

    /// Run this query over an in-memory set of rows.
    pub fn apply<'a>(&self, rows: impl Iterator<Item = &'a Document>) -> QueryResult {
        let mut matched: Vec<&Document> = rows
            .filter(|row| self.filter.as_ref().map_or(true, |f| f.matches(row)))
            .collect();

        if !self.ordering.is_empty() {
            matched.sort_by(|a, b| {
                for clause in &self.ordering {
                    let x = a.get(&clause.field).unwrap_or(&Value::Null);
                    let y = b.get(&clause.field).unwrap_or(&Value::Null);
                    let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                    let ord = match clause.direction {
                        Direction::Ascending => ord,
                        Direction::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let total_count = self.include_total_count.then_some(matched.len() as u64);
        let values = matched
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.top.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        QueryResult {
            values,
            total_count,
        }
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub values: Vec<Document>,
    /// Number of matching rows before paging, when requested
    pub total_count: Option<u64>,
}

/// Durable document store consumed by the engine.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Run a query.
    async fn query(&self, query: &Query) -> Result<QueryResult, StoreError>;

    /// Insert or replace rows by id.
    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Document>,
        from_server: bool,
    ) -> Result<(), StoreError>;

    /// Delete rows by id. Unknown ids are ignored.
    async fn delete(&self, table: &str, ids: &[ItemId]) -> Result<(), StoreError>;

    /// Delete every row matching the query filter.
    async fn delete_query(&self, query: &Query) -> Result<(), StoreError>;

    /// Get one row by id.
    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Get the rows that exist among `ids`.
    async fn lookup_many(&self, table: &str, ids: &[ItemId]) -> Result<Vec<Document>, StoreError>;

    /// Count rows matching the query filter.
    async fn count(&self, query: &Query) -> Result<u64, StoreError> {
        let mut query = query.clone().include_total_count();
        query.top = Some(0);
        let result = self.query(&query).await?;
        Ok(result.total_count.unwrap_or(0))
    }
}

/// Errors raised by [`MemoryStore`].
#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("row without a string id in '{0}'")]
    MissingId(TableName),

    #[error("injected {0} failure")]
    Injected(&'static str),
}

/// In-memory [`LocalStore`], ordered by id within each table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<TableName, BTreeMap<ItemId, Document>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, AtomicOrdering::SeqCst);
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Number of rows in a table.
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, BTreeMap::len)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(AtomicOrdering::SeqCst) {
            return Err(MemoryStoreError::Injected("read").into());
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(MemoryStoreError::Injected("write").into());
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<QueryResult, StoreError> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(match tables.get(&query.table) {
            Some(rows) => query.apply(rows.values()),
            None => query.apply(std::iter::empty()),
        })
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Document>,
        _from_server: bool,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let keyed = rows
            .into_iter()
            .map(|row| match document::document_id(&row) {
                Some(id) => Ok((id.to_string(), row)),
                None => Err(MemoryStoreError::MissingId(table.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        for (id, row) in keyed {
            rows.insert(id, row);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, ids: &[ItemId]) -> Result<(), StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_query(&self, query: &Query) -> Result<(), StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(&query.table) {
            rows.retain(|_, row| !query.filter.as_ref().map_or(true, |f| f.matches(row)));
        }
        Ok(())
    }

    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn lookup_many(&self, table: &str, ids: &[ItemId]) -> Result<Vec<Document>, StoreError> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(match tables.get(table) {
            Some(rows) => ids.iter().filter_map(|id| rows.get(id)).cloned().collect(),
            None => Vec::new(),
        })
    }
}
