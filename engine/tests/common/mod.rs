//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use offsync_engine::document::{self, Document};
use offsync_engine::{MemoryStore, OperationKind, Query, RemoteError, RemoteTable, SyncContext};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("test document must be an object")
}

pub fn item(id: &str, text: &str) -> Document {
    doc(json!({"id": id, "text": text}))
}

/// One remote call as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: OperationKind,
    pub table: String,
    pub ids: Vec<String>,
}

/// In-memory server with optimistic versioning.
///
/// Every accepted write bumps the row's `version` token. A write carrying a
/// different version than the stored row is rejected with a precondition
/// failure; a write without a version is accepted.
#[derive(Debug, Default)]
pub struct VersionedRemote {
    rows: Mutex<BTreeMap<(String, String), Document>>,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    /// Omit the server copy from conflict faults
    pub hide_server_item: bool,
}

impl VersionedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hiding_server_item() -> Arc<Self> {
        Arc::new(Self {
            hide_server_item: true,
            ..Self::default()
        })
    }

    /// Store a row directly, as if another client had written it.
    pub fn seed(&self, table: &str, row: Document) {
        let id = document::document_id(&row).expect("row id").to_string();
        self.rows.lock().unwrap().insert((table.to_string(), id), row);
    }

    /// Change a stored row and bump its version.
    pub fn edit(&self, table: &str, id: &str, field: &str, value: Value) {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&(table.to_string(), id.to_string()))
            .expect("row to edit");
        row.insert(field.to_string(), value);
        let next = next_version(Some(row));
        row.insert("version".into(), json!(next));
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Document> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(t, _)| t == table)
            .count()
    }

    /// Make every write touching `id` fail with an invalid-operation fault.
    pub fn fail_on(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Undo [`VersionedRemote::fail_on`].
    pub fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls that carried `id`.
    pub fn calls_for(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.ids.iter().any(|i| i == id))
            .count()
    }

    fn record(&self, kind: OperationKind, table: &str, items: &[Document]) {
        let ids = items
            .iter()
            .filter_map(|i| document::document_id(i).map(str::to_string))
            .collect();
        self.calls.lock().unwrap().push(Call {
            kind,
            table: table.to_string(),
            ids,
        });
    }

    fn write(
        &self,
        kind: OperationKind,
        table: &str,
        item: &Document,
    ) -> Result<Option<Document>, RemoteError> {
        let id = document::document_id(item)
            .ok_or_else(|| RemoteError::InvalidOperation("missing id".into()))?
            .to_string();
        if self.failing.lock().unwrap().contains(&id) {
            return Err(RemoteError::InvalidOperation(format!("rejected '{id}'")));
        }

        let mut rows = self.rows.lock().unwrap();
        let key = (table.to_string(), id.clone());
        let current = rows.get(&key).cloned();

        match (kind, &current) {
            (OperationKind::Insert, Some(existing)) => {
                return Err(self.conflict(existing));
            }
            (OperationKind::Update | OperationKind::Delete, None) => {
                return Err(RemoteError::NotFound(id));
            }
            (OperationKind::Update | OperationKind::Delete, Some(existing)) => {
                let sent = document::server_version(item);
                if sent.is_some() && sent != document::server_version(existing) {
                    return Err(self.conflict(existing));
                }
            }
            (OperationKind::Insert, None) => {}
        }

        if kind == OperationKind::Delete {
            rows.remove(&key);
            return Ok(None);
        }

        let mut stored = item.clone();
        stored.insert("version".into(), json!(next_version(current.as_ref())));
        rows.insert(key, stored.clone());
        Ok(Some(stored))
    }

    fn conflict(&self, existing: &Document) -> RemoteError {
        RemoteError::PreconditionFailed {
            server_item: (!self.hide_server_item).then(|| existing.clone()),
        }
    }

    fn write_all(
        &self,
        kind: OperationKind,
        table: &str,
        items: &[Document],
    ) -> Result<Value, RemoteError> {
        let mut accepted = Vec::new();
        let mut server_items = Vec::new();
        for item in items {
            match self.write(kind, table, item) {
                Ok(stored) => accepted.push(stored.unwrap_or_else(|| item.clone())),
                Err(RemoteError::PreconditionFailed { server_item }) => {
                    let id = document::document_id(item).unwrap_or_default();
                    server_items.extend(server_item.or_else(|| self.row(table, id)));
                }
                Err(e) => return Err(e),
            }
        }
        if !server_items.is_empty() {
            return Err(RemoteError::BulkConflict {
                accepted,
                server_items,
            });
        }
        if kind == OperationKind::Delete {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(accepted.into_iter().map(Value::Object).collect())
    }
}

fn next_version(current: Option<&Document>) -> String {
    let n = current
        .and_then(document::server_version)
        .and_then(Value::as_str)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    (n + 1).to_string()
}

#[async_trait]
impl RemoteTable for VersionedRemote {
    async fn insert(&self, table: &str, item: &Document) -> Result<Value, RemoteError> {
        self.record(OperationKind::Insert, table, std::slice::from_ref(item));
        self.write(OperationKind::Insert, table, item)
            .map(|stored| stored.map_or(Value::Null, Value::Object))
    }

    async fn update(&self, table: &str, item: &Document) -> Result<Value, RemoteError> {
        self.record(OperationKind::Update, table, std::slice::from_ref(item));
        self.write(OperationKind::Update, table, item)
            .map(|stored| stored.map_or(Value::Null, Value::Object))
    }

    async fn delete(&self, table: &str, item: &Document) -> Result<Value, RemoteError> {
        self.record(OperationKind::Delete, table, std::slice::from_ref(item));
        self.write(OperationKind::Delete, table, item)
            .map(|_| Value::Null)
    }

    async fn insert_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError> {
        self.record(OperationKind::Insert, table, items);
        self.write_all(OperationKind::Insert, table, items)
    }

    async fn update_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError> {
        self.record(OperationKind::Update, table, items);
        self.write_all(OperationKind::Update, table, items)
    }

    async fn delete_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError> {
        self.record(OperationKind::Delete, table, items);
        self.write_all(OperationKind::Delete, table, items)
    }

    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        Ok(self.row(table, id))
    }

    async fn read(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        let rows = self.rows.lock().unwrap();
        let table_rows = rows
            .iter()
            .filter(|((t, _), _)| *t == query.table)
            .map(|(_, row)| row);
        Ok(query.apply(table_rows).values)
    }
}

/// An initialized context over a fresh store.
pub async fn context(remote: Arc<VersionedRemote>) -> (SyncContext, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(store.clone(), remote);
    ctx.initialize().await.expect("initialize");
    (ctx, store)
}
