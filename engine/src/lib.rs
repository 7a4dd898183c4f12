//! # Offsync Engine
//!
//! An offline operation queue and sync engine for local replicas of remote
//! tables.
//!
//! Applications write to a local store while disconnected. Every write is
//! recorded as a durable, strictly ordered operation; a later push replays the
//! log against the remote, resolving version conflicts along the way.
//!
//! ## Design Principles
//!
//! - **One operation per item**: later writes collapse into the queued one, so
//!   a push sends each item at most once
//! - **Ordered**: operations are replayed in the order they were recorded
//! - **Pluggable IO**: the local store and the remote are traits; the engine
//!   ships an in-memory store for tests and embedding
//! - **Cancellable**: every store call and lock wait is an await point, and
//!   dropping a push future leaves the queue consistent
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! A local mutation becomes an [`Operation`] of one [`OperationKind`]:
//! insert, update or delete. Collapsing rules:
//!
//! | queued | new | result |
//! |---|---|---|
//! | insert | update | insert carrying the new payload |
//! | insert | delete | nothing left to send |
//! | update | update | update carrying the new payload |
//! | update | delete | delete |
//! | delete | anything | [`Error::CollapseInvalid`] |
//!
//! ### Queue
//!
//! The [`OperationQueue`] persists operations in the local store, assigns
//! sequence numbers and hands out batches ([`BulkOperation`]) of same-kind,
//! same-table operations to the push loop.
//!
//! ### Conflicts
//!
//! When the remote rejects a write because its version moved on, a
//! [`ConflictPolicy`] merges the client and server copies and the merged item
//! is resubmitted.
//!
//! ## Quick Start
//!
//! ```rust
//! use offsync_engine::{
//!     Document, MemoryStore, Query, RemoteError, RemoteTable, SyncContext,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! // A remote that accepts everything as is
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl RemoteTable for Echo {
//!     async fn insert(&self, _: &str, item: &Document) -> Result<Value, RemoteError> {
//!         Ok(Value::Object(item.clone()))
//!     }
//!     async fn update(&self, _: &str, item: &Document) -> Result<Value, RemoteError> {
//!         Ok(Value::Object(item.clone()))
//!     }
//!     async fn delete(&self, _: &str, _: &Document) -> Result<Value, RemoteError> {
//!         Ok(Value::Null)
//!     }
//!     async fn insert_all(&self, _: &str, items: &[Document]) -> Result<Value, RemoteError> {
//!         Ok(items.iter().cloned().map(Value::Object).collect())
//!     }
//!     async fn update_all(&self, _: &str, items: &[Document]) -> Result<Value, RemoteError> {
//!         Ok(items.iter().cloned().map(Value::Object).collect())
//!     }
//!     async fn lookup(&self, _: &str, _: &str) -> Result<Option<Document>, RemoteError> {
//!         Ok(None)
//!     }
//!     async fn read(&self, _: &Query) -> Result<Vec<Document>, RemoteError> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! // 1. Create and initialize a context
//! let ctx = SyncContext::new(Arc::new(MemoryStore::new()), Arc::new(Echo));
//! ctx.initialize().await.unwrap();
//!
//! // 2. Mutate offline; the update collapses into the queued insert
//! let item = json!({"id": "todo_1", "text": "milk"}).as_object().cloned().unwrap();
//! ctx.insert("todos", item).await.unwrap();
//! let item = json!({"id": "todo_1", "text": "oat milk"}).as_object().cloned().unwrap();
//! ctx.update("todos", item).await.unwrap();
//! assert_eq!(ctx.pending_operations().unwrap(), 1);
//!
//! // 3. Push
//! let summary = ctx.push::<&str>(&[]).await.unwrap();
//! assert_eq!(summary.pushed, 1);
//! assert_eq!(ctx.pending_operations().unwrap(), 0);
//! # });
//! ```

pub mod bulk;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod lock;
pub mod operation;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

// Re-export main types at crate root
pub use bulk::BulkOperation;
pub use config::{ConfigError, SyncConfig};
pub use conflict::{ClientWins, ConflictPolicy, ServerWins};
pub use document::Document;
pub use error::{Error, PushStatus, Result, StoreError};
pub use lock::{AsyncLockMap, KeyedLockGuard, MultiLockGuard};
pub use operation::{
    CollapseOutcome, Operation, OperationKind, OperationState, TableKind, TableOperationError,
};
pub use queue::{OperationQueue, OPERATION_QUEUE_TABLE};
pub use remote::{RemoteError, RemoteTable};
pub use store::{
    CompareOp, Direction, LocalStore, MemoryStore, OrderBy, Predicate, Query, QueryResult,
};
pub use sync::{
    DefaultSyncHandler, ExecuteOutcome, PushCompletionResult, PushSummary, RemoteExecutor,
    SyncContext, SyncHandler,
};

/// Type aliases for clarity
pub type ItemId = String;
pub type TableName = String;
pub type OperationId = String;
pub type Sequence = u64;
pub type Version = u64;
