//! Remote table capability.
//!
//! The transport is out of scope; the engine only needs something that can
//! write items to a named server table and report version conflicts.

use crate::document::{self, Document};
use crate::store::Query;
use async_trait::async_trait;
use serde_json::Value;

/// Faults reported by a remote table.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// The server version did not match the version sent with the item.
    #[error("precondition failed: server version differs")]
    PreconditionFailed { server_item: Option<Document> },

    /// Some rows of a batch conflicted.
    ///
    /// `accepted` holds the server copies of rows that were applied;
    /// `server_items` holds the current server copies of the conflicting rows.
    #[error("precondition failed for {} item(s) in batch", server_items.len())]
    BulkConflict {
        accepted: Vec<Document>,
        server_items: Vec<Document>,
    },

    /// A batch was applied in part before failing.
    ///
    /// `accepted` holds the rows that were applied; every other row of the
    /// batch failed with `source`.
    #[error("batch partly applied ({} item(s) accepted): {source}", accepted.len())]
    PartialFailure {
        accepted: Vec<Document>,
        source: Box<RemoteError>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidOperation(String),
}

impl RemoteError {
    /// Record that `accepted` rows were applied before this fault.
    ///
    /// Returns the fault unchanged when nothing was accepted.
    pub fn after_accepting(self, mut accepted: Vec<Document>) -> Self {
        if accepted.is_empty() {
            return self;
        }
        match self {
            RemoteError::PartialFailure {
                accepted: more,
                source,
            } => {
                accepted.extend(more);
                RemoteError::PartialFailure { accepted, source }
            }
            RemoteError::BulkConflict {
                accepted: more,
                server_items,
            } => {
                accepted.extend(more);
                RemoteError::BulkConflict {
                    accepted,
                    server_items,
                }
            }
            other => RemoteError::PartialFailure {
                accepted,
                source: Box::new(other),
            },
        }
    }
}

/// Write access to the server's tables.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Insert one item; returns the server copy.
    async fn insert(&self, table: &str, item: &Document) -> Result<Value, RemoteError>;

    /// Update one item; returns the server copy.
    async fn update(&self, table: &str, item: &Document) -> Result<Value, RemoteError>;

    /// Delete one item. The response body is ignored.
    async fn delete(&self, table: &str, item: &Document) -> Result<Value, RemoteError>;

    /// Insert a batch; returns an array of server copies.
    async fn insert_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError>;

    /// Update a batch; returns an array of server copies.
    async fn update_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError>;

    /// Delete a batch.
    ///
    /// Defaults to one call per item, reporting conflicts together. A fault
    /// after some deletes went through is a [`RemoteError::PartialFailure`]
    /// listing them, so they are not sent again.
    async fn delete_all(&self, table: &str, items: &[Document]) -> Result<Value, RemoteError> {
        let mut accepted = Vec::new();
        let mut server_items = Vec::new();
        for item in items {
            let fault = match self.delete(table, item).await {
                Ok(_) => {
                    accepted.push(item.clone());
                    continue;
                }
                Err(RemoteError::PreconditionFailed { server_item }) => {
                    let current = match (server_item, document::document_id(item)) {
                        (Some(server), _) => Ok(Some(server)),
                        (None, Some(id)) => self.lookup(table, id).await,
                        (None, None) => Ok(None),
                    };
                    match current {
                        Ok(current) => {
                            server_items.extend(current);
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };
            return Err(fault.after_accepting(accepted));
        }
        if server_items.is_empty() {
            Ok(Value::Array(Vec::new()))
        } else {
            Err(RemoteError::BulkConflict {
                accepted,
                server_items,
            })
        }
    }

    /// Fetch the server copy of one item.
    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Document>, RemoteError>;

    /// Read the rows matching a query (used by pull).
    async fn read(&self, query: &Query) -> Result<Vec<Document>, RemoteError>;
}

/// Find the item with `id` among a set of documents.
pub fn find_by_id<'a>(items: &'a [Document], id: &str) -> Option<&'a Document> {
    items
        .iter()
        .find(|item| document::document_id(item) == Some(id))
}
