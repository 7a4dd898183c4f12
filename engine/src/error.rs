//! Error types for the offsync engine.

use crate::config::ConfigError;
use crate::operation::{OperationKind, TableOperationError};
use crate::remote::RemoteError;
use crate::{ItemId, OperationId, TableName};
use thiserror::Error;

/// Boxed error coming out of a [`LocalStore`](crate::store::LocalStore) implementation.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal status of a push that did not drain cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Every unit was attempted but some remote calls failed.
    CompleteWithErrors,
    /// An interception hook aborted the push.
    CancelledByOperation,
    /// The local store failed while draining.
    InternalError,
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PushStatus::CompleteWithErrors => "completed with errors",
            PushStatus::CancelledByOperation => "cancelled by operation",
            PushStatus::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// All possible errors from the offsync engine.
#[derive(Debug, Error)]
pub enum Error {
    // Local store errors
    #[error("local store failure: {context}")]
    LocalStore {
        context: String,
        #[source]
        source: StoreError,
    },

    // Remote errors
    #[error("remote table error: {0}")]
    Remote(#[from] RemoteError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid bulk operation: {0}")]
    InvalidBulkOperation(String),

    // Local mutation errors
    #[error("cannot apply {incoming} to item '{item_id}' in '{table}': a {existing} is already queued")]
    CollapseInvalid {
        table: TableName,
        item_id: ItemId,
        existing: OperationKind,
        incoming: OperationKind,
    },

    #[error("item '{item_id}' not found in '{table}'")]
    ItemNotFound { table: TableName, item_id: ItemId },

    #[error("item '{item_id}' already exists in '{table}'")]
    ItemAlreadyExists { table: TableName, item_id: ItemId },

    // Session errors
    #[error("sync context is not initialized")]
    NotInitialized,

    #[error("table '{0}' has pending operations; push them or purge with force")]
    PurgePending(TableName),

    #[error("push {status}: {} error(s), {} operation(s) still queued", errors.len(), incomplete.len())]
    PushFailed {
        status: PushStatus,
        errors: Vec<TableOperationError>,
        incomplete: Vec<OperationId>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Wrap a store failure with the queue or table call it interrupted.
    pub fn local_store(context: impl Into<String>, source: impl Into<StoreError>) -> Self {
        Error::LocalStore {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Whether this error is a recoverable version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Remote(RemoteError::PreconditionFailed { .. })
                | Error::Remote(RemoteError::BulkConflict { .. })
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::CollapseInvalid {
            table: "todo".into(),
            item_id: "a".into(),
            existing: OperationKind::Delete,
            incoming: OperationKind::Update,
        };
        assert_eq!(
            err.to_string(),
            "cannot apply update to item 'a' in 'todo': a delete is already queued"
        );

        let err = Error::local_store("failed to delete operation", "disk full");
        assert_eq!(err.to_string(), "local store failure: failed to delete operation");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("disk full".to_string())
        );

        let err = Error::PushFailed {
            status: PushStatus::CancelledByOperation,
            errors: vec![],
            incomplete: vec!["op-1".into(), "op-2".into()],
        };
        assert_eq!(
            err.to_string(),
            "push cancelled by operation: 0 error(s), 2 operation(s) still queued"
        );
    }

    #[test]
    fn conflict_classification() {
        let err = Error::Remote(RemoteError::PreconditionFailed { server_item: None });
        assert!(err.is_conflict());

        let err = Error::Remote(RemoteError::NotFound("x".into()));
        assert!(!err.is_conflict());
    }
}
