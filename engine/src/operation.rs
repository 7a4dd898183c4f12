//! Queued table operations.
//!
//! Every local mutation is recorded as an [`Operation`] on the item it touches.
//! At most one live operation exists per item: later mutations collapse into
//! the queued one instead of being appended.
//!
//! The three kinds differ in how they apply locally, how they are sent to the
//! remote table, and how they collapse. Those differences live in one
//! [`KindBehavior`] table per kind rather than being spread across matches.

use crate::document::{self, Document};
use crate::error::{Error, Result};
use crate::remote::{RemoteError, RemoteTable};
use crate::store::LocalStore;
use crate::{ItemId, OperationId, Sequence, TableName, Version};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation an operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Delivery state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Not yet sent, or reset for retry
    #[default]
    Pending,
    /// Sent to the remote, result not yet recorded
    Attempted,
}

/// Kind of table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// Application data table
    #[default]
    Table,
    /// Engine-internal table
    System,
}

/// What happened to the queued operation when a new mutation was folded into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseOutcome {
    /// The queued operation absorbed the mutation and stays live.
    Merged,
    /// Both operations cancel out; nothing is left to send.
    Cancelled,
}

type LocalApplyFn =
    for<'a> fn(&'a dyn LocalStore, &'a str, &'a [Document]) -> BoxFuture<'a, Result<()>>;
type RemoteApplyFn = for<'a> fn(
    &'a dyn RemoteTable,
    &'a str,
    &'a Document,
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>>;
type RemoteApplyAllFn = for<'a> fn(
    &'a dyn RemoteTable,
    &'a str,
    &'a [Document],
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>>;
type CollapseFn = fn(&mut Operation, OperationKind, Option<Document>) -> Result<CollapseOutcome>;

/// Per-kind behavior of an operation.
pub struct KindBehavior {
    /// Whether the payload is persisted with the queue row.
    ///
    /// Inserts and updates read their payload from the local table at push
    /// time; a delete has to carry its pre-delete snapshot.
    pub serialize_item_to_queue: bool,
    /// Whether the remote response is written back to the local table.
    pub can_write_result_to_store: bool,
    /// Apply the mutation to the local table.
    pub local_apply: LocalApplyFn,
    /// Send one item to the remote table.
    pub remote_apply: RemoteApplyFn,
    /// Send several items to the remote table in one call.
    pub remote_apply_all: RemoteApplyAllFn,
    /// Fold a new mutation of the same item into a queued operation of this kind.
    pub collapse: CollapseFn,
}

const INSERT: KindBehavior = KindBehavior {
    serialize_item_to_queue: false,
    can_write_result_to_store: true,
    local_apply: insert_local,
    remote_apply: insert_remote,
    remote_apply_all: insert_all_remote,
    collapse: collapse_insert,
};

const UPDATE: KindBehavior = KindBehavior {
    serialize_item_to_queue: false,
    can_write_result_to_store: true,
    local_apply: upsert_local,
    remote_apply: update_remote,
    remote_apply_all: update_all_remote,
    collapse: collapse_update,
};

const DELETE: KindBehavior = KindBehavior {
    serialize_item_to_queue: true,
    can_write_result_to_store: false,
    local_apply: delete_local,
    remote_apply: delete_remote,
    remote_apply_all: delete_all_remote,
    collapse: collapse_delete,
};

impl OperationKind {
    /// The behavior table entry for this kind.
    pub fn behavior(self) -> &'static KindBehavior {
        match self {
            OperationKind::Insert => &INSERT,
            OperationKind::Update => &UPDATE,
            OperationKind::Delete => &DELETE,
        }
    }
}

fn insert_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    item: &'a Document,
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.insert(table, item)
}

fn insert_all_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.insert_all(table, items)
}

fn update_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    item: &'a Document,
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.update(table, item)
}

fn update_all_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.update_all(table, items)
}

fn delete_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    item: &'a Document,
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.delete(table, item)
}

fn delete_all_remote<'a>(
    remote: &'a dyn RemoteTable,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, std::result::Result<Value, RemoteError>> {
    remote.delete_all(table, items)
}

fn insert_local<'a>(
    store: &'a dyn LocalStore,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let ids = item_ids(items)?;
        let existing = store
            .lookup_many(table, &ids)
            .await
            .map_err(|e| Error::local_store(format!("failed to look up items in '{table}'"), e))?;
        if let Some(found) = existing.first() {
            return Err(Error::ItemAlreadyExists {
                table: table.to_string(),
                item_id: document::document_id(found).unwrap_or_default().to_string(),
            });
        }
        store
            .upsert(table, items.to_vec(), false)
            .await
            .map_err(|e| Error::local_store(format!("failed to insert items into '{table}'"), e))
    })
}

fn upsert_local<'a>(
    store: &'a dyn LocalStore,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        store
            .upsert(table, items.to_vec(), false)
            .await
            .map_err(|e| Error::local_store(format!("failed to update items in '{table}'"), e))
    })
}

fn delete_local<'a>(
    store: &'a dyn LocalStore,
    table: &'a str,
    items: &'a [Document],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let ids = item_ids(items)?;
        store
            .delete(table, &ids)
            .await
            .map_err(|e| Error::local_store(format!("failed to delete items from '{table}'"), e))
    })
}

fn item_ids(items: &[Document]) -> Result<Vec<ItemId>> {
    items
        .iter()
        .map(|item| {
            document::document_id(item)
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidOperation("item is missing a string id".into()))
        })
        .collect()
}

fn collapse_insert(
    op: &mut Operation,
    incoming: OperationKind,
    item: Option<Document>,
) -> Result<CollapseOutcome> {
    match incoming {
        OperationKind::Update => {
            op.item = item;
            op.version += 1;
            Ok(CollapseOutcome::Merged)
        }
        OperationKind::Delete => {
            op.cancelled = true;
            Ok(CollapseOutcome::Cancelled)
        }
        OperationKind::Insert => Err(op.collapse_error(incoming)),
    }
}

fn collapse_update(
    op: &mut Operation,
    incoming: OperationKind,
    item: Option<Document>,
) -> Result<CollapseOutcome> {
    match incoming {
        OperationKind::Update => {
            op.item = item;
            op.version += 1;
            Ok(CollapseOutcome::Merged)
        }
        OperationKind::Delete => {
            op.kind = OperationKind::Delete;
            op.item = item;
            op.state = OperationState::Pending;
            op.version += 1;
            Ok(CollapseOutcome::Merged)
        }
        OperationKind::Insert => Err(op.collapse_error(incoming)),
    }
}

fn collapse_delete(
    op: &mut Operation,
    incoming: OperationKind,
    _item: Option<Document>,
) -> Result<CollapseOutcome> {
    Err(op.collapse_error(incoming))
}

/// A queued mutation of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Operation ID
    pub id: OperationId,
    /// Mutation kind
    pub kind: OperationKind,
    /// Delivery state
    pub state: OperationState,
    /// Target table
    pub table_name: TableName,
    /// Target table kind
    pub table_kind: TableKind,
    /// Target item
    pub item_id: ItemId,
    /// Payload (pre-delete snapshot for deletes)
    pub item: Option<Document>,
    /// Global submission order, assigned at enqueue
    pub sequence: Sequence,
    /// Local optimistic counter, bumped on every rewrite
    pub version: Version,
    /// Set when the operation was cancelled out before reaching the remote
    pub cancelled: bool,
}

impl Operation {
    /// Create a pending operation with a fresh id.
    pub fn new(
        kind: OperationKind,
        table_name: impl Into<TableName>,
        table_kind: TableKind,
        item_id: impl Into<ItemId>,
        item: Option<Document>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            state: OperationState::Pending,
            table_name: table_name.into(),
            table_kind,
            item_id: item_id.into(),
            item,
            sequence: 0,
            version: 1,
            cancelled: false,
        }
    }

    /// Behavior of this operation's kind.
    pub fn behavior(&self) -> &'static KindBehavior {
        self.kind.behavior()
    }

    /// Fold a new local mutation of the same item into this operation.
    ///
    /// The result depends only on the queued kind and the incoming kind:
    ///
    /// | queued | incoming | result |
    /// |---|---|---|
    /// | insert | update | insert with the new payload |
    /// | insert | delete | cancelled |
    /// | update | update | update with the new payload |
    /// | update | delete | delete carrying the snapshot |
    /// | delete | any | [`Error::CollapseInvalid`] |
    ///
    /// An insert on an item that already has a queued operation is also
    /// rejected.
    pub fn collapse(
        &mut self,
        incoming: OperationKind,
        item: Option<Document>,
    ) -> Result<CollapseOutcome> {
        (self.behavior().collapse)(self, incoming, item)
    }

    fn collapse_error(&self, incoming: OperationKind) -> Error {
        Error::CollapseInvalid {
            table: self.table_name.clone(),
            item_id: self.item_id.clone(),
            existing: self.kind,
            incoming,
        }
    }

    /// Send this operation's payload to the remote table.
    ///
    /// Returns the server's copy for inserts and updates, `None` for deletes.
    pub async fn execute_remote(&self, remote: &dyn RemoteTable) -> Result<Option<Document>> {
        let item = self.item.as_ref().ok_or_else(|| {
            Error::InvalidOperation("operation must have an item associated with it".into())
        })?;

        let response = (self.behavior().remote_apply)(remote, &self.table_name, item).await?;

        if self.kind == OperationKind::Delete {
            return Ok(None);
        }

        document::valid_item_or_none(response).map(Some).ok_or_else(|| {
            Error::InvalidOperation("remote table returned an unexpected response".into())
        })
    }

    /// Convert to the flat row persisted in the queue table.
    pub fn to_row(&self) -> Result<Document> {
        let item = match (&self.item, self.behavior().serialize_item_to_queue) {
            (Some(item), true) => Some(
                serde_json::to_string(item)
                    .map_err(|e| Error::local_store("failed to serialize queued item", e))?,
            ),
            _ => None,
        };
        let row = QueueRow {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            table_name: self.table_name.clone(),
            table_kind: self.table_kind,
            item_id: self.item_id.clone(),
            item,
            sequence: self.sequence,
            version: self.version,
        };
        match serde_json::to_value(row) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(Error::InvalidOperation("queue row is not an object".into())),
            Err(e) => Err(Error::local_store("failed to serialize queue row", e)),
        }
    }

    /// Rebuild an operation from a queue row.
    pub fn from_row(row: Document) -> Result<Self> {
        let row: QueueRow = serde_json::from_value(Value::Object(row))
            .map_err(|e| Error::local_store("malformed operation queue row", e))?;
        let item = match row.item {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| Error::local_store("malformed queued item", e))?,
            ),
            None => None,
        };
        Ok(Self {
            id: row.id,
            kind: row.kind,
            state: row.state,
            table_name: row.table_name,
            table_kind: row.table_kind,
            item_id: row.item_id,
            item,
            sequence: row.sequence,
            version: row.version,
            cancelled: false,
        })
    }
}

/// Persisted shape of a queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRow {
    pub id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub table_name: TableName,
    #[serde(default)]
    pub table_kind: TableKind,
    pub item_id: ItemId,
    /// Serialized document, present only when it must survive a restart
    pub item: Option<String>,
    pub sequence: Sequence,
    pub version: Version,
}

/// A remote failure recorded for one operation during a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOperationError {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub table_name: TableName,
    pub item_id: ItemId,
    /// Payload that was sent
    pub item: Option<Document>,
    /// Failure description
    pub message: String,
    /// Server copy, when the remote reported one
    pub server_item: Option<Document>,
}

impl TableOperationError {
    /// Record a failed remote call for `op`.
    pub fn new(op: &Operation, error: &Error) -> Self {
        let server_item = match error {
            Error::Remote(RemoteError::PreconditionFailed { server_item }) => server_item.clone(),
            _ => None,
        };
        Self {
            operation_id: op.id.clone(),
            kind: op.kind,
            table_name: op.table_name.clone(),
            item_id: op.item_id.clone(),
            item: op.item.clone(),
            message: error.to_string(),
            server_item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn op(kind: OperationKind) -> Operation {
        Operation::new(kind, "todo", TableKind::Table, "a", Some(doc(json!({"id": "a"}))))
    }

    #[test]
    fn insert_then_update_stays_insert() {
        let mut op = op(OperationKind::Insert);
        let updated = doc(json!({"id": "a", "text": "new"}));
        let outcome = op.collapse(OperationKind::Update, Some(updated.clone())).unwrap();

        assert_eq!(outcome, CollapseOutcome::Merged);
        assert_eq!(op.kind, OperationKind::Insert);
        assert_eq!(op.item, Some(updated));
        assert_eq!(op.version, 2);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut op = op(OperationKind::Insert);
        let outcome = op.collapse(OperationKind::Delete, None).unwrap();

        assert_eq!(outcome, CollapseOutcome::Cancelled);
        assert!(op.cancelled);
    }

    #[test]
    fn update_then_update_replaces_item() {
        let mut op = op(OperationKind::Update);
        let updated = doc(json!({"id": "a", "n": 2}));
        op.collapse(OperationKind::Update, Some(updated.clone())).unwrap();

        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.item, Some(updated));
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let mut op = op(OperationKind::Update);
        op.state = OperationState::Attempted;
        let snapshot = doc(json!({"id": "a", "n": 3}));
        op.collapse(OperationKind::Delete, Some(snapshot.clone()))
            .unwrap();

        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.item, Some(snapshot));
    }

    #[test]
    fn delete_rejects_everything() {
        for incoming in [
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            let mut op = op(OperationKind::Delete);
            let err = op.collapse(incoming, None).unwrap_err();
            assert!(matches!(
                err,
                Error::CollapseInvalid {
                    existing: OperationKind::Delete,
                    ..
                }
            ));
        }
    }

    #[test]
    fn insert_on_queued_item_rejected() {
        for existing in [OperationKind::Insert, OperationKind::Update] {
            let mut op = op(existing);
            assert!(op.collapse(OperationKind::Insert, None).is_err());
            assert_eq!(op.kind, existing);
            assert_eq!(op.version, 1);
        }
    }

    #[test]
    fn behavior_table_flags() {
        assert!(!OperationKind::Insert.behavior().serialize_item_to_queue);
        assert!(!OperationKind::Update.behavior().serialize_item_to_queue);
        assert!(OperationKind::Delete.behavior().serialize_item_to_queue);
        assert!(!OperationKind::Delete.behavior().can_write_result_to_store);
    }

    #[test]
    fn row_persists_item_only_for_delete() {
        let mut insert = op(OperationKind::Insert);
        insert.sequence = 4;
        let row = insert.to_row().unwrap();
        assert_eq!(row["kind"], json!("insert"));
        assert_eq!(row["tableName"], json!("todo"));
        assert_eq!(row["sequence"], json!(4));
        assert_eq!(row["item"], Value::Null);

        let restored = Operation::from_row(row).unwrap();
        assert_eq!(restored.id, insert.id);
        assert_eq!(restored.item, None);

        let delete = op(OperationKind::Delete);
        let restored = Operation::from_row(delete.to_row().unwrap()).unwrap();
        assert_eq!(restored.item, delete.item);
    }

    #[test]
    fn malformed_row_is_store_error() {
        let err = Operation::from_row(doc(json!({"id": "x", "kind": "explode"}))).unwrap_err();
        assert!(matches!(err, Error::LocalStore { .. }));
    }

    #[test]
    fn operation_error_captures_server_copy() {
        let op = op(OperationKind::Update);
        let server = doc(json!({"id": "a", "version": "9"}));
        let err = Error::Remote(RemoteError::PreconditionFailed {
            server_item: Some(server.clone()),
        });
        let recorded = TableOperationError::new(&op, &err);
        assert_eq!(recorded.server_item, Some(server));
        assert_eq!(recorded.kind, OperationKind::Update);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Folding any legal edit history into one queued operation
            /// leaves exactly the net change between the first and last state.
            #[test]
            fn prop_queue_holds_net_change(
                starts_present in any::<bool>(),
                writes in prop::collection::vec(any::<bool>(), 0..16),
            ) {
                let mut present = starts_present;
                let mut queued: Option<Operation> = None;
                let mut last_payload = None;
                let mut merges = 0u64;

                for (step, write) in writes.into_iter().enumerate() {
                    let kind = match (write, present) {
                        (true, false) => OperationKind::Insert,
                        (true, true) => OperationKind::Update,
                        (false, true) => OperationKind::Delete,
                        (false, false) => continue,
                    };
                    let payload = doc(json!({"id": "a", "step": step}));

                    let outcome = queued
                        .as_mut()
                        .map(|op| op.collapse(kind, Some(payload.clone())));
                    match outcome {
                        None => {
                            queued = Some(Operation::new(
                                kind,
                                "todo",
                                TableKind::Table,
                                "a",
                                Some(payload.clone()),
                            ));
                            merges = 0;
                        }
                        Some(Ok(CollapseOutcome::Merged)) => merges += 1,
                        Some(Ok(CollapseOutcome::Cancelled)) => queued = None,
                        Some(Err(_)) => {
                            // Only a queued delete refuses further edits
                            prop_assert_eq!(
                                queued.as_ref().map(|op| op.kind),
                                Some(OperationKind::Delete)
                            );
                            continue;
                        }
                    }
                    present = kind != OperationKind::Delete;
                    last_payload = Some(payload);
                }

                let expected = match (starts_present, present) {
                    (false, true) => Some(OperationKind::Insert),
                    (true, false) => Some(OperationKind::Delete),
                    (true, true) if queued.is_some() => Some(OperationKind::Update),
                    _ => None,
                };
                prop_assert_eq!(queued.as_ref().map(|op| op.kind), expected);

                if let Some(op) = &queued {
                    prop_assert_eq!(op.item.as_ref(), last_payload.as_ref());
                    prop_assert_eq!(op.version, 1 + merges);
                    prop_assert!(!op.cancelled);
                }
            }
        }
    }
}
