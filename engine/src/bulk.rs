//! Bulk operations.
//!
//! A [`BulkOperation`] groups queued operations that share kind, table and
//! table kind over a contiguous sequence range, so they can be sent in one
//! remote call. Batching is only an optimization: every per-item rule holds
//! whether or not operations are grouped.

use crate::document::{self, Document};
use crate::error::{Error, Result};
use crate::operation::{Operation, OperationKind, TableKind};
use crate::remote::{self, RemoteError, RemoteTable};
use crate::{ItemId, Sequence, TableName};

/// Operations of one kind against one table, submitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub kind: OperationKind,
    pub table_name: TableName,
    pub table_kind: TableKind,
    pub operations: Vec<Operation>,
}

impl BulkOperation {
    /// Build a bulk operation with one fresh operation per item.
    pub fn new(
        kind: OperationKind,
        table_name: impl Into<TableName>,
        table_kind: TableKind,
        items: Vec<Document>,
    ) -> Result<Self> {
        let table_name = table_name.into();
        let operations = items
            .into_iter()
            .map(|item| {
                let id = document::document_id(&item)
                    .ok_or_else(|| Error::InvalidOperation("item is missing a string id".into()))?
                    .to_string();
                Ok(Operation::new(
                    kind,
                    table_name.clone(),
                    table_kind,
                    id,
                    Some(item),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind,
            table_name,
            table_kind,
            operations,
        })
    }

    /// Group existing operations, checking they share kind and table.
    ///
    /// Returns `None` for an empty list.
    pub fn from_operations(operations: Vec<Operation>) -> Result<Option<Self>> {
        let Some(first) = operations.first() else {
            return Ok(None);
        };
        let (kind, table_name, table_kind) =
            (first.kind, first.table_name.clone(), first.table_kind);

        if operations
            .iter()
            .any(|op| op.kind != kind || op.table_name != table_name || op.table_kind != table_kind)
        {
            return Err(Error::InvalidBulkOperation(
                "all operations must have the same kind, table name and table kind".into(),
            ));
        }

        Ok(Some(Self {
            kind,
            table_name,
            table_kind,
            operations,
        }))
    }

    /// Operations not cancelled by collapsing.
    pub fn live(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| !op.cancelled)
    }

    /// Number of live operations.
    pub fn item_count(&self) -> usize {
        self.live().count()
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.live().map(|op| op.item_id.clone()).collect()
    }

    /// First and last sequence of the live operations.
    pub fn sequence_range(&self) -> Option<(Sequence, Sequence)> {
        let first = self.live().map(|op| op.sequence).min()?;
        let last = self.live().map(|op| op.sequence).max()?;
        Some((first, last))
    }

    pub(crate) fn set_sequence(&mut self, start: Sequence) {
        let mut next = start;
        for op in self.operations.iter_mut().filter(|op| !op.cancelled) {
            op.sequence = next;
            next += 1;
        }
    }

    /// Queue rows for the live operations.
    pub fn to_rows(&self) -> Result<Vec<Document>> {
        self.live().map(Operation::to_row).collect()
    }

    /// Payloads of the live operations.
    ///
    /// Fails if any operation has no payload.
    pub fn items(&self) -> Result<Vec<Document>> {
        self.live()
            .map(|op| {
                op.item.clone().ok_or_else(|| {
                    Error::InvalidOperation("operation must have an item associated with it".into())
                })
            })
            .collect()
    }

    /// Replace payloads by id, leaving operations without a match untouched.
    pub fn update_items(&mut self, items: Vec<Document>) {
        for item in items {
            let Some(id) = document::document_id(&item).map(str::to_string) else {
                continue;
            };
            if let Some(op) = self
                .operations
                .iter_mut()
                .find(|op| !op.cancelled && op.item_id == id)
            {
                op.item = Some(item);
            }
        }
    }

    /// A bulk operation over the live operations whose item id is in `ids`.
    pub fn subset(&self, ids: &[ItemId]) -> Self {
        Self {
            kind: self.kind,
            table_name: self.table_name.clone(),
            table_kind: self.table_kind,
            operations: self
                .live()
                .filter(|op| ids.contains(&op.item_id))
                .cloned()
                .collect(),
        }
    }

    /// Send every live payload to the remote table in one call.
    ///
    /// Returns the server copies for inserts and updates and nothing for deletes.
    /// A response that leaves out some rows is a [`RemoteError::PartialFailure`]
    /// carrying the rows it did return.
    pub async fn execute_remote(&self, remote: &dyn RemoteTable) -> Result<Vec<Document>> {
        let items = self.items()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let response =
            (self.kind.behavior().remote_apply_all)(remote, &self.table_name, &items).await?;

        if self.kind == OperationKind::Delete {
            return Ok(Vec::new());
        }

        let results = document::valid_items_or_none(response).ok_or_else(|| {
            Error::InvalidOperation("remote table returned an unexpected response".into())
        })?;

        let missing: Vec<&str> = self
            .live()
            .map(|op| op.item_id.as_str())
            .filter(|id| remote::find_by_id(&results, id).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(results);
        }
        let fault = RemoteError::InvalidOperation(format!(
            "remote response left out {} item(s): {}",
            missing.len(),
            missing.join(", ")
        ));
        Err(fault.after_accepting(results).into())
    }
}
