//! The durable operation queue.
//!
//! Every live [`Operation`] is a row in the [`OPERATION_QUEUE_TABLE`] of the
//! local store. The queue hands out sequence numbers, answers ordered peeks for
//! the push loop, and keeps a pending counter that mirrors the number of rows.
//!
//! Counters are atomics on the queue instance: `sequence_id` only ever moves
//! forward, `pending_operations` is adjusted by exactly the number of rows
//! written or removed. Both are rebuilt from the store by [`OperationQueue::load`].
//!
//! Store failures are wrapped as [`Error::LocalStore`] and returned; the queue
//! never retries on its own.

use crate::bulk::BulkOperation;
use crate::config::SyncConfig;
use crate::document::Document;
use crate::error::{Error, Result, StoreError};
use crate::lock::{AsyncLockMap, KeyedLockGuard, MultiLockGuard};
use crate::operation::{Operation, OperationState, TableKind};
use crate::store::{Direction, LocalStore, Predicate, Query};
use crate::{ItemId, OperationId, Sequence, TableName, Version};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Store table holding queued operations.
pub const OPERATION_QUEUE_TABLE: &str = "__operations";

pub(crate) fn store_error(context: impl Into<String>) -> impl FnOnce(StoreError) -> Error {
    let context = context.into();
    move |source| {
        tracing::error!(error = %source, "{context}");
        Error::local_store(context, source)
    }
}

fn base_query() -> Query {
    Query::new(OPERATION_QUEUE_TABLE)
}

fn operation_query(after: Sequence, table_kind: TableKind, tables: &[TableName]) -> Query {
    let kind = serde_json::to_value(table_kind).unwrap_or(Value::Null);
    let mut filter = Predicate::eq("tableKind", kind).and(Predicate::gt("sequence", after));
    if let Some(names) = Predicate::any_of("tableName", tables.iter().map(String::as_str)) {
        filter = filter.and(names);
    }
    base_query()
        .filter(filter)
        .order_by("sequence", Direction::Ascending)
}

fn item_lock_key(table: &str, item_id: &str) -> String {
    format!("{table}/{item_id}")
}

/// Ordered, durable log of pending operations.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    table_locks: AsyncLockMap,
    item_locks: AsyncLockMap,
    sequence_id: AtomicU64,
    pending_operations: AtomicU64,
    max_batch_size: usize,
    lookup_chunk_size: usize,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("sequence_id", &self.sequence_id())
            .field("pending_operations", &self.pending_operations())
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Create an empty queue over `store` without reading it.
    pub fn new(store: Arc<dyn LocalStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            table_locks: AsyncLockMap::new(),
            item_locks: AsyncLockMap::new(),
            sequence_id: AtomicU64::new(0),
            pending_operations: AtomicU64::new(0),
            max_batch_size: config.max_batch_size,
            lookup_chunk_size: config.lookup_chunk_size,
        }
    }

    /// Rebuild a queue from the rows already in `store`.
    ///
    /// Reads the highest sequence and the row count; an empty store yields a
    /// queue at sequence 0 with nothing pending.
    pub async fn load(store: Arc<dyn LocalStore>, config: &SyncConfig) -> Result<Self> {
        let queue = Self::new(store, config);

        let query = base_query()
            .order_by("sequence", Direction::Descending)
            .top(1)
            .include_total_count();
        let result = queue
            .store
            .query(&query)
            .await
            .map_err(store_error("failed to load the operation queue"))?;

        let sequence = result
            .values
            .first()
            .and_then(|row| row.get("sequence"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let pending = result.total_count.unwrap_or(0);

        queue.sequence_id.store(sequence, Ordering::SeqCst);
        queue.pending_operations.store(pending, Ordering::SeqCst);

        tracing::debug!(sequence, pending, "operation queue loaded");
        Ok(queue)
    }

    /// Last sequence number handed out.
    pub fn sequence_id(&self) -> Sequence {
        self.sequence_id.load(Ordering::SeqCst)
    }

    /// Number of live operations.
    pub fn pending_operations(&self) -> u64 {
        self.pending_operations.load(Ordering::SeqCst)
    }

    fn update_operation_count(&self, delta: i64) {
        let mut current = self.pending_operations.load(Ordering::SeqCst);
        loop {
            let updated = current.saturating_add_signed(delta);
            match self.pending_operations.compare_exchange_weak(
                current,
                updated,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Earliest live operation after `after` in the given tables.
    ///
    /// An empty table list means every table of `table_kind`.
    pub async fn peek_next(
        &self,
        after: Sequence,
        table_kind: TableKind,
        tables: &[TableName],
    ) -> Result<Option<Operation>> {
        let query = operation_query(after, table_kind, tables).top(1);
        let result = self
            .store
            .query(&query)
            .await
            .map_err(store_error("failed to peek the operation queue"))?;

        result.values.into_iter().next().map(Operation::from_row).transpose()
    }

    /// The longest run of consecutive operations after `after` that share
    /// table and kind, capped at the configured batch size.
    pub async fn peek_batch(
        &self,
        after: Sequence,
        table_kind: TableKind,
        tables: &[TableName],
    ) -> Result<Option<BulkOperation>> {
        let query = operation_query(after, table_kind, tables).top(self.max_batch_size);
        let result = self
            .store
            .query(&query)
            .await
            .map_err(store_error("failed to peek the operation queue"))?;

        let mut rows = result.values.into_iter().map(Operation::from_row);
        let first = match rows.next() {
            Some(first) => first?,
            None => return Ok(None),
        };

        let mut operations = vec![first];
        for op in rows {
            let op = op?;
            if op.table_name != operations[0].table_name || op.kind != operations[0].kind {
                break;
            }
            operations.push(op);
        }

        BulkOperation::from_operations(operations)
    }

    /// Every live operation for the given tables, in sequence order.
    pub async fn list(&self, table_kind: TableKind, tables: &[TableName]) -> Result<Vec<Operation>> {
        let query = operation_query(0, table_kind, tables);
        let result = self
            .store
            .query(&query)
            .await
            .map_err(store_error("failed to read the operation queue"))?;
        result.values.into_iter().map(Operation::from_row).collect()
    }

    /// Number of live operations targeting `table`.
    pub async fn count_pending(&self, table: &str) -> Result<u64> {
        let query = base_query().filter(Predicate::eq("tableName", table));
        self.store
            .count(&query)
            .await
            .map_err(store_error("failed to count pending operations"))
    }

    /// Serialize push, pull and purge on a table.
    pub async fn lock_table(&self, table: &str) -> KeyedLockGuard {
        self.table_locks.acquire(table).await
    }

    /// Serialize local mutations of an item against its dequeue.
    pub async fn lock_item(&self, table: &str, item_id: &str) -> KeyedLockGuard {
        self.item_locks.acquire(&item_lock_key(table, item_id)).await
    }

    /// Lock several items of one table, in lexical id order.
    pub async fn lock_items<S: AsRef<str>>(&self, table: &str, item_ids: &[S]) -> MultiLockGuard {
        let mut keys: Vec<String> = item_ids
            .iter()
            .map(|id| item_lock_key(table, id.as_ref()))
            .collect();
        keys.sort();
        keys.dedup();
        self.item_locks.acquire_many(keys).await
    }

    /// The live operation on an item, if any.
    pub async fn find_by_item(&self, table: &str, item_id: &str) -> Result<Option<Operation>> {
        let query = base_query()
            .filter(Predicate::eq("tableName", table).and(Predicate::eq("itemId", item_id)))
            .top(1);
        let result = self
            .store
            .query(&query)
            .await
            .map_err(store_error("failed to look up operation by item"))?;
        result.values.into_iter().next().map(Operation::from_row).transpose()
    }

    /// Live operations on any of `item_ids`, in sequence order.
    ///
    /// Ids are looked up in chunks so a single store query stays small.
    pub async fn find_by_items<S: AsRef<str>>(
        &self,
        table: &str,
        item_ids: &[S],
    ) -> Result<Vec<Operation>> {
        let mut operations = Vec::new();
        for chunk in item_ids.chunks(self.lookup_chunk_size) {
            let Some(ids) = Predicate::any_of("itemId", chunk.iter().map(|id| id.as_ref())) else {
                continue;
            };
            let query = base_query()
                .filter(Predicate::eq("tableName", table).and(ids))
                .order_by("sequence", Direction::Ascending);
            let result = self
                .store
                .query(&query)
                .await
                .map_err(store_error("failed to look up operations by item"))?;
            for row in result.values {
                operations.push(Operation::from_row(row)?);
            }
        }
        operations.sort_by_key(|op| op.sequence);
        Ok(operations)
    }

    /// Get an operation by its id.
    pub async fn get(&self, id: &str) -> Result<Option<Operation>> {
        self.store
            .lookup(OPERATION_QUEUE_TABLE, id)
            .await
            .map_err(store_error("failed to read operation"))?
            .map(Operation::from_row)
            .transpose()
    }

    /// Get the operations that still exist among `ids`.
    pub async fn get_many(&self, ids: &[OperationId]) -> Result<Vec<Operation>> {
        self.store
            .lookup_many(OPERATION_QUEUE_TABLE, ids)
            .await
            .map_err(store_error("failed to read operations"))?
            .into_iter()
            .map(Operation::from_row)
            .collect()
    }

    /// Assign the next sequence number to `op` and persist it.
    ///
    /// Collapsing must already have been resolved by the caller.
    pub async fn enqueue(&self, op: &mut Operation) -> Result<()> {
        if op.cancelled {
            return Err(Error::InvalidOperation(
                "a cancelled operation cannot be queued".into(),
            ));
        }
        op.sequence = self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = op.to_row()?;
        self.store
            .upsert(OPERATION_QUEUE_TABLE, vec![row], false)
            .await
            .map_err(store_error("failed to enqueue operation"))?;
        self.update_operation_count(1);

        tracing::debug!(
            op_id = %op.id,
            kind = %op.kind,
            table = %op.table_name,
            item_id = %op.item_id,
            sequence = op.sequence,
            "operation enqueued"
        );
        Ok(())
    }

    /// Persist the live operations of `bulk` over one contiguous sequence range.
    pub async fn enqueue_bulk(&self, bulk: &mut BulkOperation) -> Result<()> {
        let count = bulk.item_count() as u64;
        if count == 0 {
            return Ok(());
        }
        let start = self.sequence_id.fetch_add(count, Ordering::SeqCst) + 1;
        bulk.set_sequence(start);
        let rows = bulk.to_rows()?;
        self.store
            .upsert(OPERATION_QUEUE_TABLE, rows, false)
            .await
            .map_err(store_error("failed to enqueue bulk operation"))?;
        self.update_operation_count(count as i64);

        tracing::debug!(
            kind = %bulk.kind,
            table = %bulk.table_name,
            count,
            first_sequence = start,
            "bulk operation enqueued"
        );
        Ok(())
    }

    /// Remove a completed operation if it was not rewritten meanwhile.
    ///
    /// Returns `false`, keeping the row, when the stored version differs from
    /// `version` or the operation is already gone.
    pub async fn delete_completed(&self, id: &str, version: Version) -> Result<bool> {
        let Some(current) = self.get(id).await? else {
            return Ok(false);
        };
        if current.version != version {
            tracing::debug!(
                op_id = %id,
                expected = version,
                actual = current.version,
                "operation changed since dequeue; keeping it"
            );
            return Ok(false);
        }

        self.store
            .delete(OPERATION_QUEUE_TABLE, &[id.to_string()])
            .await
            .map_err(store_error("failed to delete operation from the local store"))?;
        self.update_operation_count(-1);
        tracing::debug!(op_id = %id, "operation completed");
        Ok(true)
    }

    /// Remove several completed operations, all or nothing.
    ///
    /// Returns `false` and removes nothing if any operation is missing or was
    /// rewritten since dequeue.
    pub async fn delete_completed_many(&self, expected: &[(OperationId, Version)]) -> Result<bool> {
        if expected.is_empty() {
            return Ok(true);
        }
        let ids: Vec<OperationId> = expected.iter().map(|(id, _)| id.clone()).collect();
        let current = self.get_many(&ids).await?;

        let unchanged = current.len() == expected.len()
            && current.iter().all(|op| {
                expected
                    .iter()
                    .any(|(id, version)| *id == op.id && *version == op.version)
            });
        if !unchanged {
            tracing::debug!(count = expected.len(), "batch changed since dequeue; keeping it");
            return Ok(false);
        }

        self.store
            .delete(OPERATION_QUEUE_TABLE, &ids)
            .await
            .map_err(store_error("failed to delete operations from the local store"))?;
        self.update_operation_count(-(current.len() as i64));
        tracing::debug!(count = current.len(), "operations completed");
        Ok(true)
    }

    /// Persist a changed operation as is (state, kind, payload).
    pub async fn update(&self, op: &Operation) -> Result<()> {
        let row = op.to_row()?;
        self.store
            .upsert(OPERATION_QUEUE_TABLE, vec![row], false)
            .await
            .map_err(store_error("failed to update operation in the local store"))
    }

    /// Persist several changed operations.
    pub async fn update_many<'a>(&self, ops: impl IntoIterator<Item = &'a Operation>) -> Result<()> {
        let rows = ops
            .into_iter()
            .map(Operation::to_row)
            .collect::<Result<Vec<Document>>>()?;
        if rows.is_empty() {
            return Ok(());
        }
        self.store
            .upsert(OPERATION_QUEUE_TABLE, rows, false)
            .await
            .map_err(store_error("failed to update operations in the local store"))
    }

    /// Rewrite a queued operation for retry.
    ///
    /// Resets the state to pending and bumps the version so that a completion
    /// based on the old version is refused.
    pub async fn update_in_place(&self, op: &mut Operation) -> Result<()> {
        op.state = OperationState::Pending;
        op.version += 1;
        self.update(op).await
    }

    /// Drop the live operations of `table` on the given items.
    ///
    /// Callers hold the item locks, so the rows deleted are exactly the rows
    /// counted. Operations on other items are left alone. Returns how many
    /// were removed.
    pub async fn remove_items<S: AsRef<str>>(&self, table: &str, item_ids: &[S]) -> Result<u64> {
        let ids: Vec<OperationId> = self
            .find_by_items(table, item_ids)
            .await?
            .into_iter()
            .map(|op| op.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.store
            .delete(OPERATION_QUEUE_TABLE, &ids)
            .await
            .map_err(store_error("failed to delete table operations"))?;
        let count = ids.len() as u64;
        self.update_operation_count(-(count as i64));
        tracing::debug!(table, count, "table operations removed");
        Ok(count)
    }

    /// Remove a cancelled operation without version checks.
    pub(crate) async fn discard(&self, op: &Operation) -> Result<()> {
        self.store
            .delete(OPERATION_QUEUE_TABLE, &[op.id.clone()])
            .await
            .map_err(store_error("failed to delete cancelled operation"))?;
        self.update_operation_count(-1);
        tracing::debug!(op_id = %op.id, item_id = %op.item_id, "operation cancelled");
        Ok(())
    }
}

/// Ids and versions of a set of operations, as read at dequeue time.
pub fn versions<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Vec<(OperationId, Version)> {
    ops.into_iter().map(|op| (op.id.clone(), op.version)).collect()
}

/// Item ids of a set of operations.
pub fn item_ids<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Vec<ItemId> {
    ops.into_iter().map(|op| op.item_id.clone()).collect()
}
