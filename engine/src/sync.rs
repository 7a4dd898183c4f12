//! Sync orchestration.
//!
//! [`SyncContext`] is the application-facing surface. Local mutations are
//! applied to the local store and recorded in the operation queue, collapsing
//! into an already queued operation for the same item. [`SyncContext::push`]
//! drains the queue against the remote in sequence order, and
//! [`SyncContext::pull`] brings remote rows into the local store.
//!
//! Lock order is always table lock, then item locks sorted by key. Local
//! mutations only take item locks.

use crate::bulk::BulkOperation;
use crate::config::SyncConfig;
use crate::conflict::{self, ConflictPolicy};
use crate::document::{self, Document};
use crate::error::{Error, PushStatus, Result};
use crate::operation::{
    CollapseOutcome, Operation, OperationKind, OperationState, TableKind, TableOperationError,
};
use crate::queue::{self, store_error, OperationQueue};
use crate::remote::{self, RemoteError, RemoteTable};
use crate::store::{LocalStore, Query, QueryResult};
use crate::{ItemId, OperationId, TableName};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Result of handing an operation to a [`SyncHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome<T> {
    /// The remote accepted the operation; carries the server's response.
    Completed(T),
    /// Stop the push here. This operation and every later one stay queued.
    Aborted,
}

/// Sends operations to the remote, resolving conflicts when a policy is set.
pub struct RemoteExecutor<'a> {
    remote: &'a dyn RemoteTable,
    policy: Option<&'a dyn ConflictPolicy>,
    max_rounds: Option<u32>,
}

impl<'a> RemoteExecutor<'a> {
    /// The remote table operations are sent to.
    pub fn remote(&self) -> &'a dyn RemoteTable {
        self.remote
    }

    /// Execute one operation.
    pub async fn execute(&self, op: &mut Operation) -> Result<Option<Document>> {
        match self.policy {
            Some(policy) => conflict::resolve(op, self.remote, policy, self.max_rounds).await,
            None => op.execute_remote(self.remote).await,
        }
    }

    /// Execute a bulk operation.
    pub async fn execute_bulk(&self, bulk: &mut BulkOperation) -> Result<Vec<Document>> {
        match self.policy {
            Some(policy) => conflict::resolve_bulk(bulk, self.remote, policy, self.max_rounds).await,
            None => bulk.execute_remote(self.remote).await,
        }
    }
}

/// Interception hooks around remote execution during a push.
///
/// The default implementation executes every operation unchanged.
///
/// With [`SyncConfig::bulk_push`] on, which is the default, a unit of more
/// than one operation goes only to [`execute_bulk_operation`]; the default
/// there does not call [`execute_table_operation`] per operation. A handler
/// that intercepts single operations must override both, or turn bulk push
/// off.
///
/// Returning [`ExecuteOutcome::Completed`] from the bulk hook completes every
/// operation of the batch. Report a partly applied batch as
/// [`RemoteError::BulkConflict`] or [`RemoteError::PartialFailure`] instead.
///
/// [`execute_bulk_operation`]: SyncHandler::execute_bulk_operation
/// [`execute_table_operation`]: SyncHandler::execute_table_operation
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Execute one operation.
    async fn execute_table_operation(
        &self,
        op: &mut Operation,
        executor: &RemoteExecutor<'_>,
    ) -> Result<ExecuteOutcome<Option<Document>>> {
        executor.execute(op).await.map(ExecuteOutcome::Completed)
    }

    /// Execute a batch of same-kind operations on one table.
    ///
    /// Does not go through [`SyncHandler::execute_table_operation`].
    async fn execute_bulk_operation(
        &self,
        bulk: &mut BulkOperation,
        executor: &RemoteExecutor<'_>,
    ) -> Result<ExecuteOutcome<Vec<Document>>> {
        executor.execute_bulk(bulk).await.map(ExecuteOutcome::Completed)
    }

    /// Called once at the end of every push, successful or not.
    async fn on_push_complete(&self, _result: &PushCompletionResult) {}
}

/// [`SyncHandler`] that executes everything as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSyncHandler;

impl SyncHandler for DefaultSyncHandler {}

/// What a push did, reported to [`SyncHandler::on_push_complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct PushCompletionResult {
    /// `None` when the queue drained cleanly
    pub status: Option<PushStatus>,
    /// Operations removed from the queue
    pub pushed: usize,
    pub errors: Vec<TableOperationError>,
}

/// A push that drained cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSummary {
    pub pushed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Abort,
}

#[derive(Debug, Default)]
struct DrainState {
    pushed: usize,
    errors: Vec<TableOperationError>,
}

fn require_id(item: &Document) -> Result<ItemId> {
    document::document_id(item)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidOperation("item is missing a string id".into()))
}

fn ensure_id(item: &mut Document) -> Result<()> {
    match item.get(document::ID) {
        None | Some(serde_json::Value::Null) => {
            item.insert(
                document::ID.to_string(),
                uuid::Uuid::new_v4().to_string().into(),
            );
            Ok(())
        }
        Some(serde_json::Value::String(_)) => Ok(()),
        Some(_) => Err(Error::InvalidOperation("item id must be a string".into())),
    }
}

/// Offline sync session over one local store and one remote.
pub struct SyncContext {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteTable>,
    handler: Arc<dyn SyncHandler>,
    policy: Option<Arc<dyn ConflictPolicy>>,
    config: SyncConfig,
    queue: OnceCell<OperationQueue>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("queue", &self.queue.get())
            .field("has_conflict_policy", &self.policy.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    /// Create a context with the default handler and configuration.
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteTable>) -> Self {
        Self {
            store,
            remote,
            handler: Arc::new(DefaultSyncHandler),
            policy: None,
            config: SyncConfig::default(),
            queue: OnceCell::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Resolve version conflicts during push with `policy`.
    pub fn with_conflict_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load the operation queue from the local store.
    ///
    /// Calling it again after success is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        self.config.validate()?;
        let queue = self
            .queue
            .get_or_try_init(|| OperationQueue::load(self.store.clone(), &self.config))
            .await?;
        tracing::info!(
            pending = queue.pending_operations(),
            sequence = queue.sequence_id(),
            "sync context initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.queue.initialized()
    }

    fn queue(&self) -> Result<&OperationQueue> {
        self.queue.get().ok_or(Error::NotInitialized)
    }

    /// Number of operations waiting to be pushed.
    pub fn pending_operations(&self) -> Result<u64> {
        Ok(self.queue()?.pending_operations())
    }

    /// Queued operations for `table` in push order.
    pub async fn queued_operations(&self, table: &str) -> Result<Vec<Operation>> {
        self.queue()?
            .list(TableKind::Table, &[table.to_string()])
            .await
    }

    /// Read one item from the local store.
    pub async fn lookup(&self, table: &str, id: &str) -> Result<Option<Document>> {
        self.queue()?;
        self.store
            .lookup(table, id)
            .await
            .map_err(store_error(format!("failed to look up '{id}' in '{table}'")))
    }

    /// Query the local store.
    pub async fn read(&self, query: &Query) -> Result<QueryResult> {
        self.queue()?;
        self.store
            .query(query)
            .await
            .map_err(store_error(format!("failed to query '{}'", query.table)))
    }

    /// Insert an item locally and queue it for push.
    ///
    /// An item without an id gets a fresh uuid. Returns the stored item.
    pub async fn insert(&self, table: &str, mut item: Document) -> Result<Document> {
        ensure_id(&mut item)?;
        self.mutate(OperationKind::Insert, table, item.clone()).await?;
        Ok(item)
    }

    /// Update an item locally and queue it for push.
    pub async fn update(&self, table: &str, item: Document) -> Result<()> {
        self.mutate(OperationKind::Update, table, item).await
    }

    /// Delete an item locally and queue the deletion for push.
    pub async fn delete(&self, table: &str, item: Document) -> Result<()> {
        self.mutate(OperationKind::Delete, table, item).await
    }

    /// Insert several items; see [`SyncContext::insert`].
    pub async fn insert_all(&self, table: &str, mut items: Vec<Document>) -> Result<Vec<Document>> {
        for item in items.iter_mut() {
            ensure_id(item)?;
        }
        self.mutate_all(OperationKind::Insert, table, items.clone()).await?;
        Ok(items)
    }

    pub async fn update_all(&self, table: &str, items: Vec<Document>) -> Result<()> {
        self.mutate_all(OperationKind::Update, table, items).await
    }

    pub async fn delete_all(&self, table: &str, items: Vec<Document>) -> Result<()> {
        self.mutate_all(OperationKind::Delete, table, items).await
    }

    async fn mutate(&self, kind: OperationKind, table: &str, item: Document) -> Result<()> {
        let queue = self.queue()?;
        let item_id = require_id(&item)?;

        let _lock = queue.lock_item(table, &item_id).await;
        let existing = queue.find_by_item(table, &item_id).await?;

        let payload = if kind == OperationKind::Delete {
            match self.local_row(table, &item_id).await? {
                Some(snapshot) => snapshot,
                None if existing.is_some() => item.clone(),
                None => {
                    return Err(Error::ItemNotFound {
                        table: table.to_string(),
                        item_id,
                    })
                }
            }
        } else {
            item.clone()
        };

        let collapsed = match existing {
            Some(mut op) => {
                let outcome = op.collapse(kind, Some(payload.clone()))?;
                Some((op, outcome))
            }
            None => None,
        };

        (kind.behavior().local_apply)(self.store.as_ref(), table, std::slice::from_ref(&item))
            .await?;

        match collapsed {
            None => {
                let mut op = Operation::new(kind, table, TableKind::Table, item_id, Some(payload));
                queue.enqueue(&mut op).await
            }
            Some((op, CollapseOutcome::Merged)) => {
                tracing::debug!(op_id = %op.id, kind = %op.kind, item_id = %op.item_id, "operation collapsed");
                queue.update(&op).await
            }
            Some((op, CollapseOutcome::Cancelled)) => queue.discard(&op).await,
        }
    }

    async fn mutate_all(&self, kind: OperationKind, table: &str, items: Vec<Document>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let queue = self.queue()?;
        let ids = items.iter().map(require_id).collect::<Result<Vec<_>>>()?;
        if ids.iter().collect::<HashSet<_>>().len() != ids.len() {
            return Err(Error::InvalidBulkOperation(
                "the same item appears more than once".into(),
            ));
        }

        let _locks = queue.lock_items(table, &ids).await;
        let mut existing: HashMap<ItemId, Operation> = queue
            .find_by_items(table, &ids)
            .await?
            .into_iter()
            .map(|op| (op.item_id.clone(), op))
            .collect();

        let payloads = if kind == OperationKind::Delete {
            let mut snapshots: HashMap<ItemId, Document> = self
                .store
                .lookup_many(table, &ids)
                .await
                .map_err(store_error(format!("failed to look up items in '{table}'")))?
                .into_iter()
                .filter_map(|row| Some((document::document_id(&row)?.to_string(), row)))
                .collect();
            ids.iter()
                .zip(&items)
                .map(|(id, item)| match snapshots.remove(id) {
                    Some(snapshot) => Ok(snapshot),
                    None if existing.contains_key(id) => Ok(item.clone()),
                    None => Err(Error::ItemNotFound {
                        table: table.to_string(),
                        item_id: id.clone(),
                    }),
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            items.clone()
        };

        let mut merged = Vec::new();
        let mut cancelled = Vec::new();
        let mut fresh = Vec::new();
        for (id, payload) in ids.iter().zip(payloads) {
            match existing.remove(id) {
                Some(mut op) => match op.collapse(kind, Some(payload))? {
                    CollapseOutcome::Merged => merged.push(op),
                    CollapseOutcome::Cancelled => cancelled.push(op),
                },
                None => fresh.push(payload),
            }
        }

        (kind.behavior().local_apply)(self.store.as_ref(), table, &items).await?;

        queue.update_many(&merged).await?;
        for op in &cancelled {
            queue.discard(op).await?;
        }
        if !fresh.is_empty() {
            let mut bulk = BulkOperation::new(kind, table, TableKind::Table, fresh)?;
            queue.enqueue_bulk(&mut bulk).await?;
        }

        tracing::debug!(
            table,
            kind = %kind,
            collapsed = merged.len(),
            cancelled = cancelled.len(),
            "bulk mutation recorded"
        );
        Ok(())
    }

    async fn local_row(&self, table: &str, id: &str) -> Result<Option<Document>> {
        self.store
            .lookup(table, id)
            .await
            .map_err(store_error(format!("failed to look up '{id}' in '{table}'")))
    }

    fn executor(&self) -> RemoteExecutor<'_> {
        RemoteExecutor {
            remote: self.remote.as_ref(),
            policy: self.policy.as_deref(),
            max_rounds: self.config.max_conflict_rounds,
        }
    }

    /// Send queued operations for `tables` to the remote, oldest first.
    ///
    /// An empty list pushes every table. Dropping the returned future stops
    /// the push between operations; anything not yet completed stays queued.
    pub async fn push<S: AsRef<str>>(&self, tables: &[S]) -> Result<PushSummary> {
        let tables: Vec<TableName> = tables.iter().map(|t| t.as_ref().to_string()).collect();
        self.push_tables(&tables, None).await
    }

    async fn push_tables(
        &self,
        tables: &[TableName],
        locked_table: Option<&str>,
    ) -> Result<PushSummary> {
        let queue = self.queue()?;
        let mut state = DrainState::default();

        let status = match self.drain(queue, tables, locked_table, &mut state).await {
            Ok(Flow::Continue) if state.errors.is_empty() => None,
            Ok(Flow::Continue) => Some(PushStatus::CompleteWithErrors),
            Ok(Flow::Abort) => Some(PushStatus::CancelledByOperation),
            Err(e) => {
                tracing::error!(error = %e, "push stopped by a local store failure");
                Some(PushStatus::InternalError)
            }
        };

        let completion = PushCompletionResult {
            status,
            pushed: state.pushed,
            errors: state.errors,
        };
        self.handler.on_push_complete(&completion).await;

        let Some(status) = completion.status else {
            tracing::info!(pushed = completion.pushed, "push completed");
            return Ok(PushSummary {
                pushed: completion.pushed,
            });
        };

        let incomplete: Vec<OperationId> = match queue.list(TableKind::Table, tables).await {
            Ok(ops) => ops.into_iter().map(|op| op.id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list incomplete operations");
                Vec::new()
            }
        };
        tracing::info!(
            %status,
            pushed = completion.pushed,
            errors = completion.errors.len(),
            incomplete = incomplete.len(),
            "push failed"
        );
        Err(Error::PushFailed {
            status,
            errors: completion.errors,
            incomplete,
        })
    }

    async fn drain(
        &self,
        queue: &OperationQueue,
        tables: &[TableName],
        locked_table: Option<&str>,
        state: &mut DrainState,
    ) -> Result<Flow> {
        let mut after = 0;
        loop {
            let unit = if self.config.bulk_push {
                match queue.peek_batch(after, TableKind::Table, tables).await? {
                    Some(bulk) => bulk.operations,
                    None => return Ok(Flow::Continue),
                }
            } else {
                match queue.peek_next(after, TableKind::Table, tables).await? {
                    Some(op) => vec![op],
                    None => return Ok(Flow::Continue),
                }
            };
            let Some(last) = unit.last() else {
                return Ok(Flow::Continue);
            };
            after = last.sequence;
            let table = last.table_name.clone();

            let _table_lock = match locked_table {
                Some(locked) if locked == table => None,
                _ => Some(queue.lock_table(&table).await),
            };
            let _item_locks = queue.lock_items(&table, &queue::item_ids(&unit)).await;

            // Re-read under the locks; collapsing may have changed or removed them
            let op_ids: Vec<OperationId> = unit.iter().map(|op| op.id.clone()).collect();
            let mut current = queue.get_many(&op_ids).await?;
            current.sort_by_key(|op| op.sequence);

            let same_kind = current.windows(2).all(|w| w[0].kind == w[1].kind);
            let flow = if current.len() > 1 && same_kind {
                match BulkOperation::from_operations(current)? {
                    Some(bulk) => self.push_bulk(queue, bulk, state).await?,
                    None => Flow::Continue,
                }
            } else {
                let mut flow = Flow::Continue;
                for op in current {
                    flow = self.push_single(queue, op, state).await?;
                    if flow == Flow::Abort {
                        break;
                    }
                }
                flow
            };

            if flow == Flow::Abort {
                return Ok(Flow::Abort);
            }
        }
    }

    async fn push_single(
        &self,
        queue: &OperationQueue,
        mut op: Operation,
        state: &mut DrainState,
    ) -> Result<Flow> {
        if op.kind != OperationKind::Delete {
            op.item = self.local_row(&op.table_name, &op.item_id).await?;
        }
        op.state = OperationState::Attempted;
        queue.update(&op).await?;

        let sent = op.item.clone();
        let executor = self.executor();
        match self.handler.execute_table_operation(&mut op, &executor).await {
            Ok(ExecuteOutcome::Completed(result)) => {
                if let Some(result) = result.filter(|_| op.behavior().can_write_result_to_store) {
                    self.write_results(&op.table_name, vec![result]).await?;
                }
                if queue.delete_completed(&op.id, op.version).await? {
                    state.pushed += 1;
                }
                Ok(Flow::Continue)
            }
            Ok(ExecuteOutcome::Aborted) => {
                tracing::info!(op_id = %op.id, item_id = %op.item_id, "push aborted by handler");
                op.item = sent;
                op.state = OperationState::Pending;
                queue.update(&op).await?;
                Ok(Flow::Abort)
            }
            Err(e @ Error::LocalStore { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(
                    op_id = %op.id,
                    table = %op.table_name,
                    item_id = %op.item_id,
                    error = %e,
                    "operation failed"
                );
                if op.item != sent {
                    self.persist_merge(queue, &mut op).await?;
                }
                state.errors.push(TableOperationError::new(&op, &e));
                Ok(Flow::Continue)
            }
        }
    }

    async fn push_bulk(
        &self,
        queue: &OperationQueue,
        mut bulk: BulkOperation,
        state: &mut DrainState,
    ) -> Result<Flow> {
        if bulk.kind != OperationKind::Delete {
            let ids = bulk.item_ids();
            let mut rows: HashMap<ItemId, Document> = self
                .store
                .lookup_many(&bulk.table_name, &ids)
                .await
                .map_err(store_error(format!(
                    "failed to read items from '{}'",
                    bulk.table_name
                )))?
                .into_iter()
                .filter_map(|row| Some((document::document_id(&row)?.to_string(), row)))
                .collect();
            for op in bulk.operations.iter_mut() {
                op.item = rows.remove(&op.item_id);
            }
        }
        for op in bulk.operations.iter_mut() {
            op.state = OperationState::Attempted;
        }
        queue.update_many(&bulk.operations).await?;

        let sent: Vec<Option<Document>> =
            bulk.operations.iter().map(|op| op.item.clone()).collect();
        let executor = self.executor();
        match self.handler.execute_bulk_operation(&mut bulk, &executor).await {
            Ok(ExecuteOutcome::Completed(results)) => {
                self.complete(queue, &bulk.operations, results, state).await?;
                Ok(Flow::Continue)
            }
            Ok(ExecuteOutcome::Aborted) => {
                tracing::info!(
                    table = %bulk.table_name,
                    count = bulk.operations.len(),
                    "push aborted by handler"
                );
                for (op, item) in bulk.operations.iter_mut().zip(sent) {
                    op.item = item;
                    op.state = OperationState::Pending;
                }
                queue.update_many(&bulk.operations).await?;
                Ok(Flow::Abort)
            }
            Err(e @ Error::LocalStore { .. }) => Err(e),
            Err(Error::Remote(RemoteError::BulkConflict {
                accepted,
                server_items,
            })) => {
                let failed = self
                    .complete_accepted(queue, bulk.operations, sent, accepted, state)
                    .await?;
                for (mut op, sent) in failed {
                    let error = match remote::find_by_id(&server_items, &op.item_id) {
                        Some(server) => Error::Remote(RemoteError::PreconditionFailed {
                            server_item: Some(server.clone()),
                        }),
                        None => Error::InvalidOperation(
                            "item was not accepted as part of a conflicting batch".into(),
                        ),
                    };
                    self.record_failure(queue, &mut op, sent, &error, state).await?;
                }
                Ok(Flow::Continue)
            }
            Err(Error::Remote(RemoteError::PartialFailure { accepted, source })) => {
                let failed = self
                    .complete_accepted(queue, bulk.operations, sent, accepted, state)
                    .await?;
                let error = Error::Remote(*source);
                for (mut op, sent) in failed {
                    self.record_failure(queue, &mut op, sent, &error, state).await?;
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::warn!(
                    table = %bulk.table_name,
                    count = bulk.operations.len(),
                    error = %e,
                    "bulk operation failed"
                );
                for (mut op, sent) in bulk.operations.into_iter().zip(sent) {
                    self.record_failure(queue, &mut op, sent, &e, state).await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Complete the operations whose item the remote accepted and hand back
    /// the rest with the payload each was sent with.
    async fn complete_accepted(
        &self,
        queue: &OperationQueue,
        operations: Vec<Operation>,
        sent: Vec<Option<Document>>,
        accepted: Vec<Document>,
        state: &mut DrainState,
    ) -> Result<Vec<(Operation, Option<Document>)>> {
        let (done, failed): (Vec<_>, Vec<_>) = {
            let accepted_ids: HashSet<&str> =
                accepted.iter().filter_map(document::document_id).collect();
            operations
                .into_iter()
                .zip(sent)
                .partition(|(op, _)| accepted_ids.contains(op.item_id.as_str()))
        };
        let done: Vec<Operation> = done.into_iter().map(|(op, _)| op).collect();
        if let Some(op) = done.first().or(failed.first().map(|(op, _)| op)) {
            tracing::warn!(
                table = %op.table_name,
                accepted = done.len(),
                failed = failed.len(),
                "bulk operation partly applied"
            );
        }
        self.complete(queue, &done, accepted, state).await?;
        Ok(failed)
    }

    /// Keep a failed operation queued, with its merged payload if any.
    async fn record_failure(
        &self,
        queue: &OperationQueue,
        op: &mut Operation,
        sent: Option<Document>,
        error: &Error,
        state: &mut DrainState,
    ) -> Result<()> {
        if op.item != sent {
            self.persist_merge(queue, op).await?;
        }
        state.errors.push(TableOperationError::new(op, error));
        Ok(())
    }

    /// Record remote results for completed operations and drop them from the queue.
    async fn complete(
        &self,
        queue: &OperationQueue,
        ops: &[Operation],
        results: Vec<Document>,
        state: &mut DrainState,
    ) -> Result<()> {
        let Some(first) = ops.first() else {
            return Ok(());
        };
        if first.behavior().can_write_result_to_store && !results.is_empty() {
            self.write_results(&first.table_name, results).await?;
        }

        if queue.delete_completed_many(&queue::versions(ops)).await? {
            state.pushed += ops.len();
            return Ok(());
        }
        for op in ops {
            if queue.delete_completed(&op.id, op.version).await? {
                state.pushed += 1;
            }
        }
        Ok(())
    }

    async fn write_results(&self, table: &str, results: Vec<Document>) -> Result<()> {
        self.store
            .upsert(table, results, true)
            .await
            .map_err(store_error(format!("failed to store server results in '{table}'")))
    }

    /// Keep a merged payload for the next push.
    async fn persist_merge(&self, queue: &OperationQueue, op: &mut Operation) -> Result<()> {
        if op.kind != OperationKind::Delete {
            if let Some(item) = &op.item {
                self.store
                    .upsert(&op.table_name, vec![item.clone()], false)
                    .await
                    .map_err(store_error(format!(
                        "failed to store merged item in '{}'",
                        op.table_name
                    )))?;
            }
        }
        queue.update_in_place(op).await
    }

    /// Fetch remote rows matching `query` into the local store.
    ///
    /// Pending operations on the table are pushed first; a failed push fails
    /// the pull. Rows the remote marks as deleted are removed locally. Rows
    /// whose item has a queued operation are left alone. Returns the number
    /// of rows applied.
    pub async fn pull(&self, query: &Query) -> Result<usize> {
        let queue = self.queue()?;
        let table = query.table.as_str();

        let _table_lock = queue.lock_table(table).await;
        if queue.count_pending(table).await? > 0 {
            tracing::debug!(table, "pushing pending operations before pull");
            self.push_tables(&[table.to_string()], Some(table)).await?;
        }

        let rows = self.remote.read(query).await?;
        let ids: Vec<ItemId> = rows
            .iter()
            .filter_map(|row| document::document_id(row).map(str::to_string))
            .collect();

        let _item_locks = queue.lock_items(table, &ids).await;
        let pending: HashSet<ItemId> = queue
            .find_by_items(table, &ids)
            .await?
            .into_iter()
            .map(|op| op.item_id)
            .collect();

        let mut deleted = Vec::new();
        let mut upserts = Vec::new();
        let mut skipped = 0;
        for row in rows {
            let Some(id) = document::document_id(&row).map(str::to_string) else {
                tracing::warn!(table, "ignoring remote row without an id");
                continue;
            };
            if pending.contains(&id) {
                skipped += 1;
            } else if document::is_deleted(&row) {
                deleted.push(id);
            } else {
                upserts.push(row);
            }
        }

        let applied = deleted.len() + upserts.len();
        if !deleted.is_empty() {
            self.store
                .delete(table, &deleted)
                .await
                .map_err(store_error(format!("failed to delete pulled rows from '{table}'")))?;
        }
        if !upserts.is_empty() {
            self.write_results(table, upserts).await?;
        }

        tracing::info!(table, applied, deleted = deleted.len(), skipped, "pull completed");
        Ok(applied)
    }

    /// Clear a table locally.
    ///
    /// Fails with [`Error::PurgePending`] if operations are queued for it,
    /// unless `force` is set, in which case they are discarded too. Items
    /// first written while the purge runs survive it with their operations.
    pub async fn purge(&self, table: &str, force: bool) -> Result<()> {
        let queue = self.queue()?;
        let _table_lock = queue.lock_table(table).await;

        let pending = queue.count_pending(table).await?;
        if pending > 0 && !force {
            return Err(Error::PurgePending(table.to_string()));
        }

        // Items first written after these listings are left alone
        let queued = queue.list(TableKind::Table, &[table.to_string()]).await?;
        let local_ids: Vec<ItemId> = self
            .store
            .query(&Query::new(table))
            .await
            .map_err(store_error(format!("failed to read '{table}'")))?
            .values
            .iter()
            .filter_map(|row| document::document_id(row).map(str::to_string))
            .collect();
        let mut item_ids = queue::item_ids(&queued);
        item_ids.extend(local_ids.iter().cloned());

        let _item_locks = queue.lock_items(table, &item_ids).await;
        let discarded = queue.remove_items(table, &item_ids).await?;
        if !local_ids.is_empty() {
            self.store
                .delete(table, &local_ids)
                .await
                .map_err(store_error(format!("failed to purge '{table}'")))?;
        }

        tracing::info!(table, discarded, "table purged");
        Ok(())
    }
}
