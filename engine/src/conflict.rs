//! Version-conflict resolution.
//!
//! When the remote rejects a write because the server version moved on, the
//! client copy and the server copy are handed to a [`ConflictPolicy`]. The
//! merged document is stamped with the server's version token and submitted
//! again, until the remote accepts it or fails for another reason.
//!
//! The loop is unbounded unless `max_rounds` is given: a policy that never
//! converges keeps the push busy. Callers that cannot guarantee convergence
//! should set [`SyncConfig::max_conflict_rounds`](crate::SyncConfig).

use crate::bulk::BulkOperation;
use crate::document::{self, Document};
use crate::error::{Error, Result};
use crate::operation::{Operation, OperationKind};
use crate::remote::{self, RemoteError, RemoteTable};
use crate::ItemId;
use std::collections::HashSet;

/// Merges a client document with the server's current copy.
pub trait ConflictPolicy: Send + Sync {
    /// Produce the document to resubmit.
    ///
    /// The server's version token is stamped onto the result afterwards, so
    /// the policy does not need to copy it.
    fn merge(&self, client: &Document, server: &Document) -> Document;
}

impl<F> ConflictPolicy for F
where
    F: Fn(&Document, &Document) -> Document + Send + Sync,
{
    fn merge(&self, client: &Document, server: &Document) -> Document {
        self(client, server)
    }
}

/// Keep the client's fields, overwriting the server copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ConflictPolicy for ClientWins {
    fn merge(&self, client: &Document, _server: &Document) -> Document {
        client.clone()
    }
}

/// Discard the client's changes in favour of the server copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ConflictPolicy for ServerWins {
    fn merge(&self, _client: &Document, server: &Document) -> Document {
        server.clone()
    }
}

/// Run `policy` and stamp the server version onto the result.
pub fn merge_with_server(
    policy: &dyn ConflictPolicy,
    client: &Document,
    server: &Document,
) -> Document {
    let mut merged = policy.merge(client, server);
    document::set_server_version(&mut merged, document::server_version(server).cloned());
    merged
}

fn exhausted(rounds: u32, max_rounds: Option<u32>) -> bool {
    max_rounds.is_some_and(|max| rounds >= max)
}

/// Execute `op`, resolving version conflicts with `policy`.
///
/// On success the operation's item holds the last payload sent. A conflict
/// fault without a server copy is answered by looking the item up remotely.
pub async fn resolve(
    op: &mut Operation,
    remote: &dyn RemoteTable,
    policy: &dyn ConflictPolicy,
    max_rounds: Option<u32>,
) -> Result<Option<Document>> {
    let mut rounds = 0;
    loop {
        let server_item = match op.execute_remote(remote).await {
            Ok(result) => return Ok(result),
            Err(Error::Remote(RemoteError::PreconditionFailed { server_item })) => server_item,
            Err(e) => return Err(e),
        };

        if exhausted(rounds, max_rounds) {
            tracing::warn!(
                op_id = %op.id,
                item_id = %op.item_id,
                rounds,
                "giving up on conflict resolution"
            );
            return Err(RemoteError::PreconditionFailed { server_item }.into());
        }
        rounds += 1;

        let server = match server_item {
            Some(server) => server,
            None => remote
                .lookup(&op.table_name, &op.item_id)
                .await?
                .ok_or_else(|| RemoteError::NotFound(op.item_id.clone()))?,
        };
        let client = op.item.as_ref().ok_or_else(|| {
            Error::InvalidOperation("operation must have an item associated with it".into())
        })?;

        tracing::warn!(
            op_id = %op.id,
            table = %op.table_name,
            item_id = %op.item_id,
            round = rounds,
            "version conflict; resubmitting merged item"
        );
        op.item = Some(merge_with_server(policy, client, &server));
    }
}

/// Execute `bulk`, resolving per-item version conflicts with `policy`.
///
/// Rows the remote accepted are never resubmitted. Each round merges the
/// conflicting rows by id and resubmits only those. The returned documents
/// are the server copies of every accepted row across all rounds; for
/// deletes they are the rows sent.
///
/// Merged payloads are written back onto `bulk`. Whenever some row ends up
/// not accepted the error carries every row accepted so far: a
/// [`RemoteError::BulkConflict`] when resolution gives up, otherwise a
/// [`RemoteError::PartialFailure`]. Rows a conflict response neither accepts
/// nor reports are not resubmitted and fail the call.
pub async fn resolve_bulk(
    bulk: &mut BulkOperation,
    remote: &dyn RemoteTable,
    policy: &dyn ConflictPolicy,
    max_rounds: Option<u32>,
) -> Result<Vec<Document>> {
    let mut results = Vec::new();
    let mut unresolved: Vec<ItemId> = Vec::new();
    let mut pending = bulk.clone();
    let mut rounds = 0;

    loop {
        let (accepted, server_items) = match pending.execute_remote(remote).await {
            Ok(_) if pending.kind == OperationKind::Delete => {
                results.extend(pending.items()?);
                break;
            }
            Ok(accepted) => {
                results.extend(accepted);
                break;
            }
            Err(Error::Remote(RemoteError::BulkConflict {
                accepted,
                server_items,
            })) => (accepted, server_items),
            Err(Error::Remote(e)) => return Err(e.after_accepting(results).into()),
            Err(e) if results.is_empty() => return Err(e),
            Err(e) => {
                return Err(RemoteError::InvalidOperation(e.to_string())
                    .after_accepting(results)
                    .into())
            }
        };

        {
            let reported: HashSet<&str> = accepted
                .iter()
                .chain(&server_items)
                .filter_map(document::document_id)
                .collect();
            unresolved.extend(
                pending
                    .item_ids()
                    .into_iter()
                    .filter(|id| !reported.contains(id.as_str())),
            );
        }
        results.extend(accepted);

        if exhausted(rounds, max_rounds) {
            tracing::warn!(
                table = %bulk.table_name,
                conflicts = server_items.len(),
                rounds,
                "giving up on bulk conflict resolution"
            );
            return Err(RemoteError::BulkConflict {
                accepted: results,
                server_items,
            }
            .into());
        }
        rounds += 1;

        let client_items = pending.items()?;
        let merged: Vec<Document> = server_items
            .iter()
            .filter_map(|server| {
                let id = document::document_id(server)?;
                let client = remote::find_by_id(&client_items, id)?;
                Some(merge_with_server(policy, client, server))
            })
            .collect();

        if merged.is_empty() {
            break;
        }

        tracing::warn!(
            table = %bulk.table_name,
            conflicts = merged.len(),
            round = rounds,
            "bulk version conflict; resubmitting merged items"
        );

        let ids: Vec<ItemId> = merged
            .iter()
            .filter_map(|item| document::document_id(item).map(str::to_string))
            .collect();
        bulk.update_items(merged.clone());
        pending = pending.subset(&ids);
        pending.update_items(merged);
    }

    if unresolved.is_empty() {
        return Ok(results);
    }
    tracing::warn!(
        table = %bulk.table_name,
        unresolved = unresolved.len(),
        "remote neither accepted nor reported some rows"
    );
    Err(RemoteError::InvalidOperation(format!(
        "{} item(s) neither accepted nor reported as conflicting: {}",
        unresolved.len(),
        unresolved.join(", ")
    ))
    .after_accepting(results)
    .into())
}
