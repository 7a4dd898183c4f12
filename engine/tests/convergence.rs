//! Random edit histories with pushes in between must leave the remote
//! exactly where applying every edit directly would have.

mod common;

use common::{doc, VersionedRemote};
use offsync_engine::{Document, Error, MemoryStore, SyncConfig, SyncContext};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const TODO: &str = "todo";
const NO_TABLES: &[&str] = &[];
const IDS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone, Copy)]
enum Action {
    Write(usize),
    Delete(usize),
    Push,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (0..IDS.len()).prop_map(Action::Write),
        2 => (0..IDS.len()).prop_map(Action::Delete),
        1 => Just(Action::Push),
    ]
}

fn without_version(mut row: Document) -> Document {
    row.remove("version");
    row
}

type Rows = BTreeMap<String, Document>;

/// Run the history; returns the expected rows, the remote rows and the local rows.
async fn run(actions: Vec<Action>, bulk_push: bool) -> (Rows, Rows, Rows) {
    let remote = VersionedRemote::new();
    let ctx = SyncContext::new(Arc::new(MemoryStore::new()), remote.clone()).with_config(
        SyncConfig {
            bulk_push,
            ..SyncConfig::default()
        },
    );
    ctx.initialize().await.unwrap();

    let mut model = Rows::new();
    for (step, action) in actions.into_iter().enumerate() {
        match action {
            Action::Write(i) => {
                let id = IDS[i];
                let row = doc(json!({"id": id, "text": format!("v{step}")}));
                let result = if ctx.lookup(TODO, id).await.unwrap().is_some() {
                    ctx.update(TODO, row.clone()).await
                } else {
                    ctx.insert(TODO, row.clone()).await.map(drop)
                };
                match result {
                    Ok(()) => {
                        model.insert(id.to_string(), row);
                    }
                    Err(Error::CollapseInvalid { .. }) => {}
                    Err(e) => panic!("unexpected write failure: {e}"),
                }
            }
            Action::Delete(i) => {
                let id = IDS[i];
                let Some(row) = ctx.lookup(TODO, id).await.unwrap() else {
                    continue;
                };
                match ctx.delete(TODO, row).await {
                    Ok(()) => {
                        model.remove(id);
                    }
                    Err(Error::CollapseInvalid { .. }) => {}
                    Err(e) => panic!("unexpected delete failure: {e}"),
                }
            }
            Action::Push => {
                ctx.push(NO_TABLES).await.unwrap();
            }
        }
    }
    ctx.push(NO_TABLES).await.unwrap();
    assert_eq!(ctx.pending_operations().unwrap(), 0);

    let mut remote_rows = Rows::new();
    let mut local_rows = Rows::new();
    for id in IDS {
        if let Some(row) = remote.row(TODO, id) {
            remote_rows.insert(id.to_string(), without_version(row));
        }
        if let Some(row) = ctx.lookup(TODO, id).await.unwrap() {
            local_rows.insert(id.to_string(), without_version(row));
        }
    }
    (model, remote_rows, local_rows)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_push_converges_to_direct_apply(
        actions in prop::collection::vec(arb_action(), 0..40),
        bulk_push in any::<bool>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (model, remote_rows, local_rows) = rt.block_on(run(actions, bulk_push));

        prop_assert_eq!(&remote_rows, &model);
        prop_assert_eq!(&local_rows, &model);
    }
}
