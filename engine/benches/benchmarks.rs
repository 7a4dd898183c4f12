//! Performance benchmarks for offsync-engine

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use offsync_engine::{
    Document, MemoryStore, Operation, OperationKind, OperationQueue, Query, RemoteError,
    RemoteTable, SyncConfig, SyncContext, TableKind,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Remote that accepts every write as sent.
struct Echo;

#[async_trait]
impl RemoteTable for Echo {
    async fn insert(&self, _: &str, item: &Document) -> Result<Value, RemoteError> {
        Ok(Value::Object(item.clone()))
    }
    async fn update(&self, _: &str, item: &Document) -> Result<Value, RemoteError> {
        Ok(Value::Object(item.clone()))
    }
    async fn delete(&self, _: &str, _: &Document) -> Result<Value, RemoteError> {
        Ok(Value::Null)
    }
    async fn insert_all(&self, _: &str, items: &[Document]) -> Result<Value, RemoteError> {
        Ok(items.iter().cloned().map(Value::Object).collect())
    }
    async fn update_all(&self, _: &str, items: &[Document]) -> Result<Value, RemoteError> {
        Ok(items.iter().cloned().map(Value::Object).collect())
    }
    async fn lookup(&self, _: &str, _: &str) -> Result<Option<Document>, RemoteError> {
        Ok(None)
    }
    async fn read(&self, _: &Query) -> Result<Vec<Document>, RemoteError> {
        Ok(Vec::new())
    }
}

fn todo(i: usize) -> Document {
    json!({"id": format!("todo_{}", i), "text": format!("Todo {}", i), "done": false})
        .as_object()
        .cloned()
        .unwrap()
}

fn bench_collapse(c: &mut Criterion) {
    let mut group = c.benchmark_group("collapse");

    group.bench_function("insert_then_updates", |b| {
        b.iter(|| {
            let mut op = Operation::new(
                OperationKind::Insert,
                "todos",
                TableKind::Table,
                "todo_1",
                Some(todo(1)),
            );
            for _ in 0..10 {
                let _ = op.collapse(black_box(OperationKind::Update), Some(todo(1)));
            }
            op
        })
    });

    group.bench_function("to_row", |b| {
        let op = Operation::new(
            OperationKind::Delete,
            "todos",
            TableKind::Table,
            "todo_1",
            Some(todo(1)),
        );
        b.iter(|| black_box(&op).to_row())
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue");
    let config = SyncConfig::default();

    group.bench_function("enqueue", |b| {
        let queue = OperationQueue::new(Arc::new(MemoryStore::new()), &config);
        let mut i = 0usize;
        b.to_async(&rt).iter(|| {
            i += 1;
            let mut op = Operation::new(
                OperationKind::Insert,
                "todos",
                TableKind::Table,
                format!("todo_{}", i),
                None,
            );
            let queue = &queue;
            async move { queue.enqueue(&mut op).await }
        })
    });

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("peek_batch", size), size, |b, &size| {
            let queue = OperationQueue::new(Arc::new(MemoryStore::new()), &config);
            rt.block_on(async {
                for i in 0..size {
                    let mut op = Operation::new(
                        OperationKind::Insert,
                        "todos",
                        TableKind::Table,
                        format!("todo_{}", i),
                        None,
                    );
                    queue.enqueue(&mut op).await.unwrap();
                }
            });

            b.to_async(&rt)
                .iter(|| queue.peek_batch(black_box(0), TableKind::Table, &[]))
        });
    }

    group.finish();
}

fn bench_push(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("push");

    for size in [10, 100, 500].iter() {
        for bulk_push in [true, false] {
            let name = if bulk_push { "bulk" } else { "single" };
            group.bench_with_input(BenchmarkId::new(name, size), size, |b, &size| {
                b.to_async(&rt).iter(|| async move {
                    let ctx = SyncContext::new(Arc::new(MemoryStore::new()), Arc::new(Echo))
                        .with_config(SyncConfig {
                            bulk_push,
                            ..SyncConfig::default()
                        });
                    ctx.initialize().await.unwrap();
                    ctx.insert_all("todos", (0..size).map(todo).collect())
                        .await
                        .unwrap();
                    ctx.push::<&str>(&[]).await.unwrap()
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_collapse, bench_queue, bench_push);
criterion_main!(benches);
