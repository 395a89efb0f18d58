// Copyright 2025 Cowboy AI, LLC.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ledger_core::config::LedgerConfig;
use ledger_core::domain::AccountCommand;
use ledger_core::identifiers::{AccountId, TransactionId};
use ledger_core::infrastructure::event_log::InMemoryEventLog;
use ledger_core::infrastructure::relational_store::{InMemoryReadModelStore, InMemorySnapshotRepository};
use ledger_core::infrastructure::AggregateLoader;
use ledger_core::janitor::SnapshotJanitor;
use ledger_core::ring::{RingBuffer, RingPipeline};
use rust_decimal::Decimal;
use tokio::runtime::Runtime;

fn setup_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Raw claim/write/publish latency against an otherwise-idle ring: no
/// consumer stages running, so this isolates the producer side's
/// atomic-increment-plus-gating-wait cost from everything downstream.
fn benchmark_claim_write_publish(c: &mut Criterion) {
    let rt = setup_runtime();
    let ring = Arc::new(RingBuffer::new(1024));
    let account_id = AccountId::new();

    c.bench_function("ring_claim_write_publish", |b| {
        b.iter(|| {
            rt.block_on(async {
                let sequence = ring.claim().await;
                let command = AccountCommand::deposit(account_id, Decimal::new(1, 0), TransactionId::new());
                ring.write(sequence, command);
                ring.publish(sequence, true);
                black_box(sequence)
            })
        });
    });
}

/// End-to-end throughput of the full three-stage pipeline (apply,
/// journal, read-model) against in-memory adapters, batched by ring
/// capacity so every deposit lands as its own end-of-batch publish.
fn benchmark_pipeline_throughput(c: &mut Criterion) {
    let rt = setup_runtime();
    let mut group = c.benchmark_group("pipeline_deposit_throughput");

    for account_count in [1usize, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(account_count),
            account_count,
            |b, &account_count| {
                b.iter_batched(
                    || {
                        rt.block_on(async {
                            let config = LedgerConfig::default();
                            let ring = Arc::new(RingBuffer::new(config.ring_capacity));
                            let event_log = Arc::new(InMemoryEventLog::new());
                            let snapshots = Arc::new(InMemorySnapshotRepository::default());
                            let read_model = Arc::new(InMemoryReadModelStore::default());
                            let loader = Arc::new(AggregateLoader::new(
                                event_log.clone(),
                                snapshots.clone(),
                                config.aggregate_read_timeout,
                            ));
                            let janitor = Arc::new(SnapshotJanitor::new(snapshots, config.snapshot_retain_count));
                            let pipeline = RingPipeline::spawn(
                                ring.clone(),
                                loader,
                                event_log,
                                read_model.clone(),
                                janitor,
                                config.snapshot_threshold,
                            );
                            let accounts: Vec<AccountId> =
                                (0..account_count).map(|_| AccountId::new()).collect();
                            (ring, pipeline, read_model, accounts)
                        })
                    },
                    |(ring, pipeline, read_model, accounts)| {
                        rt.block_on(async {
                            for (i, account_id) in accounts.iter().enumerate() {
                                let sequence = ring.claim().await;
                                let command = AccountCommand::deposit(
                                    *account_id,
                                    Decimal::new(10, 0),
                                    TransactionId::new(),
                                );
                                ring.write(sequence, command);
                                ring.publish(sequence, i + 1 == accounts.len());
                            }
                            // Poll the read model rather than the ring's
                            // own cursors: the pipeline's background
                            // tasks own those cursors, and a second
                            // reader racing them would corrupt gating.
                            for account_id in &accounts {
                                loop {
                                    let balance = read_model.get_balance(*account_id).await.unwrap();
                                    if balance == Some(Decimal::new(10, 0)) {
                                        break;
                                    }
                                    tokio::task::yield_now().await;
                                }
                            }
                        });
                        pipeline.shutdown();
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_claim_write_publish, benchmark_pipeline_throughput);
criterion_main!(benches);
