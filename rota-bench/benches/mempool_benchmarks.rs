//! Mempool benchmarks.
//!
//! Benchmarks:
//! - Mempool operations (add, drain, requeue)

use rota_bench as _;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rota_chain::{Mempool, MempoolConfig};
use rota_core::{derive_address, OutPoint, SecretKey, Transaction, TxId, TxInput, TxOutput, hash};

fn create_payment(key: &SecretKey, n: u32) -> Transaction {
    let me = derive_address(&key.public_key());
    Transaction::payment(
        vec![TxInput {
            outpoint: OutPoint::new(TxId(hash(&n.to_le_bytes())), 0),
            value: 1_000,
        }],
        vec![TxOutput {
            value: 990,
            recipient: me,
        }],
        n as i64,
    )
    .sign(key)
}

fn payments(key: &SecretKey, count: u32) -> Vec<Transaction> {
    (0..count).map(|i| create_payment(key, i)).collect()
}

fn bench_mempool_add(c: &mut Criterion) {
    let key = SecretKey::generate();
    let txs = payments(&key, 10_000);

    let mut group = c.benchmark_group("mempool/add");

    group.bench_function("single_tx", |b| {
        let mempool = Mempool::new(MempoolConfig::default());
        let mut i = 0usize;
        b.iter(|| {
            let added = mempool.add(black_box(txs[i % txs.len()].clone()));
            i += 1;
            if i % txs.len() == 0 {
                mempool.clear();
            }
            added
        })
    });

    group.bench_function("duplicate_tx", |b| {
        let mempool = Mempool::new(MempoolConfig::default());
        mempool.add(txs[0].clone());
        b.iter(|| mempool.add(black_box(txs[0].clone())))
    });

    group.finish();
}

fn bench_mempool_drain(c: &mut Criterion) {
    let key = SecretKey::generate();
    let sizes = [10u32, 100, 1000];

    let mut group = c.benchmark_group("mempool/drain");

    for size in sizes {
        let txs = payments(&key, size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("fifo", size), &txs, |b, txs| {
            b.iter_batched(
                || {
                    let mempool = Mempool::new(MempoolConfig::default());
                    for tx in txs {
                        mempool.add(tx.clone());
                    }
                    mempool
                },
                |mempool| {
                    let mut taken = 0;
                    while let Some(tx) = mempool.get() {
                        black_box(tx);
                        taken += 1;
                    }
                    taken
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("newest", size), &txs, |b, txs| {
            b.iter_batched(
                || {
                    let mempool = Mempool::new(MempoolConfig::default());
                    for tx in txs {
                        mempool.add(tx.clone());
                    }
                    mempool
                },
                |mempool| mempool.get_newest(black_box(txs.len())),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_mempool_requeue(c: &mut Criterion) {
    let key = SecretKey::generate();
    let candidate = payments(&key, 500);

    c.bench_function("mempool/requeue_500", |b| {
        b.iter_batched(
            || {
                let mempool = Mempool::new(MempoolConfig::default());
                for tx in payments(&key, 100) {
                    mempool.add(tx);
                }
                mempool
            },
            |mempool| mempool.requeue(black_box(candidate.clone())),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_mempool_add,
    bench_mempool_drain,
    bench_mempool_requeue,
);

criterion_main!(benches);
