//! Networking hot paths.
//!
//! Benchmarks:
//! - Inventory filter insert at capacity and lookup
//! - Frame encode/decode of a full block

use rota_bench as _;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rota_core::{derive_address, hash, Block, BlockBuilder, SecretKey, Transaction};
use rota_net::{InventoryFilter, Message, MessageCodec};

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");

    for capacity in [1_000usize, 50_000] {
        group.bench_with_input(
            BenchmarkId::new("insert_evicting", capacity),
            &capacity,
            |b, &capacity| {
                let filter = InventoryFilter::with_capacity(capacity);
                for i in 0..capacity as u64 {
                    filter.insert(hash(&i.to_le_bytes()));
                }
                let mut next = capacity as u64;
                b.iter(|| {
                    next += 1;
                    filter.insert(black_box(hash(&next.to_le_bytes())))
                })
            },
        );
    }

    let filter = InventoryFilter::with_capacity(50_000);
    let seen: Vec<_> = (0..50_000u64).map(|i| hash(&i.to_le_bytes())).collect();
    for h in &seen {
        filter.insert(*h);
    }
    group.bench_function("contains_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 7919) % seen.len();
            filter.contains(black_box(&seen[i]))
        })
    });

    group.finish();
}

fn block_with(count: usize) -> Block {
    let key = SecretKey::generate();
    let me = derive_address(&key.public_key());
    let mut txs = vec![Transaction::coinbase(1, me, 50, 11, 0)];
    txs.extend((0..count).map(|i| Transaction::register(&SecretKey::generate(), i as i64)));
    BlockBuilder::new().transactions(txs).seal(&key)
}

fn bench_codec(c: &mut Criterion) {
    let codec = MessageCodec::new();
    let mut group = c.benchmark_group("codec");

    for count in [10usize, 500] {
        let message = Message::NewBlock(block_with(count));
        let encoded = codec.encode(&message).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode_block", count), &message, |b, m| {
            b.iter(|| codec.encode(black_box(m)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode_block", count), &encoded, |b, e| {
            b.iter(|| codec.decode(black_box(e)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter, bench_codec);

criterion_main!(benches);
