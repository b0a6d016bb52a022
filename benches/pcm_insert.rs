// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Micro-benchmark of the PCM insert/dequeue cycle — the hottest per-packet
//! path in the core (`SPEC_FULL.md` §10.4, `spec.md` §2 share-of-core table:
//! PCM is 14% of the system on its own).

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use rcc_dataplane::extseq::ExtSeq;
use rcc_dataplane::pak::{PakKind, PakPool, MTU};
use rcc_dataplane::pcm::Pcm;

const BATCH: u32 = 256;

fn fresh_batch(pool: &mut PakPool) -> Vec<(ExtSeq, rcc_dataplane::pak::PakRef)> {
    (0..BATCH)
        .map(|i| {
            let r = pool.alloc(MTU, PakKind::Primary).unwrap();
            (ExtSeq(i), r)
        })
        .collect()
}

fn insert_in_order(c: &mut Criterion) {
    c.bench_function("pcm_insert_in_order", |b| {
        b.iter_batched(
            || {
                let mut pool = PakPool::new(BATCH as usize + 1);
                let batch = fresh_batch(&mut pool);
                let pcm = Pcm::new(Duration::from_millis(10), Duration::from_millis(10));
                (pool, pcm, batch)
            },
            |(mut pool, mut pcm, batch)| {
                black_box(pcm.insert_packets(&mut pool, &batch, false, false));
            },
            BatchSize::SmallInput,
        )
    });
}

fn insert_reverse_order(c: &mut Criterion) {
    c.bench_function("pcm_insert_reverse_order", |b| {
        b.iter_batched(
            || {
                let mut pool = PakPool::new(BATCH as usize + 1);
                let mut batch = fresh_batch(&mut pool);
                batch.reverse();
                let pcm = Pcm::new(Duration::from_millis(10), Duration::from_millis(10));
                (pool, pcm, batch)
            },
            |(mut pool, mut pcm, batch)| {
                black_box(pcm.insert_packets(&mut pool, &batch, false, false));
            },
            BatchSize::SmallInput,
        )
    });
}

fn insert_then_drain(c: &mut Criterion) {
    c.bench_function("pcm_insert_then_drain", |b| {
        b.iter_batched(
            || {
                let mut pool = PakPool::new(BATCH as usize + 1);
                let batch = fresh_batch(&mut pool);
                let mut pcm = Pcm::new(Duration::from_millis(10), Duration::from_millis(10));
                pcm.insert_packets(&mut pool, &batch, false, false);
                (pool, pcm)
            },
            |(mut pool, mut pcm)| {
                while let Some((_, pak)) = pcm.dequeue() {
                    pool.release(pak);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, insert_in_order, insert_reverse_order, insert_then_drain);
criterion_main!(benches);
