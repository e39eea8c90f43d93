//! Chunk math microbenchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kitefs::layout::{split_io, ChunkId, Layout};
use kitefs::types::{ChainTableId, InodeId};

fn bench_chunk_id(c: &mut Criterion) {
  let id = ChunkId::new(InodeId(123456), 789);
  let raw = id.encode();
  c.bench_function("chunk_id_encode", |b| b.iter(|| black_box(&id).encode()));
  c.bench_function("chunk_id_decode", |b| {
    b.iter(|| ChunkId::decode(black_box(&raw)).unwrap())
  });
}

fn bench_split_io(c: &mut Criterion) {
  let layout = Layout {
    chain_table_id: ChainTableId(1),
    chain_table_version: 1,
    chunk_size: 512 * 1024,
    stripe_size: 16,
    seed: 0,
    chain_slots: (0..16).collect(),
  };
  c.bench_function("split_io_64mib", |b| {
    b.iter(|| split_io(black_box(&layout), 4095, 64 * 1024 * 1024))
  });
}

criterion_group!(benches, bench_chunk_id, bench_split_io);
criterion_main!(benches);
