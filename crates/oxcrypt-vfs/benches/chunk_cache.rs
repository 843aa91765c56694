//! Chunk cache hit/miss throughput over an in-memory loader.

use std::hint::black_box;
use std::io;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use oxcrypt_vfs::CryptoFsStats;
use oxcrypt_vfs::crypto::CHUNK_PLAINTEXT_SIZE;
use oxcrypt_vfs::fs::{BufferPool, Chunk, ChunkCache, ChunkLoadError, ChunkLoader, ChunkSaver};

struct ZeroChunks;

impl ChunkLoader for ZeroChunks {
    fn load(&self, _chunk: u64) -> Result<Chunk, ChunkLoadError> {
        Ok(Chunk::clean(vec![0; CHUNK_PLAINTEXT_SIZE]))
    }
}

impl ChunkSaver for ZeroChunks {
    fn save(&self, _chunk: u64, _data: &Chunk) -> io::Result<()> {
        Ok(())
    }
}

impl BufferPool for ZeroChunks {
    fn recycle(&self, buffer: Vec<u8>) {
        drop(buffer);
    }
}

fn new_cache() -> ChunkCache {
    let backend = Arc::new(ZeroChunks);
    ChunkCache::new(
        Arc::clone(&backend) as _,
        Arc::clone(&backend) as _,
        Arc::new(CryptoFsStats::new()),
        backend,
    )
}

fn bench_chunk_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_cache");
    group.throughput(Throughput::Elements(1));

    let cache = new_cache();
    cache.get(0).unwrap();
    group.bench_function("hit", |b| b.iter(|| black_box(cache.get(black_box(0)).unwrap())));

    // Cycling through more indices than the cache holds misses every time.
    for working_set in [5u64, 6, 16] {
        let cache = new_cache();
        let mut next = 0u64;
        group.bench_with_input(
            BenchmarkId::new("cycle", working_set),
            &working_set,
            |b, &working_set| {
                b.iter(|| {
                    next = (next + 1) % working_set;
                    black_box(cache.get(next).unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_chunk_cache);
criterion_main!(benches);
