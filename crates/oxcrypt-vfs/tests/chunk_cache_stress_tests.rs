//! High-contention tests for `ChunkCache` over an encrypted file.
//!
//! ```bash
//! cargo test -p oxcrypt-vfs --features stress --test chunk_cache_stress_tests
//! ```

#![cfg(feature = "stress")]

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{CollectingPool, create_test_cryptor, init_tracing};
use oxcrypt_vfs::CryptoFsStats;
use oxcrypt_vfs::crypto::CHUNK_PLAINTEXT_SIZE;
use oxcrypt_vfs::fs::{Chunk, ChunkCache, ChunkSaver, CiphertextChunkIo};
use rand::Rng;
use tempfile::TempDir;

const CHUNKS: u64 = 24;
const THREADS: usize = 16;
const OPS_PER_THREAD: usize = 2_000;

fn expected(chunk: u64) -> Vec<u8> {
    vec![(chunk as u8).wrapping_mul(7); CHUNK_PLAINTEXT_SIZE]
}

#[test]
fn stress_random_reads_over_small_cache() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let stats = Arc::new(CryptoFsStats::new());
    let io = Arc::new(
        CiphertextChunkIo::create(&dir.path().join("big.c9r"), create_test_cryptor(), Arc::clone(&stats))
            .unwrap(),
    );
    for chunk in 0..CHUNKS {
        io.save(chunk, &Chunk::dirty(expected(chunk))).unwrap();
    }
    stats.reset();

    let pool = Arc::new(CollectingPool::default());
    let cache = Arc::new(ChunkCache::new(
        Arc::clone(&io) as _,
        Arc::clone(&io) as _,
        Arc::clone(&stats),
        Arc::clone(&pool) as _,
    ));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();
                for _ in 0..OPS_PER_THREAD {
                    let chunk = rng.random_range(0..CHUNKS);
                    let data = cache.get(chunk).unwrap().to_vec();
                    // An evicted chunk hands its buffer to the pool, so a
                    // concurrent eviction may leave it empty.
                    assert!(data.is_empty() || data == expected(chunk), "chunk {chunk} corrupted");
                    assert!(cache.len() <= cache.capacity());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    cache.invalidate_all().unwrap();
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.chunk_cache_accesses, (THREADS * OPS_PER_THREAD) as u64);
    assert_eq!(snapshot.chunks_loaded, snapshot.chunk_cache_misses);
    assert_eq!(snapshot.chunk_evictions, pool.count() as u64);
    assert_eq!(snapshot.chunks_saved, 0);
}
