//! Statistics for one open filesystem.
//!
//! All counters are lock-free atomics. A single `Arc<CryptoFsStats>` is shared
//! by every chunk cache and chunk I/O instance of the filesystem.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CryptoFsStats {
    /// Number of `ChunkCache::get` calls.
    pub chunk_cache_accesses: AtomicU64,
    /// Number of `ChunkCache::get` calls that had to load the chunk.
    pub chunk_cache_misses: AtomicU64,
    /// Number of chunks evicted from chunk caches.
    pub chunk_evictions: AtomicU64,
    /// Number of chunks decrypted from storage.
    pub chunks_loaded: AtomicU64,
    /// Number of dirty chunks encrypted and written to storage.
    pub chunks_saved: AtomicU64,
}

impl CryptoFsStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_chunk_cache_access(&self) {
        self.chunk_cache_accesses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk_cache_miss(&self) {
        self.chunk_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk_eviction(&self) {
        self.chunk_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk_loaded(&self) {
        self.chunks_loaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk_saved(&self) {
        self.chunks_saved.fetch_add(1, Ordering::Relaxed);
    }

    /// Compute the chunk cache hit rate as a fraction (0.0 to 1.0).
    ///
    /// Returns 0.0 if no lookups have been performed.
    pub fn chunk_cache_hit_rate(&self) -> f64 {
        let accesses = self.chunk_cache_accesses.load(Ordering::Relaxed);
        let misses = self.chunk_cache_misses.load(Ordering::Relaxed);
        if accesses == 0 {
            0.0
        } else {
            accesses.saturating_sub(misses) as f64 / accesses as f64
        }
    }

    pub fn snapshot(&self) -> CryptoFsStatsSnapshot {
        CryptoFsStatsSnapshot {
            chunk_cache_accesses: self.chunk_cache_accesses.load(Ordering::Relaxed),
            chunk_cache_misses: self.chunk_cache_misses.load(Ordering::Relaxed),
            chunk_evictions: self.chunk_evictions.load(Ordering::Relaxed),
            chunks_loaded: self.chunks_loaded.load(Ordering::Relaxed),
            chunks_saved: self.chunks_saved.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.chunk_cache_accesses.store(0, Ordering::Relaxed);
        self.chunk_cache_misses.store(0, Ordering::Relaxed);
        self.chunk_evictions.store(0, Ordering::Relaxed);
        self.chunks_loaded.store(0, Ordering::Relaxed);
        self.chunks_saved.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CryptoFsStats`], suitable for serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CryptoFsStatsSnapshot {
    pub chunk_cache_accesses: u64,
    pub chunk_cache_misses: u64,
    pub chunk_evictions: u64,
    pub chunks_loaded: u64,
    pub chunks_saved: u64,
}
