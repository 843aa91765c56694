//! Bounded write-back cache of decrypted chunks for one open file.
//!
//! # Eviction
//!
//! The cache holds at most `capacity` chunks and evicts the least recently
//! used one (both `get` and `set` count as use) before inserting a new index.
//! Evicting a chunk saves it through the [`ChunkSaver`] and then returns its
//! buffer to the [`BufferPool`], synchronously on the thread that caused the
//! eviction.
//!
//! An eviction has no caller of its own, so a failed write-back is logged and
//! parked in a pending-error slot. The next `get`, `set`, `invalidate_all` or
//! `check_pending` call returns it (and clears it) instead of doing its work.
//!
//! # Concurrent misses
//!
//! Loads run outside the cache lock. The first thread to miss on an index
//! becomes the leader and calls the loader; threads missing on the same index
//! meanwhile block until the leader finishes and then share its result,
//! success or failure.
//!
//! A `set` of an index with a load in flight supersedes that load. The leader
//! then discards what it read: it returns the chunk installed by `set` if that
//! is still resident, and otherwise loads again, since the `set` chunk has
//! been evicted and saved in the meantime.
//!
//! # Chunk handles
//!
//! Saving runs under the cache lock and locks the chunk's buffer. Never hold
//! the guard returned by [`Chunk::data`] across a call into the cache.
//!
//! Once a chunk is evicted its buffer belongs to the buffer pool and the
//! handle is left empty. Writes through a handle kept past eviction are lost;
//! fetch the chunk again with `get` after any call that may evict.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use super::chunk::{BufferPool, Chunk, ChunkLoadError, ChunkLoader, ChunkSaver, SharedChunk};
use crate::config::{ChunkCacheConfig, MAX_CACHED_CLEARTEXT_CHUNKS};
use crate::stats::CryptoFsStats;

/// Errors returned by [`ChunkCache`].
///
/// `Clone` so that every thread waiting on one load gets the same failure.
#[derive(Error, Debug, Clone)]
pub enum ChunkCacheError {
    #[error("IO error loading chunk {chunk}: {source}")]
    Load {
        chunk: u64,
        #[source]
        source: Arc<io::Error>,
    },

    /// **[INTEGRITY VIOLATION]** The chunk ciphertext did not authenticate.
    #[error("[INTEGRITY VIOLATION] Unauthentic ciphertext in chunk {chunk}")]
    Unauthentic { chunk: u64 },

    /// Saving an evicted chunk failed. Its modifications are lost.
    #[error("Failed to write back evicted chunk {chunk}: {source}")]
    WriteBack {
        chunk: u64,
        #[source]
        source: Arc<io::Error>,
    },
}

impl ChunkCacheError {
    pub fn chunk(&self) -> u64 {
        match self {
            ChunkCacheError::Load { chunk, .. }
            | ChunkCacheError::Unauthentic { chunk }
            | ChunkCacheError::WriteBack { chunk, .. } => *chunk,
        }
    }

    #[inline]
    pub fn is_unauthentic(&self) -> bool {
        matches!(self, ChunkCacheError::Unauthentic { .. })
    }
}

impl From<ChunkCacheError> for io::Error {
    fn from(err: ChunkCacheError) -> Self {
        let kind = match &err {
            ChunkCacheError::Unauthentic { .. } => io::ErrorKind::InvalidData,
            ChunkCacheError::Load { source, .. } | ChunkCacheError::WriteBack { source, .. } => {
                source.kind()
            }
        };
        io::Error::new(kind, err)
    }
}

type LoadResult = Result<SharedChunk, ChunkCacheError>;

/// A load in progress, shared by its leader and any waiters.
struct InFlightLoad {
    result: Mutex<Option<LoadResult>>,
    done: Condvar,
    /// Set (under the cache lock) when the index is installed by `set`
    /// while the load runs.
    superseded: AtomicBool,
}

impl InFlightLoad {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
            superseded: AtomicBool::new(false),
        }
    }

    fn supersede(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    fn take_superseded(&self) -> bool {
        self.superseded.swap(false, Ordering::AcqRel)
    }

    fn complete(&self, result: LoadResult) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> LoadResult {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

enum Lookup {
    Hit(SharedChunk),
    Leader(Arc<InFlightLoad>),
    Waiter(Arc<InFlightLoad>),
}

struct CacheState {
    chunks: LruCache<u64, SharedChunk>,
    loading: HashMap<u64, Arc<InFlightLoad>>,
    pending_error: Option<ChunkCacheError>,
}

impl CacheState {
    fn take_pending(&mut self) -> Result<(), ChunkCacheError> {
        match self.pending_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Per-open-file cache of decrypted chunks.
pub struct ChunkCache {
    loader: Arc<dyn ChunkLoader>,
    saver: Arc<dyn ChunkSaver>,
    stats: Arc<CryptoFsStats>,
    buffer_pool: Arc<dyn BufferPool>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkCache")
            .field("capacity", &self.capacity)
            .field("resident", &state.chunks.len())
            .field("loading", &state.loading.len())
            .field("pending_error", &state.pending_error)
            .finish_non_exhaustive()
    }
}

impl ChunkCache {
    /// Create a cache holding up to [`MAX_CACHED_CLEARTEXT_CHUNKS`] chunks.
    pub fn new(
        loader: Arc<dyn ChunkLoader>,
        saver: Arc<dyn ChunkSaver>,
        stats: Arc<CryptoFsStats>,
        buffer_pool: Arc<dyn BufferPool>,
    ) -> Self {
        Self::with_capacity(
            loader,
            saver,
            stats,
            buffer_pool,
            MAX_CACHED_CLEARTEXT_CHUNKS,
        )
    }

    /// Create a cache with a custom bound. A capacity of zero is raised to one.
    pub fn with_capacity(
        loader: Arc<dyn ChunkLoader>,
        saver: Arc<dyn ChunkSaver>,
        stats: Arc<CryptoFsStats>,
        buffer_pool: Arc<dyn BufferPool>,
        capacity: usize,
    ) -> Self {
        Self {
            loader,
            saver,
            stats,
            buffer_pool,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                chunks: LruCache::unbounded(),
                loading: HashMap::new(),
                pending_error: None,
            }),
        }
    }

    pub fn from_config(
        loader: Arc<dyn ChunkLoader>,
        saver: Arc<dyn ChunkSaver>,
        stats: Arc<CryptoFsStats>,
        buffer_pool: Arc<dyn BufferPool>,
        config: &ChunkCacheConfig,
    ) -> Self {
        Self::with_capacity(loader, saver, stats, buffer_pool, config.max_cached_chunks)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident chunks.
    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    /// Whether `chunk` is resident. Does not count as an access.
    pub fn contains(&self, chunk: u64) -> bool {
        self.state.lock().chunks.contains(&chunk)
    }

    /// Return the chunk at `chunk`, loading it on a miss.
    ///
    /// The handle stays valid until the chunk is evicted; see the module
    /// docs on chunk handles.
    #[instrument(level = "trace", skip(self))]
    pub fn get(&self, chunk: u64) -> Result<SharedChunk, ChunkCacheError> {
        self.stats.record_chunk_cache_access();

        let lookup = {
            let mut state = self.state.lock();
            state.take_pending()?;
            if let Some(cached) = state.chunks.get(&chunk) {
                Lookup::Hit(Arc::clone(cached))
            } else if let Some(flight) = state.loading.get(&chunk) {
                Lookup::Waiter(Arc::clone(flight))
            } else {
                let flight = Arc::new(InFlightLoad::new());
                state.loading.insert(chunk, Arc::clone(&flight));
                Lookup::Leader(flight)
            }
        };

        match lookup {
            Lookup::Hit(cached) => Ok(cached),
            Lookup::Waiter(flight) => {
                trace!(chunk, "Waiting for in-flight chunk load");
                flight.wait()
            }
            Lookup::Leader(flight) => {
                let mut guard = LeaderGuard {
                    cache: self,
                    chunk,
                    flight: &flight,
                    completed: false,
                };
                let result = self.load_and_install(chunk, &flight);
                guard.completed = true;
                flight.complete(result.clone());
                result
            }
        }
    }

    /// Install `data` as the chunk at `chunk` without consulting the loader.
    ///
    /// A chunk previously cached under the same index is replaced, not saved.
    #[instrument(level = "trace", skip(self, data))]
    pub fn set(&self, chunk: u64, data: SharedChunk) -> Result<(), ChunkCacheError> {
        let mut state = self.state.lock();
        state.take_pending()?;
        self.insert_locked(&mut state, chunk, data);
        Ok(())
    }

    /// Evict every chunk, writing each one back.
    ///
    /// All chunks are evicted even if some saves fail; the first failure
    /// (or an earlier pending one) is returned.
    #[instrument(level = "debug", skip(self))]
    pub fn invalidate_all(&self) -> Result<(), ChunkCacheError> {
        let mut state = self.state.lock();
        let mut first_error = state.pending_error.take();
        debug!(resident = state.chunks.len(), "Invalidating chunk cache");

        while let Some((chunk, victim)) = state.chunks.pop_lru() {
            if let Err(err) = self.evict(chunk, &victim) {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Return (and clear) a write-back failure left behind by an eviction.
    pub fn check_pending(&self) -> Result<(), ChunkCacheError> {
        self.state.lock().take_pending()
    }

    fn load_chunk(&self, chunk: u64) -> Result<Chunk, ChunkCacheError> {
        self.stats.record_chunk_cache_miss();
        self.loader.load(chunk).map_err(|err| match err {
            ChunkLoadError::Io(source) => ChunkCacheError::Load {
                chunk,
                source: Arc::new(source),
            },
            ChunkLoadError::Unauthentic { .. } => {
                warn!(chunk, "Unauthentic ciphertext in chunk");
                ChunkCacheError::Unauthentic { chunk }
            }
        })
    }

    /// Load `chunk` and install it. The in-flight marker is removed under
    /// the same lock that installs the result.
    fn load_and_install(&self, chunk: u64, flight: &InFlightLoad) -> LoadResult {
        loop {
            let loaded = self.load_chunk(chunk);

            let mut state = self.state.lock();
            if flight.take_superseded() {
                if let Ok(stale) = loaded {
                    self.buffer_pool.recycle(stale.take_buffer());
                }
                if let Some(current) = state.chunks.get(&chunk) {
                    let current = Arc::clone(current);
                    state.loading.remove(&chunk);
                    return Ok(current);
                }
                debug!(chunk, "Chunk was replaced and evicted during load, reloading");
                continue;
            }

            state.loading.remove(&chunk);
            let loaded = Arc::new(loaded?);
            self.insert_locked(&mut state, chunk, Arc::clone(&loaded));
            return Ok(loaded);
        }
    }

    fn insert_locked(&self, state: &mut CacheState, chunk: u64, data: SharedChunk) {
        if let Some(flight) = state.loading.get(&chunk) {
            trace!(chunk, "Superseding in-flight load");
            flight.supersede();
        }
        if !state.chunks.contains(&chunk) && state.chunks.len() >= self.capacity {
            if let Some((victim_index, victim)) = state.chunks.pop_lru() {
                if let Err(err) = self.evict(victim_index, &victim) {
                    if let Some(pending) = &state.pending_error {
                        warn!(
                            chunk = victim_index,
                            pending_chunk = pending.chunk(),
                            "Dropping write-back failure, another one is already pending"
                        );
                    } else {
                        state.pending_error = Some(err);
                    }
                }
            }
        }
        state.chunks.put(chunk, data);
    }

    fn evict(&self, chunk: u64, victim: &SharedChunk) -> Result<(), ChunkCacheError> {
        trace!(chunk, dirty = victim.is_dirty(), "Evicting chunk");
        self.stats.record_chunk_eviction();
        match self.saver.save(chunk, victim) {
            Ok(()) => {
                let outstanding = Arc::strong_count(victim) - 1;
                if outstanding > 0 {
                    debug!(
                        chunk,
                        outstanding,
                        "Evicted chunk is still referenced, handles are now empty"
                    );
                }
                self.buffer_pool.recycle(victim.take_buffer());
                Ok(())
            }
            Err(source) => {
                error!(chunk, error = %source, "Write-back of evicted chunk failed");
                Err(ChunkCacheError::WriteBack {
                    chunk,
                    source: Arc::new(source),
                })
            }
        }
    }
}

/// Completes a leader's in-flight load if the loader panics, so waiters
/// never block forever.
struct LeaderGuard<'a> {
    cache: &'a ChunkCache,
    chunk: u64,
    flight: &'a InFlightLoad,
    completed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        {
            let mut state = self.cache.state.lock();
            let ours = state
                .loading
                .get(&self.chunk)
                .is_some_and(|f| std::ptr::eq(Arc::as_ptr(f), self.flight));
            if ours {
                state.loading.remove(&self.chunk);
            }
        }
        self.flight.complete(Err(ChunkCacheError::Load {
            chunk: self.chunk,
            source: Arc::new(io::Error::other("chunk load aborted")),
        }));
    }
}
