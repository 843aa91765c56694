//! Decrypted file chunks and the collaborators that move them between
//! memory and ciphertext storage.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// A decrypted chunk of file content.
///
/// Chunks are shared between the cache and its callers, so the buffer sits
/// behind a mutex. Any modification through [`write_at`](Self::write_at) or
/// [`mark_dirty`](Self::mark_dirty) flags the chunk for write-back.
#[derive(Debug, Default)]
pub struct Chunk {
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

/// A chunk shared between the cache and the file channel using it.
pub type SharedChunk = Arc<Chunk>;

impl Chunk {
    /// A chunk freshly decrypted from storage.
    pub fn clean(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// A chunk whose content does not exist in storage yet.
    pub fn dirty(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            dirty: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Called by savers once the content has been persisted.
    #[inline]
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Lock the cleartext buffer for direct access.
    ///
    /// Changes made through the guard are not tracked; call
    /// [`mark_dirty`](Self::mark_dirty) afterwards.
    ///
    /// Savers lock this buffer while the cache holds its own lock, so the
    /// guard must be dropped before calling into a
    /// [`ChunkCache`](super::ChunkCache).
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Copy of the cleartext content.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite `bytes` at `offset`, growing the buffer (zero-filled) if needed.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
        self.dirty.store(true, Ordering::Release);
    }

    /// Take the buffer out of the chunk, leaving it empty.
    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }
}

/// Errors a [`ChunkLoader`] may report.
#[derive(Error, Debug)]
pub enum ChunkLoadError {
    #[error("IO error loading chunk: {0}")]
    Io(#[from] io::Error),

    /// **[INTEGRITY VIOLATION]** The chunk ciphertext did not match its tag.
    #[error("[INTEGRITY VIOLATION] Unauthentic ciphertext in chunk {chunk}")]
    Unauthentic { chunk: u64 },
}

/// Decrypts chunk `chunk` of one file.
pub trait ChunkLoader: Send + Sync {
    fn load(&self, chunk: u64) -> Result<Chunk, ChunkLoadError>;
}

/// Encrypts and persists chunk `chunk` of one file.
///
/// Implementations may skip clean chunks.
pub trait ChunkSaver: Send + Sync {
    fn save(&self, chunk: u64, data: &Chunk) -> io::Result<()>;
}

/// Takes back cleartext buffers for reuse.
pub trait BufferPool: Send + Sync {
    fn recycle(&self, buffer: Vec<u8>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_and_dirty_constructors() {
        assert!(!Chunk::clean(vec![1, 2, 3]).is_dirty());
        assert!(Chunk::dirty(vec![1, 2, 3]).is_dirty());
    }

    #[test]
    fn test_write_at_grows_and_marks_dirty() {
        let chunk = Chunk::clean(b"abc".to_vec());
        chunk.write_at(5, b"xy");
        assert!(chunk.is_dirty());
        assert_eq!(chunk.to_vec(), b"abc\0\0xy");
        assert_eq!(chunk.len(), 7);

        chunk.write_at(1, b"Z");
        assert_eq!(chunk.to_vec(), b"aZc\0\0xy");
    }

    #[test]
    fn test_mark_clean() {
        let chunk = Chunk::dirty(Vec::new());
        chunk.mark_clean();
        assert!(!chunk.is_dirty());
        chunk.mark_dirty();
        assert!(chunk.is_dirty());
    }

    #[test]
    fn test_take_buffer_leaves_chunk_empty() {
        let chunk = Chunk::clean(vec![7; 16]);
        let buffer = chunk.take_buffer();
        assert_eq!(buffer.len(), 16);
        assert!(chunk.is_empty());
    }
}
