//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use oxcrypt_vfs::fs::{
    BufferPool, CiphertextDirOpener, CiphertextDirStream, NameTranslator, PathMapper,
};
use oxcrypt_vfs::{CiphertextDirectory, DirId, FileCryptor, VaultPath};
use parking_lot::Mutex;

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic cryptor so failures are reproducible.
pub fn create_test_cryptor() -> Arc<FileCryptor> {
    Arc::new(FileCryptor::new([0x01; 32]))
}

/// A ciphertext-looking entry name: `stem` padded with `_` to 24 chars plus `suffix`.
pub fn ciphertext_name(stem: &str, suffix: &str) -> String {
    format!("{stem:_<24}{suffix}")
}

/// Maps every cleartext directory to the same ciphertext directory.
pub struct FixedMapper(pub CiphertextDirectory);

impl PathMapper for FixedMapper {
    fn ciphertext_dir(&self, _: &VaultPath) -> io::Result<CiphertextDirectory> {
        Ok(self.0.clone())
    }
}

/// "Decrypts" a name by stripping its ciphertext suffix and padding.
pub struct StripSuffix;

impl NameTranslator for StripSuffix {
    fn cleartext_name(&self, _: &DirId, path: &Path) -> io::Result<Option<String>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not UTF-8"))?;
        let stem = name.trim_end_matches(".c9r").trim_end_matches(".c9s");
        Ok(Some(stem.trim_end_matches('_').to_string()))
    }
}

/// In-memory listing whose `close` can be scripted to fail.
pub struct ScriptedStream {
    entries: std::vec::IntoIter<PathBuf>,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

impl Iterator for ScriptedStream {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(Ok)
    }
}

impl CiphertextDirStream for ScriptedStream {
    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            Err(io::Error::other("scripted close failure"))
        } else {
            Ok(())
        }
    }
}

/// Opens [`ScriptedStream`]s over a fixed entry list. The n-th opened stream
/// (0-based) fails to close if `n` is in `fail_close`.
#[derive(Default)]
pub struct ScriptedOpener {
    pub entries: Vec<PathBuf>,
    pub fail_close: Vec<usize>,
    pub opened: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl CiphertextDirOpener for ScriptedOpener {
    fn open(&self, dir: &Path) -> io::Result<Box<dyn CiphertextDirStream>> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let entries: Vec<PathBuf> = self.entries.iter().map(|e| dir.join(e)).collect();
        Ok(Box::new(ScriptedStream {
            entries: entries.into_iter(),
            fail_close: self.fail_close.contains(&n),
            closes: Arc::clone(&self.closes),
        }))
    }
}

/// Buffer pool that keeps what it is given.
#[derive(Default)]
pub struct CollectingPool {
    pub buffers: Mutex<Vec<Vec<u8>>>,
}

impl CollectingPool {
    pub fn count(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl BufferPool for CollectingPool {
    fn recycle(&self, buffer: Vec<u8>) {
        self.buffers.lock().push(buffer);
    }
}
