//! Cleartext directory listings over ciphertext directories.
//!
//! A [`DirectoryStreamFactory`] belongs to one open filesystem. Every listing
//! it hands out is tracked in a registry as a single record that owns the
//! ciphertext-side stream; the cleartext-facing [`CryptoDirectoryStream`]
//! refers to that record and removes it from the registry when it is closed
//! or dropped. Closing the factory closes every record still registered.
//!
//! # Locking
//!
//! The closed flag is atomic, so rejecting work on a closed factory needs no
//! lock. Stream creation, deregistration and factory close serialize on the
//! registry mutex. A record's own mutex may be taken while the registry is
//! locked, never the other way round.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::config::CiphertextNameConfig;
use crate::vault::path::{CiphertextDirectory, DirId, VaultPath};

/// Errors returned by [`DirectoryStreamFactory`].
#[derive(Error, Debug)]
pub enum DirectoryStreamError {
    /// The factory (and the filesystem owning it) has been closed.
    #[error("File system is closed")]
    FileSystemClosed,

    #[error("Cannot resolve ciphertext directory for {path}: {source}")]
    Mapping {
        path: VaultPath,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open ciphertext directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// One or more streams failed to close during factory shutdown.
    ///
    /// Every stream was still closed and removed from the registry.
    #[error("Failed to close {} directory stream(s)", .failures.len())]
    CloseFailed { failures: Vec<io::Error> },
}

/// Resolves a cleartext directory to its ciphertext location.
pub trait PathMapper: Send + Sync {
    fn ciphertext_dir(&self, cleartext_dir: &VaultPath) -> io::Result<CiphertextDirectory>;
}

/// Decrypts ciphertext entry names.
pub trait NameTranslator: Send + Sync {
    /// Cleartext name of the entry at `ciphertext_path` inside the directory
    /// `dir_id`, or `None` if the entry should not be listed.
    fn cleartext_name(&self, dir_id: &DirId, ciphertext_path: &Path) -> io::Result<Option<String>>;
}

/// A raw listing of a ciphertext directory.
pub trait CiphertextDirStream: Iterator<Item = io::Result<PathBuf>> + Send {
    /// Release the underlying handle. Further iteration yields nothing.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens raw listings of ciphertext directories.
pub trait CiphertextDirOpener: Send + Sync {
    fn open(&self, dir: &Path) -> io::Result<Box<dyn CiphertextDirStream>>;
}

/// [`CiphertextDirOpener`] backed by [`std::fs::read_dir`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadDirOpener;

impl CiphertextDirOpener for ReadDirOpener {
    fn open(&self, dir: &Path) -> io::Result<Box<dyn CiphertextDirStream>> {
        Ok(Box::new(ReadDirStream {
            inner: Some(fs::read_dir(dir)?),
        }))
    }
}

/// Listing produced by [`ReadDirOpener`].
#[derive(Debug)]
pub struct ReadDirStream {
    inner: Option<ReadDir>,
}

impl Iterator for ReadDirStream {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.as_mut()?.next()?;
        Some(entry.map(|e| e.path()))
    }
}

impl CiphertextDirStream for ReadDirStream {
    fn close(&mut self) -> io::Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// Drops entries that are not encrypted content (e.g. `dirid.c9r`).
struct ContentFilteredStream {
    inner: Box<dyn CiphertextDirStream>,
    names: Arc<CiphertextNameConfig>,
}

impl Iterator for ContentFilteredStream {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(path) if !self.names.matches_encrypted_content_pattern(&path) => {
                    trace!(path = %path.display(), "Skipping non-content entry");
                }
                item => return Some(item),
            }
        }
    }
}

impl CiphertextDirStream for ContentFilteredStream {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Registry record pairing a listing with the ciphertext stream it reads.
struct OpenDirectoryStream {
    id: u64,
    cleartext_dir: VaultPath,
    dir_id: DirId,
    ciphertext: Mutex<Option<ContentFilteredStream>>,
}

impl OpenDirectoryStream {
    fn next_ciphertext(&self) -> Option<io::Result<PathBuf>> {
        self.ciphertext.lock().as_mut()?.next()
    }

    /// Idempotent; only the first call reaches the ciphertext stream.
    fn close(&self) -> io::Result<()> {
        let stream = self.ciphertext.lock().take();
        match stream {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.ciphertext.lock().is_none()
    }
}

type EntryFilter = Box<dyn Fn(&VaultPath) -> bool + Send>;
type CloseCallback = Box<dyn FnOnce(u64) + Send>;

/// Cleartext view of one directory.
///
/// Yields the cleartext paths of entries accepted by both the content filter
/// and the caller's filter. Entries whose names cannot be translated are
/// skipped. Dropping the stream closes it.
pub struct CryptoDirectoryStream {
    record: Arc<OpenDirectoryStream>,
    translator: Arc<dyn NameTranslator>,
    filter: EntryFilter,
    on_close: Option<CloseCallback>,
}

impl fmt::Debug for CryptoDirectoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoDirectoryStream")
            .field("id", &self.record.id)
            .field("cleartext_dir", &self.record.cleartext_dir)
            .field("dir_id", &self.record.dir_id)
            .finish_non_exhaustive()
    }
}

impl CryptoDirectoryStream {
    /// The cleartext directory being listed.
    pub fn directory(&self) -> &VaultPath {
        &self.record.cleartext_dir
    }

    pub fn dir_id(&self) -> &DirId {
        &self.record.dir_id
    }

    /// Whether the stream was closed, by its owner or by factory shutdown.
    pub fn is_closed(&self) -> bool {
        self.record.is_closed()
    }

    /// Close the ciphertext stream and deregister from the factory.
    ///
    /// The stream is deregistered even if closing the ciphertext side fails.
    pub fn close(&mut self) -> io::Result<()> {
        let result = self.record.close();
        if let Some(on_close) = self.on_close.take() {
            on_close(self.record.id);
        }
        result
    }
}

impl Iterator for CryptoDirectoryStream {
    type Item = io::Result<VaultPath>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ciphertext_path = match self.record.next_ciphertext()? {
                Ok(path) => path,
                Err(err) => return Some(Err(err)),
            };
            match self
                .translator
                .cleartext_name(&self.record.dir_id, &ciphertext_path)
            {
                Ok(Some(name)) => {
                    let cleartext = self.record.cleartext_dir.join(name);
                    if (self.filter)(&cleartext) {
                        return Some(Ok(cleartext));
                    }
                }
                Ok(None) => {
                    trace!(path = %ciphertext_path.display(), "Entry has no cleartext name");
                }
                Err(err) => {
                    warn!(
                        path = %ciphertext_path.display(),
                        error = %err,
                        "Skipping entry with undecryptable name"
                    );
                }
            }
        }
    }
}

impl Drop for CryptoDirectoryStream {
    fn drop(&mut self) {
        if self.on_close.is_none() {
            return;
        }
        if let Err(err) = self.close() {
            warn!(
                dir = %self.record.cleartext_dir,
                error = %err,
                "Failed to close dropped directory stream"
            );
        }
    }
}

struct FactoryInner {
    closed: AtomicBool,
    streams: Mutex<HashMap<u64, Arc<OpenDirectoryStream>>>,
    next_id: AtomicU64,
}

impl FactoryInner {
    fn deregister(&self, id: u64) {
        if self.streams.lock().remove(&id).is_some() {
            trace!(id, "Deregistered directory stream");
        }
    }
}

/// Creates directory listings for one filesystem and closes them all on
/// shutdown.
pub struct DirectoryStreamFactory {
    inner: Arc<FactoryInner>,
    mapper: Arc<dyn PathMapper>,
    opener: Arc<dyn CiphertextDirOpener>,
    translator: Arc<dyn NameTranslator>,
    names: Arc<CiphertextNameConfig>,
}

impl fmt::Debug for DirectoryStreamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryStreamFactory")
            .field("closed", &self.is_closed())
            .field("open_streams", &self.open_stream_count())
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl DirectoryStreamFactory {
    pub fn new(
        mapper: Arc<dyn PathMapper>,
        opener: Arc<dyn CiphertextDirOpener>,
        translator: Arc<dyn NameTranslator>,
        names: Arc<CiphertextNameConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                closed: AtomicBool::new(false),
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            mapper,
            opener,
            translator,
            names,
        }
    }

    /// Factory listing ciphertext directories on the local filesystem.
    pub fn with_read_dir(
        mapper: Arc<dyn PathMapper>,
        translator: Arc<dyn NameTranslator>,
        names: Arc<CiphertextNameConfig>,
    ) -> Self {
        Self::new(mapper, Arc::new(ReadDirOpener), translator, names)
    }

    /// Whether `path` names an encrypted content entry.
    pub fn matches_encrypted_content_pattern(&self, path: &Path) -> bool {
        self.names.matches_encrypted_content_pattern(path)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of registered (not yet closed) streams.
    pub fn open_stream_count(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Open a cleartext listing of `cleartext_dir`.
    ///
    /// `filter` is applied to the cleartext path of each entry after the
    /// ciphertext-level content filter.
    #[instrument(level = "debug", skip(self, filter), fields(dir = %cleartext_dir))]
    pub fn new_directory_stream<F>(
        &self,
        cleartext_dir: &VaultPath,
        filter: F,
    ) -> Result<CryptoDirectoryStream, DirectoryStreamError>
    where
        F: Fn(&VaultPath) -> bool + Send + 'static,
    {
        if self.is_closed() {
            return Err(DirectoryStreamError::FileSystemClosed);
        }

        let mut streams = self.inner.streams.lock();
        // close() may have run while we waited for the lock.
        if self.is_closed() {
            return Err(DirectoryStreamError::FileSystemClosed);
        }

        let ciphertext_dir = self.mapper.ciphertext_dir(cleartext_dir).map_err(|source| {
            DirectoryStreamError::Mapping {
                path: cleartext_dir.clone(),
                source,
            }
        })?;
        let raw = self.opener.open(ciphertext_dir.path()).map_err(|source| {
            DirectoryStreamError::Io {
                path: ciphertext_dir.path().to_path_buf(),
                source,
            }
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(OpenDirectoryStream {
            id,
            cleartext_dir: cleartext_dir.clone(),
            dir_id: ciphertext_dir.dir_id.clone(),
            ciphertext: Mutex::new(Some(ContentFilteredStream {
                inner: raw,
                names: Arc::clone(&self.names),
            })),
        });
        streams.insert(id, Arc::clone(&record));
        debug!(id, dir_id = %ciphertext_dir.dir_id, "Opened directory stream");

        let factory: Weak<FactoryInner> = Arc::downgrade(&self.inner);
        Ok(CryptoDirectoryStream {
            record,
            translator: Arc::clone(&self.translator),
            filter: Box::new(filter),
            on_close: Some(Box::new(move |id| {
                if let Some(factory) = factory.upgrade() {
                    factory.deregister(id);
                }
            })),
        })
    }

    /// Mark the factory closed and close every registered stream.
    ///
    /// All streams are attempted; failures are collected into
    /// [`DirectoryStreamError::CloseFailed`]. The registry is empty afterwards
    /// either way. Calling this again is a no-op.
    #[instrument(level = "debug", skip(self))]
    pub fn close(&self) -> Result<(), DirectoryStreamError> {
        self.inner.closed.store(true, Ordering::Release);

        let mut streams = self.inner.streams.lock();
        let mut failures = Vec::new();
        for (id, record) in streams.drain() {
            if let Err(err) = record.close() {
                warn!(id, dir = %record.cleartext_dir, error = %err, "Failed to close directory stream");
                failures.push(err);
            }
        }
        drop(streams);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DirectoryStreamError::CloseFailed { failures })
        }
    }
}

impl Drop for DirectoryStreamFactory {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "Directory streams failed to close on drop");
        }
    }
}
