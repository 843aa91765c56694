//! Chunk loader and saver over one encrypted file on disk.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use super::chunk::{Chunk, ChunkLoadError, ChunkLoader, ChunkSaver};
use crate::crypto::{
    CHUNK_ENCRYPTED_SIZE, CHUNK_PLAINTEXT_SIZE, CryptoError, FileCryptor, FileHeader, HEADER_SIZE,
    chunk_to_encrypted_offset,
};
use crate::stats::CryptoFsStats;

/// Reads and writes individual chunks of one encrypted file.
///
/// The header is decrypted once when the file is opened (or written once
/// when it is created) and reused for every chunk.
pub struct CiphertextChunkIo {
    file: Mutex<File>,
    path: PathBuf,
    cryptor: Arc<FileCryptor>,
    header: FileHeader,
    stats: Arc<CryptoFsStats>,
}

impl std::fmt::Debug for CiphertextChunkIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextChunkIo")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl CiphertextChunkIo {
    /// Create a new encrypted file at `path` with a fresh header.
    ///
    /// Fails if the file already exists.
    #[instrument(level = "debug", skip(cryptor, stats), fields(path = %path.display()))]
    pub fn create(
        path: &Path,
        cryptor: Arc<FileCryptor>,
        stats: Arc<CryptoFsStats>,
    ) -> Result<Self, io::Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let header = cryptor.create_header();
        let encrypted_header = cryptor.encrypt_header(&header).map_err(io::Error::other)?;
        file.write_all(&encrypted_header)?;
        debug!("Created encrypted file");

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            cryptor,
            header,
            stats,
        })
    }

    /// Open an existing encrypted file and decrypt its header.
    #[instrument(level = "debug", skip(cryptor, stats), fields(path = %path.display()))]
    pub fn open(
        path: &Path,
        cryptor: Arc<FileCryptor>,
        stats: Arc<CryptoFsStats>,
    ) -> Result<Self, ChunkLoadError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut encrypted_header = [0u8; HEADER_SIZE];
        file.read_exact(&mut encrypted_header)?;
        let header = cryptor
            .decrypt_header(&encrypted_header)
            .map_err(|err| map_crypto_error(err, 0))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            cryptor,
            header,
            stats,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_crypto_error(err: CryptoError, chunk: u64) -> ChunkLoadError {
    if err.is_integrity_violation() {
        ChunkLoadError::Unauthentic { chunk }
    } else {
        ChunkLoadError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl ChunkLoader for CiphertextChunkIo {
    fn load(&self, chunk: u64) -> Result<Chunk, ChunkLoadError> {
        let mut ciphertext = vec![0u8; CHUNK_ENCRYPTED_SIZE];
        let read = {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(chunk_to_encrypted_offset(chunk)))?;
            read_up_to(&mut file, &mut ciphertext)?
        };

        if read == 0 {
            // Past the end of the file: the chunk does not exist yet.
            trace!(chunk, "Loaded empty chunk beyond EOF");
            return Ok(Chunk::clean(Vec::with_capacity(CHUNK_PLAINTEXT_SIZE)));
        }

        let cleartext = self
            .cryptor
            .decrypt_chunk(&ciphertext[..read], chunk, &self.header)
            .map_err(|err| map_crypto_error(err, chunk))?;
        self.stats.record_chunk_loaded();
        Ok(Chunk::clean(cleartext))
    }
}

impl ChunkSaver for CiphertextChunkIo {
    fn save(&self, chunk: u64, data: &Chunk) -> io::Result<()> {
        if !data.is_dirty() {
            return Ok(());
        }

        let sealed = {
            let cleartext = data.data();
            self.cryptor
                .encrypt_chunk(&cleartext, chunk, &self.header)
                .map_err(io::Error::other)?
        };
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(chunk_to_encrypted_offset(chunk)))?;
            file.write_all(&sealed)?;
        }
        data.mark_clean();
        self.stats.record_chunk_saved();
        trace!(chunk, size = sealed.len(), "Saved chunk");
        Ok(())
    }
}
