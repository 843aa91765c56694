//! Encrypted backup of a directory's id inside its ciphertext directory.
//!
//! When a directory is created, its id is written to the sidecar file named by
//! [`CiphertextNameConfig::dir_id_file`] (`dirid.c9r` by default) in the new
//! ciphertext directory, encrypted like any file content. The file is never
//! overwritten: a second backup attempt for the same directory fails.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::CiphertextNameConfig;
use crate::crypto::{CryptoError, EncryptingWriter, FileCryptor};
use crate::vault::path::{CiphertextDirectory, DirId};

#[derive(Error, Debug)]
pub enum DirIdBackupError {
    /// A backup already exists. Directory ids are never overwritten.
    #[error("Directory id backup already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("IO error on directory id backup {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Directory id is not ASCII: {dir_id:?}")]
    NonAsciiDirId { dir_id: String },

    #[error("Cannot decrypt directory id backup {path}: {source}")]
    Crypto {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },
}

impl DirIdBackupError {
    fn io(path: &Path, source: io::Error) -> Self {
        DirIdBackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes directory id backups for one filesystem.
#[derive(Clone)]
pub struct DirectoryIdBackup {
    cryptor: Arc<FileCryptor>,
    names: Arc<CiphertextNameConfig>,
}

impl std::fmt::Debug for DirectoryIdBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryIdBackup")
            .field("dir_id_file", &self.names.dir_id_file)
            .finish_non_exhaustive()
    }
}

impl DirectoryIdBackup {
    pub fn new(cryptor: Arc<FileCryptor>, names: Arc<CiphertextNameConfig>) -> Self {
        Self { cryptor, names }
    }

    /// Path of the backup file inside `ciphertext_dir`.
    pub fn backup_path(&self, ciphertext_dir: &Path) -> PathBuf {
        ciphertext_dir.join(&self.names.dir_id_file)
    }

    /// Write the encrypted id of `dir` into its ciphertext directory.
    ///
    /// Fails with [`DirIdBackupError::AlreadyExists`] if a backup is present.
    /// A failure mid-write leaves a truncated file behind; the caller treats
    /// the directory creation as incomplete.
    #[instrument(level = "debug", skip(self), fields(dir_id = %dir.dir_id))]
    pub fn execute(&self, dir: &CiphertextDirectory) -> Result<(), DirIdBackupError> {
        write_backup(&self.cryptor, &self.backup_path(dir.path()), &dir.dir_id)
    }

    /// Decrypt the backup stored in `ciphertext_dir`.
    pub fn read(&self, ciphertext_dir: &Path) -> Result<DirId, DirIdBackupError> {
        read_backup(&self.cryptor, &self.backup_path(ciphertext_dir))
    }
}

/// One-off backup of `dir` without a long-lived [`DirectoryIdBackup`].
///
/// `names` must be the configuration the filesystem was opened with.
pub fn backup_manually(
    cryptor: &FileCryptor,
    names: &CiphertextNameConfig,
    dir: &CiphertextDirectory,
) -> Result<(), DirIdBackupError> {
    write_backup(cryptor, &dir.path().join(&names.dir_id_file), &dir.dir_id)
}

/// Decrypt the directory id backed up in `ciphertext_dir`.
pub fn read_dir_id_backup(
    cryptor: &FileCryptor,
    names: &CiphertextNameConfig,
    ciphertext_dir: &Path,
) -> Result<DirId, DirIdBackupError> {
    read_backup(cryptor, &ciphertext_dir.join(&names.dir_id_file))
}

fn write_backup(cryptor: &FileCryptor, path: &Path, dir_id: &DirId) -> Result<(), DirIdBackupError> {
    if !dir_id.as_str().is_ascii() {
        return Err(DirIdBackupError::NonAsciiDirId {
            dir_id: dir_id.as_str().to_string(),
        });
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                warn!(path = %path.display(), "Refusing to overwrite directory id backup");
                DirIdBackupError::AlreadyExists {
                    path: path.to_path_buf(),
                }
            } else {
                DirIdBackupError::io(path, source)
            }
        })?;

    let mut writer = EncryptingWriter::new(file, cryptor);
    writer
        .write_all(dir_id.as_str().as_bytes())
        .map_err(|source| DirIdBackupError::io(path, source))?;
    writer
        .finish()
        .and_then(|file| file.sync_all())
        .map_err(|source| DirIdBackupError::io(path, source))?;

    debug!(path = %path.display(), "Wrote directory id backup");
    Ok(())
}

fn read_backup(cryptor: &FileCryptor, path: &Path) -> Result<DirId, DirIdBackupError> {
    let encrypted = fs::read(path).map_err(|source| DirIdBackupError::io(path, source))?;
    let cleartext = cryptor
        .decrypt_file(&encrypted)
        .map_err(|source| DirIdBackupError::Crypto {
            path: path.to_path_buf(),
            source,
        })?;
    if !cleartext.is_ascii() {
        let source = io::Error::new(io::ErrorKind::InvalidData, "directory id backup is not ASCII");
        return Err(DirIdBackupError::io(path, source));
    }
    let dir_id = String::from_utf8(cleartext)
        .map_err(|err| DirIdBackupError::io(path, io::Error::new(io::ErrorKind::InvalidData, err)))?;
    Ok(DirId::from_raw(dir_id))
}
