//! AES-GCM file content encryption in the Cryptomator v8 format.
//!
//! An encrypted file is a 68-byte header followed by content chunks:
//! - **Header**: 12-byte nonce + AES-GCM(0xFF * 8 || 32-byte content key) + 16-byte tag
//! - **Chunk n**: 12-byte nonce + AES-GCM(≤32 KiB cleartext) + 16-byte tag, with
//!   `n` (8 bytes BE) || header nonce as associated data
//!
//! The header is sealed with the filesystem's master AES key; chunks are
//! sealed with the per-file content key from the header.

mod writer;

use std::fmt;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::{trace, warn};
use zeroize::Zeroizing;

pub use writer::EncryptingWriter;

/// Size of the file header in bytes (nonce + encrypted payload + tag).
pub const HEADER_SIZE: usize = 68;

/// Size of the header nonce in bytes.
pub const HEADER_NONCE_SIZE: usize = 12;

/// Size of the chunk nonce in bytes.
pub const CHUNK_NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Maximum cleartext size per chunk (32 KiB).
pub const CHUNK_PLAINTEXT_SIZE: usize = 32 * 1024;

/// Overhead per chunk (nonce + tag).
pub const CHUNK_OVERHEAD: usize = CHUNK_NONCE_SIZE + TAG_SIZE;

/// Maximum encrypted chunk size (nonce + ciphertext + tag).
pub const CHUNK_ENCRYPTED_SIZE: usize = CHUNK_PLAINTEXT_SIZE + CHUNK_OVERHEAD;

const HEADER_RESERVED: [u8; 8] = [0xFF; 8];

/// Offset of chunk `chunk_number` within an encrypted file.
#[inline]
pub fn chunk_to_encrypted_offset(chunk_number: u64) -> u64 {
    HEADER_SIZE as u64 + chunk_number * CHUNK_ENCRYPTED_SIZE as u64
}

/// Errors that can occur during file content encryption and decryption.
///
/// Variants marked `[INTEGRITY VIOLATION]` mean the ciphertext failed its
/// authentication check: it was tampered with, corrupted, or sealed with
/// another key.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// **[INTEGRITY VIOLATION]** The header tag did not verify.
    #[error(
        "[INTEGRITY VIOLATION] Header authentication failed - possible tampering or wrong key"
    )]
    HeaderAuthentication,

    /// **[INTEGRITY VIOLATION]** A content chunk's tag did not verify.
    #[error(
        "[INTEGRITY VIOLATION] Authentication of chunk {chunk} failed - possible tampering or wrong key"
    )]
    ChunkAuthentication { chunk: u64 },

    #[error("Invalid file header: {reason}")]
    InvalidHeader { reason: String },

    #[error("Incomplete chunk {chunk}: expected at least 28 bytes, got {actual_size}")]
    IncompleteChunk { chunk: u64, actual_size: usize },

    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },
}

impl CryptoError {
    /// Whether this error reports ciphertext that failed authentication.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CryptoError::HeaderAuthentication
                | CryptoError::ChunkAuthentication { .. }
                | CryptoError::IncompleteChunk { .. }
        )
    }
}

/// Decrypted file header: header nonce plus the per-file content key.
///
/// The content key is zeroized on drop and redacted from `Debug` output.
pub struct FileHeader {
    nonce: [u8; HEADER_NONCE_SIZE],
    content_key: Zeroizing<[u8; 32]>,
}

impl FileHeader {
    #[inline]
    pub fn nonce(&self) -> &[u8; HEADER_NONCE_SIZE] {
        &self.nonce
    }

    fn chunk_aad(&self, chunk_number: u64) -> [u8; 8 + HEADER_NONCE_SIZE] {
        let mut aad = [0u8; 8 + HEADER_NONCE_SIZE];
        aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
        aad[8..].copy_from_slice(&self.nonce);
        aad
    }

    fn content_cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.content_key[..]))
    }
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts and decrypts file headers and content chunks.
///
/// Holds the filesystem's master AES key. Thread-safe; share it as
/// `Arc<FileCryptor>`.
pub struct FileCryptor {
    master_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for FileCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCryptor")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl FileCryptor {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            master_key: Zeroizing::new(master_key),
        }
    }

    /// Create a cryptor with a freshly generated random master key.
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut key[..]);
        Self { master_key: key }
    }

    fn header_cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.master_key[..]))
    }

    /// Create a new header with a random nonce and random content key.
    pub fn create_header(&self) -> FileHeader {
        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut content_key[..]);
        FileHeader { nonce, content_key }
    }

    /// Seal a header into its 68-byte on-disk form.
    pub fn encrypt_header(&self, header: &FileHeader) -> Result<Vec<u8>, CryptoError> {
        let mut payload = Zeroizing::new(Vec::with_capacity(40));
        payload.extend_from_slice(&HEADER_RESERVED);
        payload.extend_from_slice(&header.content_key[..]);

        let ciphertext = self
            .header_cipher()
            .encrypt(Nonce::from_slice(&header.nonce), payload.as_slice())
            .map_err(|e| CryptoError::Encryption {
                reason: e.to_string(),
            })?;

        let mut encrypted = Vec::with_capacity(HEADER_SIZE);
        encrypted.extend_from_slice(&header.nonce);
        encrypted.extend_from_slice(&ciphertext);
        Ok(encrypted)
    }

    /// Open a 68-byte encrypted header.
    pub fn decrypt_header(&self, encrypted: &[u8]) -> Result<FileHeader, CryptoError> {
        if encrypted.len() != HEADER_SIZE {
            return Err(CryptoError::InvalidHeader {
                reason: format!("expected {HEADER_SIZE} bytes, got {}", encrypted.len()),
            });
        }

        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        nonce.copy_from_slice(&encrypted[..HEADER_NONCE_SIZE]);

        let payload = Zeroizing::new(
            self.header_cipher()
                .decrypt(Nonce::from_slice(&nonce), &encrypted[HEADER_NONCE_SIZE..])
                .map_err(|_| {
                    warn!("Header decryption failed - authentication tag mismatch");
                    CryptoError::HeaderAuthentication
                })?,
        );

        if payload.len() != HEADER_RESERVED.len() + 32 {
            return Err(CryptoError::InvalidHeader {
                reason: format!("decrypted payload has {} bytes, expected 40", payload.len()),
            });
        }

        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(&payload[HEADER_RESERVED.len()..]);
        Ok(FileHeader { nonce, content_key })
    }

    /// Seal one cleartext chunk (at most [`CHUNK_PLAINTEXT_SIZE`] bytes).
    pub fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut chunk_nonce = [0u8; CHUNK_NONCE_SIZE];
        rand::rng().fill_bytes(&mut chunk_nonce);
        let aad = header.chunk_aad(chunk_number);

        let sealed = header
            .content_cipher()
            .encrypt(
                Nonce::from_slice(&chunk_nonce),
                Payload {
                    msg: cleartext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Encryption {
                reason: e.to_string(),
            })?;

        let mut encrypted = Vec::with_capacity(CHUNK_NONCE_SIZE + sealed.len());
        encrypted.extend_from_slice(&chunk_nonce);
        encrypted.extend_from_slice(&sealed);
        Ok(encrypted)
    }

    /// Open one encrypted chunk, verifying its tag and position.
    pub fn decrypt_chunk(
        &self,
        ciphertext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < CHUNK_OVERHEAD {
            warn!(
                chunk = chunk_number,
                actual_size = ciphertext.len(),
                "Incomplete chunk"
            );
            return Err(CryptoError::IncompleteChunk {
                chunk: chunk_number,
                actual_size: ciphertext.len(),
            });
        }

        let aad = header.chunk_aad(chunk_number);
        let cleartext = header
            .content_cipher()
            .decrypt(
                Nonce::from_slice(&ciphertext[..CHUNK_NONCE_SIZE]),
                Payload {
                    msg: &ciphertext[CHUNK_NONCE_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| {
                warn!(
                    chunk = chunk_number,
                    "Chunk decryption failed - authentication tag mismatch"
                );
                CryptoError::ChunkAuthentication {
                    chunk: chunk_number,
                }
            })?;

        trace!(
            chunk = chunk_number,
            decrypted_size = cleartext.len(),
            "Chunk decrypted"
        );
        Ok(cleartext)
    }

    /// Decrypt a complete encrypted file (header plus every chunk).
    pub fn decrypt_file(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < HEADER_SIZE {
            return Err(CryptoError::InvalidHeader {
                reason: format!(
                    "file too small: expected at least {HEADER_SIZE} bytes, got {}",
                    encrypted.len()
                ),
            });
        }
        let header = self.decrypt_header(&encrypted[..HEADER_SIZE])?;

        let mut cleartext = Vec::new();
        for (chunk_number, chunk) in (0u64..).zip(encrypted[HEADER_SIZE..].chunks(CHUNK_ENCRYPTED_SIZE)) {
            cleartext.extend_from_slice(&self.decrypt_chunk(chunk, chunk_number, &header)?);
        }
        Ok(cleartext)
    }
}
