//! Content and metadata virtualization for Cryptomator-style encrypted filesystems.
//!
//! This crate holds the pieces that sit between a cleartext filesystem view and
//! its authenticated ciphertext storage:
//!
//! - [`fs::ChunkCache`]: bounded write-back cache of decrypted file chunks
//! - [`fs::DirectoryStreamFactory`]: cleartext directory listings over ciphertext
//!   directories, with coordinated shutdown of every open listing
//! - [`fs::DirectoryIdBackup`]: one-shot encrypted backup of a new directory's id

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod stats;
pub mod vault;

pub use config::{CiphertextNameConfig, CryptoFsConfig};
pub use crypto::FileCryptor;
pub use fs::{ChunkCache, DirectoryIdBackup, DirectoryStreamFactory};
pub use stats::CryptoFsStats;
pub use vault::{CiphertextDirectory, DirId, VaultPath};
