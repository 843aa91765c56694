//! Filesystem configuration.
//!
//! The ciphertext naming constants must match the name-encoding subsystem
//! byte for byte, so they live in one [`CiphertextNameConfig`] value that is
//! shared (`Arc`) by every component that inspects or produces ciphertext
//! names.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest valid encrypted entry name, suffix included.
pub const MIN_CIPHER_NAME_LENGTH: usize = 26;

/// Suffix of regular encrypted entries.
pub const CRYPTOMATOR_FILE_SUFFIX: &str = ".c9r";

/// Suffix of entries whose encrypted name was too long and got shortened.
pub const DEFLATED_FILE_SUFFIX: &str = ".c9s";

/// Name of the encrypted directory id backup inside each ciphertext directory.
pub const DIR_ID_FILE: &str = "dirid.c9r";

/// Number of decrypted chunks kept per open file.
pub const MAX_CACHED_CLEARTEXT_CHUNKS: usize = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Ciphertext filename conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiphertextNameConfig {
    pub min_name_length: usize,
    pub file_suffix: String,
    pub deflated_suffix: String,
    pub dir_id_file: String,
}

impl Default for CiphertextNameConfig {
    fn default() -> Self {
        Self {
            min_name_length: MIN_CIPHER_NAME_LENGTH,
            file_suffix: CRYPTOMATOR_FILE_SUFFIX.to_string(),
            deflated_suffix: DEFLATED_FILE_SUFFIX.to_string(),
            dir_id_file: DIR_ID_FILE.to_string(),
        }
    }
}

impl CiphertextNameConfig {
    /// Whether a ciphertext directory entry represents cleartext content.
    ///
    /// Both conditions are mandatory: the name must be at least
    /// `min_name_length` long and end in one of the two content suffixes.
    /// Bookkeeping files such as `dirid.c9r` and temp files fail this check.
    pub fn matches_encrypted_content_pattern(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.len() >= self.min_name_length
            && (name.ends_with(&self.file_suffix) || name.ends_with(&self.deflated_suffix))
    }
}

/// Chunk cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkCacheConfig {
    pub max_cached_chunks: usize,
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self {
            max_cached_chunks: MAX_CACHED_CLEARTEXT_CHUNKS,
        }
    }
}

/// Top-level configuration of one open filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoFsConfig {
    pub ciphertext_names: CiphertextNameConfig,
    pub chunk_cache: ChunkCacheConfig,
}

impl CryptoFsConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_cache.max_cached_chunks == 0 {
            return Err(ConfigError::Invalid {
                reason: "chunk_cache.max_cached_chunks must be at least 1".to_string(),
            });
        }
        let names = &self.ciphertext_names;
        if names.file_suffix.is_empty() || names.deflated_suffix.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "ciphertext name suffixes must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
