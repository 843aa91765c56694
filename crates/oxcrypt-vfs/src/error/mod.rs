//! Error types for the crate
//!
//! Each module defines its own error enum next to the code that produces it;
//! this module gathers them in one place.

pub use crate::config::ConfigError;
pub use crate::crypto::CryptoError;
pub use crate::fs::chunk::ChunkLoadError;
pub use crate::fs::chunk_cache::ChunkCacheError;
pub use crate::fs::dir_id_backup::DirIdBackupError;
pub use crate::fs::dir_stream::DirectoryStreamError;
