//! Filesystem-facing components: chunk caching, directory listings and
//! directory id backups.

pub mod chunk;
pub mod chunk_cache;
pub mod chunk_io;
pub mod dir_id_backup;
pub mod dir_stream;

// Re-export commonly used types
pub use chunk::{BufferPool, Chunk, ChunkLoadError, ChunkLoader, ChunkSaver, SharedChunk};
pub use chunk_cache::{ChunkCache, ChunkCacheError};
pub use chunk_io::CiphertextChunkIo;
pub use dir_id_backup::{DirIdBackupError, DirectoryIdBackup, backup_manually, read_dir_id_backup};
pub use dir_stream::{
    CiphertextDirOpener, CiphertextDirStream, CryptoDirectoryStream, DirectoryStreamError,
    DirectoryStreamFactory, NameTranslator, PathMapper, ReadDirOpener,
};
