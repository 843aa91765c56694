//! Vault-level identifiers shared by the filesystem components

pub mod path;

pub use path::{CiphertextDirectory, DirId, VaultPath};
