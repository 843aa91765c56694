//! Type-safe identifiers for cleartext and ciphertext locations.
//!
//! - `DirId`: opaque directory identifier, persisted in `dirid.c9r` backups
//! - `VaultPath`: cleartext path as the user sees it (e.g. "/Documents/a.txt")
//! - `CiphertextDirectory`: on-disk location of one cleartext directory

use std::fmt;
use std::path::{Path, PathBuf};

use relative_path::RelativePathBuf;

/// Opaque directory identifier.
///
/// The root directory has the empty id; every other directory gets a UUID
/// when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirId(String);

impl DirId {
    /// The root directory (empty string ID).
    #[inline]
    pub fn root() -> Self {
        DirId(String::new())
    }

    /// Wrap a raw id string, e.g. one read back from a `dirid.c9r` file.
    #[inline]
    pub fn from_raw(id: impl Into<String>) -> Self {
        DirId(id.into())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DirId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Cleartext path inside the virtual filesystem.
///
/// Always `/`-separated regardless of the host OS. Leading slashes are
/// stripped, so `"/a/b"` and `"a/b"` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultPath(RelativePathBuf);

impl VaultPath {
    #[inline]
    pub fn root() -> Self {
        VaultPath(RelativePathBuf::new())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        VaultPath(RelativePathBuf::from(path.as_ref().trim_start_matches('/')))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Append a single name to this path.
    pub fn join(&self, name: impl AsRef<str>) -> Self {
        VaultPath(self.0.join(name.as_ref()))
    }

    /// Returns `None` for the root path.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }
}

impl AsRef<str> for VaultPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VaultPath {
    fn from(s: &str) -> Self {
        VaultPath::new(s)
    }
}

impl From<String> for VaultPath {
    fn from(s: String) -> Self {
        VaultPath::new(s)
    }
}

/// The ciphertext location backing one cleartext directory.
///
/// Produced by the path-mapping layer and never modified afterwards. `path`
/// is the directory holding the encrypted entries; `dir_id` is the identifier
/// used as associated data when encrypting names in that directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextDirectory {
    pub path: PathBuf,
    pub dir_id: DirId,
}

impl CiphertextDirectory {
    pub fn new(path: impl Into<PathBuf>, dir_id: DirId) -> Self {
        Self {
            path: path.into(),
            dir_id,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn dir_id(&self) -> &DirId {
        &self.dir_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_id_root() {
        let root = DirId::root();
        assert!(root.is_root());
        assert_eq!(root.as_str(), "");
        assert_eq!(root.to_string(), "<root>");
    }

    #[test]
    fn test_dir_id_from_raw() {
        let id = DirId::from_raw("550e8400-e29b-41d4-a716-446655440000");
        assert!(!id.is_root());
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_vault_path_normalization() {
        assert_eq!(VaultPath::new("/Documents/a.txt"), VaultPath::new("Documents/a.txt"));
        assert_eq!(VaultPath::new("/").as_str(), "");
        assert!(VaultPath::new("/").is_root());
    }

    #[test]
    fn test_vault_path_join() {
        let file = VaultPath::root().join("Documents").join("a.txt");
        assert_eq!(file.as_str(), "Documents/a.txt");
        assert_eq!(file.file_name(), Some("a.txt"));
        assert!(VaultPath::root().file_name().is_none());
    }

    #[test]
    fn test_vault_path_display() {
        assert_eq!(VaultPath::root().to_string(), "/");
        assert_eq!(VaultPath::new("Documents/a.txt").to_string(), "/Documents/a.txt");
    }

    #[test]
    fn test_ciphertext_directory_accessors() {
        let dir = CiphertextDirectory::new("/vault/d/AB/CDEF", DirId::from_raw("id-1"));
        assert_eq!(dir.path(), Path::new("/vault/d/AB/CDEF"));
        assert_eq!(dir.dir_id().as_str(), "id-1");
    }
}
