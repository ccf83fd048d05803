//! File metadata as seen by storage backends and the content hasher.

use crate::hash::ContentHash;
use std::{ops::Deref, path::PathBuf};
use time::UtcDateTime;

/// File metadata returned by storage backends.
///
/// This represents information about a file in storage, used for listing
/// operations and change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Relative path from storage root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp, if the backend knows it
    pub modified: Option<UtcDateTime>,
}
impl FileMeta {
    pub fn with_hash(self, hash: ContentHash) -> FileInfo<Hashed> {
        FileInfo { meta: self, hash }
    }
}

mod sealed {
    pub trait Sealed {}
}
pub trait HashState: sealed::Sealed {
    type Hash;
}

/// Listed by a backend, contents not read yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered;
impl sealed::Sealed for Discovered {}
impl HashState for Discovered {
    type Hash = ();
}

/// Contents read and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashed;
impl sealed::Sealed for Hashed {}
impl HashState for Hashed {
    type Hash = ContentHash;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo<S: HashState = Discovered> {
    meta: FileMeta,
    pub hash: S::Hash,
}
impl<S: HashState> FileInfo<S> {
    // Explicit version of self.as_deref()
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn into_meta(self) -> FileMeta {
        self.meta
    }
}
impl<S: HashState> Deref for FileInfo<S> {
    type Target = FileMeta;
    fn deref(&self) -> &FileMeta {
        &self.meta
    }
}

impl FileInfo {
    /// Create a new FileInfo from a listing operation (no hash yet).
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: Option<UtcDateTime>) -> Self {
        FileMeta { path: path.into(), size, modified }.into()
    }

    pub fn with_hash(self, hash: ContentHash) -> FileInfo<Hashed> {
        FileInfo { meta: self.meta, hash }
    }
}
impl From<FileMeta> for FileInfo<Discovered> {
    fn from(meta: FileMeta) -> Self {
        Self { meta, hash: () }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;

    #[test]
    fn test_typestate_transition() {
        let discovered = FileInfo::new("notes/todo.md", 5, None);
        let hash = HashAlgorithm::Sha256.hash_bytes(b"hello");
        let hashed = discovered.with_hash(hash.clone());
        assert_eq!(hashed.path, PathBuf::from("notes/todo.md"));
        assert_eq!(hashed.size, 5);
        assert_eq!(hashed.hash, hash);
    }
}
