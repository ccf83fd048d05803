//! Per-backup content-addressed object store.
//!
//! Every backup owns a directory beneath the storage root:
//!
//! ```text
//! backups/
//!   thesis_2026-10-19_09-30-00/
//!     manifest.json
//!     files/
//!       2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! ```
//!
//! Objects are named by the hash of their contents, so identical content
//! within one backup is stored once. Objects are written to a temporary name
//! first and renamed into place, so an object that exists is always complete.

use crate::backend::{BoxSyncRead, StorageBackend};
use crate::error::{ErrorKind, Result};
use crate::hash::{ContentHash, HashAlgorithm};
use crate::path::validate_component;
use crate::BackendHandle;
use exn::ResultExt;
use futures::TryStreamExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use uuid::Uuid;

pub const BACKUPS_DIR: &str = "backups";
pub const FILES_DIR: &str = "files";
pub const MANIFEST_FILE: &str = "manifest.json";
const PARTIAL_PREFIX: &str = ".partial-";

/// `backups/{name}`
pub fn backup_dir(name: &str) -> Result<PathBuf> {
    Ok(Path::new(BACKUPS_DIR).join(validate_component(name)?))
}

/// `backups/{name}/files/{hash}`
pub fn object_path(name: &str, hash: &ContentHash) -> Result<PathBuf> {
    Ok(backup_dir(name)?.join(FILES_DIR).join(hash.as_str()))
}

/// `backups/{name}/manifest.json`
pub fn manifest_path(name: &str) -> Result<PathBuf> {
    Ok(backup_dir(name)?.join(MANIFEST_FILE))
}

/// Remove a temporary file, logging rather than failing: whatever went wrong
/// before matters more to the caller.
async fn discard(backend: &dyn StorageBackend, partial: &Path) {
    if let Err(e) = backend.delete(partial).await
        && !matches!(&*e, ErrorKind::NotFound(_))
    {
        tracing::warn!(backend = backend.name(), path = %partial.display(), error = %e, "Failed to remove partial file");
    }
}

fn partial_object_path(name: &str) -> Result<PathBuf> {
    Ok(backup_dir(name)?.join(FILES_DIR).join(format!("{PARTIAL_PREFIX}{}", Uuid::new_v4())))
}

/// Result of storing one stream of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// Hash of the bytes that were actually stored.
    pub hash: ContentHash,
    pub size: u64,
    /// The backup already held an object with this hash.
    pub deduplicated: bool,
}

#[derive(Clone)]
pub struct ContentStore {
    backend: BackendHandle,
}
impl ContentStore {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub async fn contains(&self, backup: &str, hash: &ContentHash) -> Result<bool> {
        self.backend.exists(&object_path(backup, hash)?).await
    }

    /// Stream `reader` into the backup's object store, hashing on the way.
    ///
    /// The object is keyed by the hash of the bytes actually read, which may
    /// differ from an earlier hash of the same file if it changed in between.
    #[tracing::instrument(level = "debug", skip(self, reader), fields(backend = self.backend.name()))]
    pub async fn ingest(&self, backup: &str, algorithm: HashAlgorithm, reader: BoxSyncRead) -> Result<Ingested> {
        let partial = partial_object_path(backup)?;
        let writer = self.backend.writer(&partial).await?;
        let copied = spawn_blocking(move || algorithm.copy_and_hash(reader, writer))
            .await
            .or_raise(|| ErrorKind::BackendError("hashing task failed".to_string()));
        let (hash, size) = match copied {
            Ok(Ok(done)) => done,
            Ok(Err(io)) => {
                discard(self.backend.as_ref(), &partial).await;
                exn::bail!(ErrorKind::Io(io));
            },
            Err(e) => {
                discard(self.backend.as_ref(), &partial).await;
                return Err(e);
            },
        };
        let target = object_path(backup, &hash)?;
        if self.backend.exists(&target).await? {
            discard(self.backend.as_ref(), &partial).await;
            return Ok(Ingested { hash, size, deduplicated: true });
        }
        self.backend.rename(&partial, &target).await?;
        Ok(Ingested { hash, size, deduplicated: false })
    }

    pub async fn read(&self, backup: &str, hash: &ContentHash) -> Result<Vec<u8>> {
        self.backend.read(&object_path(backup, hash)?).await
    }

    pub async fn reader(&self, backup: &str, hash: &ContentHash) -> Result<BoxSyncRead> {
        self.backend.reader(&object_path(backup, hash)?).await
    }

    /// Copy an object to `path` on another backend, checking its hash on the
    /// way through.
    ///
    /// Bytes go to a temporary sibling first; the destination is only
    /// replaced once the content is known to be intact.
    pub async fn export(
        &self,
        backup: &str,
        hash: &ContentHash,
        algorithm: HashAlgorithm,
        target: &dyn StorageBackend,
        path: &Path,
    ) -> Result<u64> {
        let reader = self.reader(backup, hash).await?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let partial = path.with_file_name(format!("{PARTIAL_PREFIX}{file_name}-{}", Uuid::new_v4()));
        let writer = target.writer(&partial).await?;
        let copied = spawn_blocking(move || algorithm.copy_and_hash(reader, writer))
            .await
            .or_raise(|| ErrorKind::BackendError("copy task failed".to_string()));
        let (actual, size) = match copied {
            Ok(Ok(done)) => done,
            Ok(Err(io)) => {
                discard(target, &partial).await;
                exn::bail!(ErrorKind::Io(io));
            },
            Err(e) => {
                discard(target, &partial).await;
                return Err(e);
            },
        };
        if &actual != hash {
            discard(target, &partial).await;
            exn::bail!(ErrorKind::HashMismatch {
                path: object_path(backup, hash)?,
                expected: hash.to_string(),
                actual: actual.to_string(),
            });
        }
        target.rename(&partial, path).await?;
        Ok(size)
    }

    /// Re-hash an object and compare it with its name.
    pub async fn verify(&self, backup: &str, hash: &ContentHash, algorithm: HashAlgorithm) -> Result<bool> {
        let reader = self.reader(backup, hash).await?;
        let (actual, _) = spawn_blocking(move || algorithm.hash_reader(reader))
            .await
            .or_raise(|| ErrorKind::BackendError("hashing task failed".to_string()))?
            .map_err(ErrorKind::Io)?;
        Ok(&actual == hash)
    }

    /// Hashes of every complete object in a backup.
    pub async fn list_objects(&self, backup: &str) -> Result<BTreeSet<ContentHash>> {
        let dir = backup_dir(backup)?.join(FILES_DIR);
        let mut objects = BTreeSet::new();
        let mut stream = self.backend.list_stream(Some(&dir));
        while let Some(info) = stream.try_next().await? {
            let Some(name) = info.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(PARTIAL_PREFIX) {
                continue;
            }
            match name.parse::<ContentHash>() {
                Ok(hash) => {
                    objects.insert(hash);
                },
                Err(_) => tracing::warn!(path = %info.path.display(), "Unexpected file in object store"),
            }
        }
        Ok(objects)
    }

    /// Remove a backup directory and everything in it.
    pub async fn remove_backup(&self, backup: &str) -> Result<()> {
        self.backend.delete_prefix(&backup_dir(backup)?).await
    }

    /// Names of every backup directory on disk, whether or not it has a
    /// published manifest.
    /// Whether anything is stored under `backups/{name}`.
    ///
    /// Cheap where the backend has real directories; otherwise stops at the
    /// first file found under the prefix.
    pub async fn has_backup(&self, name: &str) -> Result<bool> {
        let dir = backup_dir(name)?;
        if self.backend.exists(&dir).await? {
            return Ok(true);
        }
        let mut stream = self.backend.list_stream(Some(&dir));
        Ok(stream.try_next().await?.is_some())
    }

    /// Every backup directory name. Walks all stored objects; meant for
    /// housekeeping, not for every backup.
    pub async fn list_backups(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut stream = self.backend.list_stream(Some(Path::new(BACKUPS_DIR)));
        while let Some(info) = stream.try_next().await? {
            let Ok(relative) = info.path.strip_prefix(BACKUPS_DIR) else {
                continue;
            };
            if let Some(name) = relative.components().next().and_then(|c| c.as_os_str().to_str()) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, MockBackend};
    use std::io::Cursor;
    use std::sync::Arc;

    fn reader(data: &'static [u8]) -> BoxSyncRead {
        Box::new(Cursor::new(data))
    }

    fn store() -> (ContentStore, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        (ContentStore::new(backend.clone()), backend)
    }

    #[test]
    fn test_layout() {
        let hash = HashAlgorithm::Sha256.hash_bytes(b"hello");
        assert_eq!(backup_dir("b1").unwrap(), Path::new("backups/b1"));
        assert_eq!(manifest_path("b1").unwrap(), Path::new("backups/b1/manifest.json"));
        assert_eq!(
            object_path("b1", &hash).unwrap(),
            Path::new("backups/b1/files").join(hash.as_str())
        );
        assert!(backup_dir("../escape").is_err());
        assert!(backup_dir("a/b").is_err());
    }

    #[tokio::test]
    async fn test_ingest_stores_by_hash() {
        let (store, backend) = store();
        let stored = store.ingest("b1", HashAlgorithm::Sha256, reader(b"hello")).await.unwrap();
        assert_eq!(stored.hash, HashAlgorithm::Sha256.hash_bytes(b"hello"));
        assert_eq!(stored.size, 5);
        assert!(!stored.deduplicated);
        assert!(store.contains("b1", &stored.hash).await.unwrap());
        assert_eq!(store.read("b1", &stored.hash).await.unwrap(), b"hello");
        // No temporary files left behind.
        assert_eq!(backend.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_deduplicates() {
        let (store, backend) = store();
        store.ingest("b1", HashAlgorithm::Sha256, reader(b"same")).await.unwrap();
        let second = store.ingest("b1", HashAlgorithm::Sha256, reader(b"same")).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(backend.list(None).await.unwrap().len(), 1);
        // Another backup gets its own copy.
        let other = store.ingest("b2", HashAlgorithm::Sha256, reader(b"same")).await.unwrap();
        assert!(!other.deduplicated);
        assert_eq!(store.list_objects("b2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let (store, backend) = store();
        let stored = store.ingest("b1", HashAlgorithm::Sha256, reader(b"hello")).await.unwrap();
        assert!(store.verify("b1", &stored.hash, HashAlgorithm::Sha256).await.unwrap());
        backend.write(&object_path("b1", &stored.hash).unwrap(), b"tampered").await.unwrap();
        assert!(!store.verify("b1", &stored.hash, HashAlgorithm::Sha256).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_checks_content() {
        let (store, backend) = store();
        let target = MockBackend::default();
        let stored = store.ingest("b1", HashAlgorithm::Sha256, reader(b"hello")).await.unwrap();
        let size = store
            .export("b1", &stored.hash, HashAlgorithm::Sha256, &target, Path::new("out/a.txt"))
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(target.read(Path::new("out/a.txt")).await.unwrap(), b"hello");

        backend.write(&object_path("b1", &stored.hash).unwrap(), b"tampered").await.unwrap();
        let err = store
            .export("b1", &stored.hash, HashAlgorithm::Sha256, &target, Path::new("out/b.txt"))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::HashMismatch { .. }));
        assert!(!target.exists(Path::new("out/b.txt")).await.unwrap());
        // The temporary copy is cleaned up too.
        assert_eq!(target.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_remove_backups() {
        let temp = tempfile::tempdir().unwrap();
        let store = ContentStore::new(Arc::new(LocalBackend::new("store", temp.path()).unwrap()));
        store.ingest("b1", HashAlgorithm::Sha256, reader(b"one")).await.unwrap();
        store.ingest("b2", HashAlgorithm::Blake3, reader(b"two")).await.unwrap();
        let names: Vec<_> = store.list_backups().await.unwrap().into_iter().collect();
        assert_eq!(names, vec!["b1".to_string(), "b2".to_string()]);
        store.remove_backup("b1").await.unwrap();
        assert!(!temp.path().join("backups/b1").exists());
        let names: Vec<_> = store.list_backups().await.unwrap().into_iter().collect();
        assert_eq!(names, vec!["b2".to_string()]);
        assert!(store.has_backup("b2").await.unwrap());
        assert!(!store.has_backup("b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_has_backup_without_directories() {
        let (store, _backend) = store();
        store.ingest("b1", HashAlgorithm::Sha256, reader(b"one")).await.unwrap();
        assert!(store.has_backup("b1").await.unwrap());
        assert!(!store.has_backup("b2").await.unwrap());
        assert!(!store.has_backup("b").await.unwrap());
    }
}
