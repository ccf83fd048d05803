//! In-memory storage backend for testing.

use super::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::UtcDateTime;

use crate::StorageBackend;

type Files = HashMap<PathBuf, (UtcDateTime, Vec<u8>)>;

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. The lock is a
/// blocking one: writers returned by [`writer()`](StorageBackend::writer)
/// commit their buffer on `flush()` from inside `spawn_blocking`.
///
/// # Examples
///
/// ```
/// use timekeep_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("docs/a.txt", b"hello"),
/// ]);
/// assert!(backend.exists(Path::new("docs/a.txt")).await?);
///
/// backend.write(Path::new("docs/b.txt"), b"world").await?;
/// assert!(backend.exists(Path::new("docs/b.txt")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: Arc<RwLock<Files>>,
    unreadable: HashSet<PathBuf>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // MockBackend only exists for tests; bad setup should fail loudly.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: Arc::new(RwLock::new(map)),
            unreadable: HashSet::new(),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark files as unreadable: they still show up in listings, but reading
    /// them fails with [`PermissionDenied`](ErrorKind::PermissionDenied).
    pub fn with_unreadable(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        for path in paths {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_unreadable: invalid path {}", path.display());
            };
            self.unreadable.insert(validated);
        }
        self
    }

    fn files(&self) -> RwLockReadGuard<'_, Files> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_mut(&self) -> RwLockWriteGuard<'_, Files> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn readable(&self, path: &Path) -> Result<Vec<u8>> {
        if self.unreadable.contains(path) {
            exn::bail!(ErrorKind::PermissionDenied(path.to_path_buf()));
        }
        let data = self.files().get(path).map(|(_, data)| data.clone());
        data.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

/// Buffers writes and publishes them into the map on flush.
struct MockWriter {
    storage: Arc<RwLock<Files>>,
    path: PathBuf,
    buffer: Vec<u8>,
}
impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(self.path.clone(), (UtcDateTime::now(), self.buffer.clone()));
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        // Snapshot matching entries before yielding; the guard isn't Send.
        let entries: Vec<FileInfo> = self
            .files()
            .iter()
            .filter(|(path, _)| match &validated_prefix {
                Some(pfx) => path.starts_with(pfx),
                None => true,
            })
            .map(|(path, (modified, data))| FileInfo::new(path.clone(), data.len() as u64, Some(*modified)))
            .collect();
        Box::pin(stream! {
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.files().contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        self.readable(&path)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let path = validate_path(path)?;
        Ok(Box::new(Cursor::new(self.readable(&path)?)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.files_mut().insert(path, (UtcDateTime::now(), data.to_vec()));
        Ok(())
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        let path = validate_path(path)?;
        Ok(Box::new(MockWriter {
            storage: Arc::clone(&self.storage),
            path,
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.files_mut().remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<()> {
        let prefix = validate_path(prefix)?;
        self.files_mut().retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        let mut guard = self.files_mut();
        let data = guard.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        guard.insert(to, data);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let guard = self.files();
        let (modified, data) = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(FileInfo::new(path.clone(), data.len() as u64, Some(*modified)))
    }
}
