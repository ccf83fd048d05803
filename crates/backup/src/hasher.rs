//! Content hashing of single files and whole trees.
//!
//! Hashing is read-only. A file that can't be read is skipped and reported,
//! never fatal: one unreadable file must not lose a whole folder's backup.

use crate::error::{ErrorKind, Result};
use crate::progress::{Phase, ProgressSink, Tracker};
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt, stream};
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use timekeep_storage::backend::{LocalBackend, StorageBackend};
use timekeep_storage::file::{FileInfo, Hashed};
use timekeep_storage::{BackendHandle, ContentHash, HashAlgorithm, to_slash};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

/// One hashed file of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// `/`-separated path relative to the tree root.
    pub relative_path: String,
    pub hash: ContentHash,
    pub size_bytes: u64,
    pub modified_at: Option<UtcDateTime>,
}
impl TryFrom<FileInfo<Hashed>> for FileEntry {
    type Error = crate::error::Error;
    fn try_from(file: FileInfo<Hashed>) -> Result<Self> {
        Ok(Self {
            relative_path: to_slash(&file.path).or_raise(|| ErrorKind::Read {
                path: file.path.clone(),
                reason: "path is not valid UTF-8".to_string(),
            })?,
            size_bytes: file.size,
            modified_at: file.modified,
            hash: file.hash,
        })
    }
}

/// A file that was left out of a backup, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    /// `/`-separated path relative to the tree root. Refers to a whole
    /// directory when the directory itself couldn't be listed, and is empty
    /// when the listing failed without saying where.
    pub path: String,
    pub reason: String,
}

/// Result of hashing a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHash {
    /// Directory hash over every entry; see [`HashAlgorithm::combine`].
    pub hash: ContentHash,
    pub total_size: u64,
    pub file_count: u64,
    /// Sorted by path.
    pub entries: Vec<FileEntry>,
    pub skipped: Vec<SkippedFile>,
}

/// Something to back up: a directory, or a single file inside one.
///
/// Reads go through a [`StorageBackend`] rooted at the directory (or, for a
/// single file, at its parent with the file name as listing prefix).
#[derive(Clone)]
pub struct Source {
    backend: BackendHandle,
    prefix: Option<PathBuf>,
    location: PathBuf,
}
impl Source {
    /// Open a local file or directory. Symbolic links inside it are skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, false)
    }

    /// Open a local file or directory, optionally following symbolic links
    /// to files.
    pub fn open_with(path: impl AsRef<Path>, follow_symlinks: bool) -> Result<Self> {
        let path = path.as_ref();
        let invalid = || ErrorKind::InvalidSource(path.to_path_buf());
        if !path.is_absolute() {
            exn::bail!(invalid());
        }
        let metadata = std::fs::symlink_metadata(path).or_raise(invalid)?;
        if metadata.is_dir() {
            let backend = LocalBackend::open("source", path).or_raise(invalid)?.follow_symlinks(follow_symlinks);
            Ok(Self::new(std::sync::Arc::new(backend), None, path))
        } else if metadata.is_file() {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                exn::bail!(invalid());
            };
            let backend = LocalBackend::open("source", parent).or_raise(invalid)?.follow_symlinks(follow_symlinks);
            Ok(Self::new(std::sync::Arc::new(backend), Some(PathBuf::from(name)), path))
        } else {
            exn::bail!(invalid())
        }
    }

    /// A source over any backend. `location` is what gets recorded as the
    /// backup's source path.
    pub fn new(backend: BackendHandle, prefix: Option<PathBuf>, location: impl Into<PathBuf>) -> Self {
        Self { backend, prefix, location: location.into() }
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Human-readable base of backup names: the file or folder name.
    pub fn base_name(&self) -> String {
        self.location.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Like [`to_slash`], but never fails: names that aren't UTF-8 are spelled
/// lossily, which is good enough for reporting them.
fn lossy_slash(path: &Path) -> String {
    to_slash(path).unwrap_or_else(|_| path.to_string_lossy().replace('\\', "/"))
}

/// Hash a single file, returning its metadata and content hash.
///
/// Fails with [`Read`](ErrorKind::Read) if the file can't be opened or read.
pub async fn hash_file(backend: &dyn StorageBackend, path: &Path, algorithm: HashAlgorithm) -> Result<FileInfo<Hashed>> {
    let read_error = |reason: String| ErrorKind::Read { path: path.to_path_buf(), reason };
    let info = backend.stat(path).await.map_err(|e| {
        let reason = (*e).to_string();
        e.raise(read_error(reason))
    })?;
    let reader = backend.reader(path).await.map_err(|e| {
        let reason = (*e).to_string();
        e.raise(read_error(reason))
    })?;
    let hashed = spawn_blocking(move || algorithm.hash_reader(reader))
        .await
        .or_raise(|| read_error("hashing task failed".to_string()))?;
    match hashed {
        Ok((hash, _size)) => Ok(info.with_hash(hash)),
        Err(io) => {
            let reason = io.to_string();
            Err(io).or_raise(|| read_error(reason))
        },
    }
}

/// Identity of a path string, independent of the content behind it.
pub fn hash_path(path: impl AsRef<Path>, algorithm: HashAlgorithm) -> ContentHash {
    algorithm.hash_path(path)
}

/// Hash a local directory (or file) with default settings.
pub async fn hash_directory(path: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<TreeHash> {
    let source = Source::open(path)?;
    hash_tree(&source, algorithm, 1, &crate::progress::Silent, &CancellationToken::new()).await
}

/// Hash every regular file of a source.
///
/// Up to `concurrency` files are hashed at once; the entries are sorted by
/// path afterwards so the result doesn't depend on scheduling or on the
/// order the filesystem lists files in. `progress` is told about every file
/// once it's been hashed (or skipped).
#[tracing::instrument(level = "info", skip_all, fields(source = %source.location.display()))]
pub async fn hash_tree(
    source: &Source,
    algorithm: HashAlgorithm,
    concurrency: usize,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<TreeHash> {
    let backend = source.backend.as_ref();
    let mut discovered = Vec::new();
    let mut skipped = Vec::new();
    let mut listing = backend.list_stream(source.prefix.as_deref());
    while let Some(item) = listing.next().await {
        match item {
            Ok(file) => discovered.push(file),
            Err(e) => {
                let path = e.path().map(lossy_slash).unwrap_or_default();
                let reason = (*e).to_string();
                if path.is_empty() {
                    tracing::warn!(error = %reason, "Source could not be listed completely");
                } else {
                    tracing::warn!(path = %path, error = %reason, "Skipping unreadable directory");
                }
                skipped.push(SkippedFile { path, reason });
            },
        }
    }
    drop(listing);

    let mut tracker = Tracker::new(progress, Phase::Hashing, discovered.len());
    let mut hashed = Vec::with_capacity(discovered.len());
    let mut results = stream::iter(discovered)
        .map(|file| async move {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let path = file.path.clone();
            Ok((path.clone(), hash_file(backend, &path, algorithm).await))
        })
        .buffer_unordered(concurrency.max(1));
    while let Some((path, result)) = results.try_next().await? {
        let label = path.to_string_lossy().into_owned();
        match result.and_then(FileEntry::try_from) {
            Ok(entry) => hashed.push(entry),
            Err(e) => {
                let path = lossy_slash(&path);
                let reason = match &*e {
                    ErrorKind::Read { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                tracing::warn!(path = %path, error = %reason, "Skipping unreadable file");
                skipped.push(SkippedFile { path, reason });
            },
        }
        tracker.step(label);
    }

    hashed.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    skipped.sort_by(|a, b| a.path.cmp(&b.path));
    let hash = algorithm.combine(hashed.iter().map(|e| (e.relative_path.as_str(), &e.hash)));
    Ok(TreeHash {
        hash,
        total_size: hashed.iter().map(|e| e.size_bytes).sum(),
        file_count: hashed.len() as u64,
        entries: hashed,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use timekeep_storage::backend::MockBackend;

    fn mock_source(backend: MockBackend) -> Source {
        Source::new(Arc::new(backend), None, "/mock/thesis")
    }

    async fn hash(source: &Source) -> TreeHash {
        hash_tree(source, HashAlgorithm::Sha256, 4, &crate::progress::Silent, &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_hash_file() {
        let backend = MockBackend::with_files([("a.txt", b"hello")]);
        let file = hash_file(&backend, Path::new("a.txt"), HashAlgorithm::Sha256).await.unwrap();
        assert_eq!(file.hash, HashAlgorithm::Sha256.hash_bytes(b"hello"));
        assert_eq!(file.size, 5);
        let err = hash_file(&backend, Path::new("missing.txt"), HashAlgorithm::Sha256).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Read { .. }));
    }

    #[tokio::test]
    async fn test_tree_hash_is_deterministic() {
        // Same content, inserted in different orders.
        let one = mock_source(MockBackend::with_files([("a.txt", "hello"), ("dir/b.txt", "world"), ("c.txt", "!")]));
        let two = mock_source(MockBackend::with_files([("c.txt", "!"), ("dir/b.txt", "world"), ("a.txt", "hello")]));
        let (one, two) = (hash(&one).await, hash(&two).await);
        assert_eq!(one.hash, two.hash);
        // Modification times are whatever the backend stamped; only content counts.
        let key = |t: &TreeHash| -> Vec<_> {
            t.entries.iter().map(|e| (e.relative_path.clone(), e.hash.clone(), e.size_bytes)).collect()
        };
        assert_eq!(key(&one), key(&two));
        assert_eq!(one.file_count, 3);
        assert_eq!(one.total_size, 11);
        let paths: Vec<_> = one.entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "c.txt", "dir/b.txt"]);
    }

    #[tokio::test]
    async fn test_tree_hash_changes_with_content() {
        let one = hash(&mock_source(MockBackend::with_files([("a.txt", "hello")]))).await;
        let two = hash(&mock_source(MockBackend::with_files([("a.txt", "HELLO")]))).await;
        assert_ne!(one.hash, two.hash);
    }

    #[tokio::test]
    async fn test_unreadable_files_are_skipped() {
        let backend =
            MockBackend::with_files([("a.txt", "hello"), ("secret.txt", "shh")]).with_unreadable(["secret.txt"]);
        let tree = hash(&mock_source(backend)).await;
        assert_eq!(tree.file_count, 1);
        assert_eq!(tree.entries[0].relative_path, "a.txt");
        assert_eq!(tree.skipped.len(), 1);
        assert_eq!(tree.skipped[0].path, "secret.txt");
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_file() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: crate::progress::Progress| seen.lock().unwrap().push((p.done, p.total));
        let source = mock_source(MockBackend::with_files([("a.txt", "1"), ("b.txt", "2")]));
        hash_tree(&source, HashAlgorithm::Sha256, 1, &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let source = mock_source(MockBackend::with_files([("a.txt", "1")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = hash_tree(&source, HashAlgorithm::Sha256, 1, &crate::progress::Silent, &cancel).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_local_directory_and_single_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("thesis/ch")).unwrap();
        std::fs::write(temp.path().join("thesis/a.txt"), "hello").unwrap();
        std::fs::write(temp.path().join("thesis/ch/b.txt"), "world").unwrap();
        let tree = hash_directory(temp.path().join("thesis"), HashAlgorithm::Sha256).await.unwrap();
        assert_eq!(tree.file_count, 2);
        assert_eq!(tree.entries[1].relative_path, "ch/b.txt");

        let single = hash_directory(temp.path().join("thesis/a.txt"), HashAlgorithm::Sha256).await.unwrap();
        assert_eq!(single.file_count, 1);
        assert_eq!(single.entries[0].relative_path, "a.txt");

        let err = hash_directory(temp.path().join("missing"), HashAlgorithm::Sha256).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidSource(_)));
        let err = hash_directory("relative/dir", HashAlgorithm::Sha256).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidSource(_)));
    }

    #[test]
    fn test_hash_path_ignores_content() {
        assert_eq!(
            hash_path("/home/user/thesis", HashAlgorithm::Sha256),
            HashAlgorithm::Sha256.hash_path("/home/user/thesis")
        );
    }
}
