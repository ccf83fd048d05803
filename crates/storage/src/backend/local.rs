//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Files are stored in a configured directory and accessed using standard filesystem
//! operations via `tokio::fs` for async I/O.

use crate::backend::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::ErrorKind;
use crate::file::FileInfo;
use crate::{StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// All paths are relative to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use timekeep_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Storage root: created on first use.
/// let store = LocalBackend::new("store", "/var/lib/timekeep")?;
/// // A tracked folder: must already exist.
/// let source = LocalBackend::open("source", "/home/user/thesis")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the backend
    root: PathBuf,
    follow_symlinks: bool,
}
impl LocalBackend {
    /// Create a new local filesystem backend, creating the root directory if
    /// it doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on initialization
            // and it's not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root, follow_symlinks: false })
    }

    /// Open an existing directory as a backend without creating anything.
    ///
    /// Used for tracked source folders: a missing source is an error, not
    /// something to create.
    pub fn open(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        let metadata = std::fs::metadata(&root).map_err(|e| Self::map_io_error(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        Ok(Self { name: name.into(), root, follow_symlinks: false })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List symbolic links to regular files as if they were the file itself.
    ///
    /// Links to directories are always skipped, so a link back up the tree
    /// can't make a listing endless.
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Get the absolute path for a relative storage path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a relative storage path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::BackendError(format!(
                "attempting to get relative path of non-absolute path `{:?}`",
                absolute
            )))
        }
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        // Validate path will also canonicalize it.
        validate_path(relative)
    }

    /// Re-use same data collection from file metadata for both list and stat functions
    fn metadata(path: &Path, metadata: Metadata) -> FileInfo {
        let modified = metadata.modified().ok().map(UtcDateTime::from);
        FileInfo::new(PathBuf::from(path), metadata.len(), modified)
    }

    /// Errors met while walking always name the root-relative path they
    /// concern, so callers can tell which part of a listing is incomplete.
    fn listing_error(e: std::io::Error, relative: &Path) -> exn::Exn<ErrorKind> {
        let kind = Self::map_io_error(e, relative);
        if kind.path().is_some() {
            exn::Exn::from(kind)
        } else {
            exn::Exn::from(kind).raise(ErrorKind::ListFailed(relative.to_path_buf()))
        }
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Inside the stream loop errors can't be `?`-ed; they have to be
    /// converted, yielded, and then the loop continues. This keeps that
    /// dance in one place.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let relative = self.relative_path(&path)?;
        // DirEntry metadata does not traverse symlinks.
        let metadata = entry.metadata().await.map_err(|e| Self::listing_error(e, &relative))?;
        if metadata.is_dir() {
            // Descend when the directory is on the way to the prefix, or inside it.
            return Ok(match prefix {
                Some(pfx) if !relative.starts_with(pfx) && !pfx.starts_with(&relative) => WalkEntry::Skip,
                _ => WalkEntry::Descend(path),
            });
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::metadata(&relative, metadata)));
        }
        if metadata.file_type().is_symlink() {
            if self.follow_symlinks
                && let Ok(target) = fs::metadata(&path).await
                && target.is_file()
            {
                return Ok(WalkEntry::File(Self::metadata(&relative, target)));
            }
            tracing::warn!(backend = %self.name, path = %relative.display(), "Skipping symbolic link");
        } else {
            tracing::warn!(backend = %self.name, path = %relative.display(), "Skipping special file");
        }
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let relative = current.strip_prefix(&self.root).unwrap_or(&current).to_path_buf();
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Asking for the contents of a directory that doesn't
                    // exist results in an empty list, not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(Self::listing_error(err, &relative));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        // The rest of this directory can't be trusted.
                        Err(e) => { yield Err(Self::listing_error(e, &relative)); continue 'dirs; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        let file = fs::File::create(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(BufWriter::new(file.into_std().await)))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<()> {
        let abs_path = self.absolute_path(prefix)?;
        let result = match fs::symlink_metadata(&abs_path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&abs_path).await,
            Ok(_) => fs::remove_file(&abs_path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io_error(e, prefix).into()),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, to))?;
        }
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Self::metadata(path, metadata))
    }

    fn local_path(&self, path: &Path) -> Option<PathBuf> {
        self.absolute_path(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::{Read, Write};

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[test]
    fn test_open_requires_existing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::open("source", temp_dir.path()).is_ok());
        let missing = temp_dir.path().join("missing");
        let err = LocalBackend::open("source", &missing).err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(!missing.exists(), "open must not create the directory");
        let file = temp_dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(LocalBackend::open("source", &file).is_err());
    }

    #[test]
    fn test_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        let expected = temp_dir.path().join("docs/report.txt");
        assert_eq!(backend.absolute_path(Path::new("docs/report.txt")).unwrap(), expected);
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[test]
    fn test_relative_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        let abs = temp_dir.path().join("docs/report.txt");
        assert_eq!(backend.relative_path(&abs).unwrap(), Path::new("docs/report.txt"));
        let outside = PathBuf::from("/other/file.txt");
        assert!(backend.relative_path(&outside).is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("a/b/test.txt"), b"Hello, world!").await.unwrap();
        assert_eq!(backend.read(Path::new("a/b/test.txt")).await.unwrap(), b"Hello, world!");
    }

    #[tokio::test]
    async fn test_streaming_reader_and_writer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        let mut writer = backend.writer(Path::new("deep/dir/stream.bin")).await.unwrap();
        tokio::task::spawn_blocking(move || {
            writer.write_all(b"streamed").unwrap();
            writer.flush().unwrap();
        })
        .await
        .unwrap();
        let mut reader = backend.reader(Path::new("deep/dir/stream.bin")).await.unwrap();
        let data = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        assert_eq!(data, b"streamed");
    }

    #[tokio::test]
    async fn test_reader_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        let err = backend.reader(Path::new("missing.txt")).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        assert!(!backend.exists(Path::new("nonexistent.txt")).await.unwrap());
        backend.write(Path::new("exists.txt"), b"data").await.unwrap();
        assert!(backend.exists(Path::new("exists.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("file.txt"), b"data").await.unwrap();
        backend.delete(Path::new("file.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("file.txt")).await.unwrap());
        let err = backend.delete(Path::new("nonexistent.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("backups/one/files/a"), b"a").await.unwrap();
        backend.write(Path::new("backups/one/manifest.json"), b"{}").await.unwrap();
        backend.write(Path::new("backups/two/files/b"), b"b").await.unwrap();
        backend.delete_prefix(Path::new("backups/one")).await.unwrap();
        assert!(!temp_dir.path().join("backups/one").exists());
        assert!(backend.exists(Path::new("backups/two/files/b")).await.unwrap());
        // Missing prefixes are fine.
        backend.delete_prefix(Path::new("backups/one")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("file.txt"), b"data").await.unwrap();
        backend.rename(Path::new("file.txt"), Path::new("a/b/c/file.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("file.txt")).await.unwrap());
        assert_eq!(backend.read(Path::new("a/b/c/file.txt")).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_stat() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("file.txt"), b"Hello, world!").await.unwrap();
        let info = backend.stat(Path::new("file.txt")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("file.txt"));
        assert_eq!(info.size, 13);
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn test_list_returns_all_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("a.txt"), b"data").await.unwrap();
        backend.write(Path::new("dir/b.txt"), b"data").await.unwrap();
        backend.write(Path::new("dir/sub/c.txt"), b"data").await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join("empty")).unwrap();
        let files = backend.list(None).await.unwrap();
        assert_eq!(files.len(), 3);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("Proj/Sub/file.txt"), b"data").await.unwrap();
        backend.write(Path::new("Proj/Subdir/file.txt"), b"data").await.unwrap();
        backend.write(Path::new("Proj/Subfile.txt"), b"data").await.unwrap();
        let mut files = backend.list(Some(Path::new("Proj/Sub"))).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files.pop().unwrap().path, Path::new("Proj/Sub/file.txt"));
    }

    #[tokio::test]
    async fn test_list_single_file_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("report.pdf"), b"pdf").await.unwrap();
        backend.write(Path::new("report.pdf.bak"), b"old").await.unwrap();
        let files = backend.list(Some(Path::new("report.pdf"))).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, Path::new("report.pdf"));
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        assert!(backend.list(Some(Path::new("nonexistent/"))).await.unwrap().is_empty());
    }

    #[test]
    fn test_listing_errors_name_relative_paths() {
        let err = LocalBackend::listing_error(std::io::Error::other("device gone"), Path::new("chapters/drafts"));
        assert!(matches!(&*err, ErrorKind::ListFailed(p) if p == Path::new("chapters/drafts")));
        assert_eq!((*err).path(), Some(Path::new("chapters/drafts")));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = LocalBackend::listing_error(denied, Path::new("locked"));
        assert!(matches!(&*err, ErrorKind::PermissionDenied(p) if p == Path::new("locked")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_skips_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        backend.write(Path::new("real.txt"), b"data").await.unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("real.txt"), temp_dir.path().join("link.txt")).unwrap();
        let files = backend.list(None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, Path::new("real.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_follows_file_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap().follow_symlinks(true);
        backend.write(Path::new("real.txt"), b"data").await.unwrap();
        backend.write(Path::new("dir/inner.txt"), b"inner").await.unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("real.txt"), temp_dir.path().join("link.txt")).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("dir"), temp_dir.path().join("dir-link")).unwrap();
        let mut paths: Vec<_> = backend.list(None).await.unwrap().into_iter().map(|f| f.into_meta().path).collect();
        paths.sort();
        assert_eq!(paths, vec![PathBuf::from("dir/inner.txt"), PathBuf::from("link.txt"), PathBuf::from("real.txt")]);
        assert_eq!(backend.read(Path::new("link.txt")).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_path_security() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.read(Path::new("etc/../../passwd")).await.is_err());
        assert!(backend.write(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
        assert!(backend.delete_prefix(Path::new("..")).await.is_err());
    }
}
