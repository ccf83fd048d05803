//! Backup Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors from the storage and catalog
//! crates are wrapped as [`Storage`](ErrorKind::Storage) and
//! [`Catalog`](ErrorKind::Catalog) children of the tree.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A backup error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a backup failure.
///
/// ### Per-file errors
/// - [`ErrorKind::Read`]: recovered locally; the file is skipped and reported.
///
/// ### Operation errors
/// - [`ErrorKind::Write`]: nothing is published.
/// - [`ErrorKind::ManifestNotFound`], [`ErrorKind::ParentChainBroken`]: the
///   requested history can't be read back.
/// - [`ErrorKind::NameCollision`], [`ErrorKind::Cancelled`].
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A source file couldn't be read.
    #[display("could not read source file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    /// The backup destination couldn't be written.
    #[display("could not write backup {_0}")]
    Write(#[error(not(source))] String),
    /// The manifest of the requested backup is missing or unreadable.
    #[display("manifest not found for backup {_0}")]
    ManifestNotFound(#[error(not(source))] String),
    /// An ancestor of a differential backup is missing, or doesn't hold the
    /// content it's supposed to.
    #[display("parent chain of backup {backup} is broken at {ancestor}")]
    ParentChainBroken { backup: String, ancestor: String },
    /// No free name could be found for a new backup.
    #[display("could not find a free name for backup {_0}")]
    NameCollision(#[error(not(source))] String),
    /// The parent backup given for a differential isn't in the catalog.
    #[display("parent backup not found: {_0}")]
    ParentNotFound(#[error(not(source))] String),
    #[display("backup not found: {_0}")]
    BackupNotFound(#[error(not(source))] String),
    /// Other backups still depend on the backup(s) being deleted.
    #[display("{_0} is still the parent of other backups")]
    HasDependents(#[error(not(source))] String),
    /// The source path doesn't exist or isn't a regular file or directory.
    #[display("invalid backup source: {}", _0.display())]
    InvalidSource(#[error(not(source))] PathBuf),
    #[display("operation was cancelled")]
    Cancelled,
    /// A storage backend operation failed.
    #[display("storage error")]
    Storage,
    /// A catalog query or update failed.
    #[display("catalog error")]
    Catalog,
    /// Configuration couldn't be loaded or doesn't make sense.
    #[display("configuration error")]
    Config,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NameCollision(_) | Self::Storage | Self::Catalog)
    }
}
