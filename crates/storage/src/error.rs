//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied (permissions or credentials)
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// File already exists (for operations that require new files)
    #[display("file already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// String is not a 64 character hexadecimal digest
    #[display("invalid content hash: {_0}")]
    InvalidHash(#[error(not(source))] String),
    /// Stored bytes don't hash to the name they are stored under
    #[display("content mismatch for {}: expected {expected}, found {actual}", path.display())]
    HashMismatch { path: PathBuf, expected: String, actual: String },
    /// A directory couldn't be listed completely
    #[display("could not list directory: {}", _0.display())]
    ListFailed(#[error(not(source))] PathBuf),
    /// Name of a hash algorithm that isn't supported
    #[display("unknown hash algorithm: {_0}")]
    UnknownAlgorithm(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ListFailed(_) | Self::BackendError(_))
    }

    /// The path this error is about, if there is one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::NotFound(p)
            | Self::PermissionDenied(p)
            | Self::AlreadyExists(p)
            | Self::InvalidPath(p)
            | Self::ListFailed(p) => Some(p),
            Self::HashMismatch { path, .. } => Some(path),
            _ => None,
        }
    }
}
