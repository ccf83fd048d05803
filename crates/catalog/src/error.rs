//! Catalog Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    #[display("backup not found: {_0}")]
    BackupNotFound(#[error(not(source))] String),
    /// A row couldn't be converted to or from its model.
    #[display("invalid catalog data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// Rows would contradict each other (e.g. a differential without a parent).
    #[display("catalog constraint violated: {_0}")]
    Constraint(#[error(not(source))] &'static str),
    /// Other backups use this one as their parent.
    #[display("backup {_0} is the parent of {_1} other backup(s)")]
    HasDependents(#[error(not(source))] String, #[error(not(source))] u64),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }
}
