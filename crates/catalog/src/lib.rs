//! SQLite catalog of backups.
//!
//! The catalog is the index over what's on disk, not the source of truth for
//! backup contents: manifests are. It records which backups exist, how they
//! chain together, which session owns them, and one row per captured file
//! so that similarity and duplicate queries don't need to read manifests.
//!
//! # Schema
//! Migrations live in `migrations/` and are embedded at compile time:
//! - **backups**: one row per backup, with its parent link and directory hash.
//! - **file_records**: one row per path in a backup, cascading on delete.
//! - **tracked_sources**: latest backup of each tracked folder.

mod db;
pub mod error;
pub mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{Backup, ChangeType, FileMatch, FileRecord};
pub use crate::repo::Repository;
