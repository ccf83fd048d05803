//! Differential backups of files and folders.
//!
//! A backup is either *full* (every file's bytes are copied) or
//! *differential* (only files added or modified since a parent backup are
//! copied; everything else refers back up the chain). Each backup owns a
//! content-addressed object store and a manifest describing its complete
//! logical tree, so any backup can be [reconstructed](Vault::reconstruct).
//!
//! ```no_run
//! # async fn example() -> timekeep_backup::Result<()> {
//! use timekeep_backup::Vault;
//! use timekeep_config::Config;
//!
//! let vault = Vault::open(&Config::for_root("/srv/timekeep")).await?;
//! let first = vault.create_backup("session-1", "/home/me/thesis", None).await?;
//! let second = vault.create_backup("session-2", "/home/me/thesis", Some(first.backup.id.as_str())).await?;
//! let restored = vault.reconstruct(&second.backup.name).await?;
//! println!("restored to {}", restored.path.display());
//! vault.close().await;
//! # Ok(())
//! # }
//! ```

mod create;
pub mod diff;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod name;
pub mod progress;
mod restore;
mod vault;

pub use crate::create::BackupReport;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::hasher::{FileEntry, SkippedFile, Source, TreeHash, hash_directory, hash_file, hash_path};
pub use crate::manifest::{BackupManifest, ManifestEntry};
pub use crate::restore::Reconstruction;
pub use crate::vault::{FolderMatch, Options, Vault, similarity};
