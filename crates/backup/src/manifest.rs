//! Backup manifests: the authoritative description of a backup's contents.
//!
//! Stored as `backups/{name}/manifest.json`:
//!
//! ```json
//! {
//!   "backupName": "thesis_2026-10-19_09-30-00",
//!   "createdAt": "2026-10-19T09:30:00Z",
//!   "parentBackupName": null,
//!   "isFullBackup": true,
//!   "fileCount": 1,
//!   "totalSizeBytes": 5,
//!   "hashAlgorithm": "sha256",
//!   "entries": [
//!     {
//!       "relativePath": "a.txt",
//!       "contentHash": "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
//!       "sizeBytes": 5,
//!       "changeType": "added",
//!       "source": "current"
//!     }
//!   ]
//! }
//! ```
//!
//! A manifest is written once, after every object of its backup is in
//! place, and never modified afterwards.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use time::OffsetDateTime;
use timekeep_catalog::ChangeType;
use timekeep_storage::backend::StorageBackend;
use timekeep_storage::error::ErrorKind as StorageErrorKind;
use timekeep_storage::store::manifest_path;
use timekeep_storage::{ContentHash, HashAlgorithm};

/// Where the bytes of an entry live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// In this backup's own object store.
    Current,
    /// Somewhere up the parent chain. Deleted entries are also marked
    /// `parent`: their hash is the one the parent recorded.
    Parent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub relative_path: String,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub change_type: ChangeType,
    pub source: Source,
}
impl ManifestEntry {
    /// Whether the entry is part of the backup's logical tree.
    pub fn is_present(&self) -> bool {
        self.change_type != ChangeType::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub parent_backup_name: Option<String>,
    pub is_full_backup: bool,
    /// Files present in the logical tree (deleted entries aren't counted).
    pub file_count: u64,
    pub total_size_bytes: u64,
    /// Manifests written before the algorithm was recorded are SHA-256.
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// Sorted by path, one entry per path.
    pub entries: Vec<ManifestEntry>,
}
impl BackupManifest {
    /// Build a manifest, sorting entries and deriving the totals.
    pub fn new(
        backup_name: impl Into<String>,
        created_at: OffsetDateTime,
        parent_backup_name: Option<String>,
        hash_algorithm: HashAlgorithm,
        mut entries: Vec<ManifestEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let present = entries.iter().filter(|e| e.is_present());
        let (file_count, total_size_bytes) = present.fold((0, 0), |(n, size), e| (n + 1, size + e.size_bytes));
        Self {
            backup_name: backup_name.into(),
            created_at,
            is_full_backup: parent_backup_name.is_none(),
            parent_backup_name,
            file_count,
            total_size_bytes,
            hash_algorithm,
            entries,
        }
    }

    /// Look an entry up by path.
    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Entries of the logical tree, skipping deletions.
    pub fn present(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.is_present())
    }

    /// Structural checks: a manifest that fails them is treated as corrupt.
    fn check(&self) -> std::result::Result<(), &'static str> {
        if self.is_full_backup != self.parent_backup_name.is_none() {
            return Err("full backups have no parent, differentials have one");
        }
        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if !seen.insert(entry.relative_path.as_str()) {
                return Err("duplicate path");
            }
            if self.is_full_backup && entry.source == Source::Parent {
                return Err("full backup refers to a parent");
            }
            if entry.change_type.needs_content() && entry.source != Source::Current {
                return Err("new content must be stored in the backup itself");
            }
        }
        if !self.entries.is_sorted_by(|a, b| a.relative_path <= b.relative_path) {
            return Err("entries are not sorted");
        }
        Ok(())
    }
}

/// Publish a manifest.
///
/// Written to a temporary name and renamed into place, so a manifest that
/// exists is always complete.
#[tracing::instrument(level = "debug", skip_all, fields(backup = %manifest.backup_name))]
pub async fn write_manifest(backend: &dyn StorageBackend, manifest: &BackupManifest) -> Result<()> {
    let write_error = || ErrorKind::Write(manifest.backup_name.clone());
    let path = manifest_path(&manifest.backup_name).or_raise(write_error)?;
    let json = serde_json::to_vec_pretty(manifest).or_raise(write_error)?;
    let mut partial = path.clone().into_os_string();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    backend.write(&partial, &json).await.or_raise(write_error)?;
    backend.rename(&partial, &path).await.or_raise(write_error)?;
    Ok(())
}

/// Read a backup's manifest.
///
/// Missing, unparsable and structurally invalid manifests all fail with
/// [`ManifestNotFound`](ErrorKind::ManifestNotFound).
pub async fn read_manifest(backend: &dyn StorageBackend, backup_name: &str) -> Result<BackupManifest> {
    let not_found = || ErrorKind::ManifestNotFound(backup_name.to_string());
    let path = manifest_path(backup_name).or_raise(not_found)?;
    let bytes = match backend.read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if matches!(&*e, StorageErrorKind::NotFound(_)) => exn::bail!(not_found()),
        Err(e) => return Err(e.raise(ErrorKind::Storage)),
    };
    let manifest: BackupManifest = serde_json::from_slice(&bytes).or_raise(not_found)?;
    if manifest.backup_name != backup_name {
        tracing::warn!(expected = backup_name, found = %manifest.backup_name, "Manifest names another backup");
        exn::bail!(not_found());
    }
    if let Err(reason) = manifest.check() {
        tracing::warn!(backup = backup_name, reason, "Manifest is corrupt");
        exn::bail!(not_found());
    }
    Ok(manifest)
}
