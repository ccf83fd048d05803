//! The [`Vault`]: everything a backup operation needs, opened once and passed
//! around explicitly.

use crate::error::{ErrorKind, Result};
use crate::manifest::{BackupManifest, read_manifest};
use crate::name::NameReservations;
use exn::{OptionExt, ResultExt};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use timekeep_catalog::error::ErrorKind as CatalogErrorKind;
use timekeep_catalog::{Backup, Database, FileMatch, FileRecord, Repository};
use timekeep_config::Config;
use timekeep_storage::backend::LocalBackend;
use timekeep_storage::{BackendHandle, ContentHash, ContentStore, HashAlgorithm};

/// Tunables that don't change for the lifetime of a [`Vault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Algorithm for full backups; differentials inherit their parent's.
    pub hash_algorithm: HashAlgorithm,
    /// Files hashed or copied at once within one backup.
    pub concurrency: usize,
    /// Missing ancestor content fails reconstruction instead of being skipped.
    pub strict_reconstruction: bool,
    /// Back up the files symbolic links point to instead of skipping them.
    pub follow_symlinks: bool,
}
impl Default for Options {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::default(),
            concurrency: 4,
            strict_reconstruction: true,
            follow_symlinks: false,
        }
    }
}
impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            hash_algorithm: config.hash_algorithm,
            concurrency: config.concurrency,
            strict_reconstruction: config.strict_reconstruction,
            follow_symlinks: config.follow_symlinks,
        }
    }
}

/// Backups that share a file with a given hash, grouped per backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMatch {
    pub backup_id: String,
    pub backup_name: String,
    pub session_id: String,
    pub source_path: PathBuf,
    pub backup_created_at: UtcDateTime,
    /// Paths within the backup whose content has the hash.
    pub paths: Vec<String>,
}

/// Handle on a storage root, its catalog and its restore area.
///
/// Cheap to clone; clones share the database pool and the set of backup names
/// currently being written.
#[derive(Clone)]
pub struct Vault {
    pub(crate) store: ContentStore,
    pub(crate) restore: BackendHandle,
    pub(crate) db: Database,
    pub(crate) repo: Repository,
    pub(crate) options: Options,
    pub(crate) reservations: NameReservations,
}

impl Vault {
    /// Open the vault described by a configuration.
    ///
    /// Creates the storage and restore roots if needed, connects to the
    /// catalog and applies any pending migrations.
    #[tracing::instrument(level = "info", skip_all, fields(root = %config.storage_root.display()))]
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let storage = LocalBackend::new("storage", &config.storage_root).or_raise(|| ErrorKind::Storage)?;
        let restore = LocalBackend::new("restore", config.restore_path()).or_raise(|| ErrorKind::Storage)?;
        let db = Database::connect(config.catalog_path()).await.or_raise(|| ErrorKind::Catalog)?;
        Ok(Self::with_parts(Arc::new(storage), Arc::new(restore), db, Options::from(config)))
    }

    /// Assemble a vault from already opened parts.
    pub fn with_parts(storage: BackendHandle, restore: BackendHandle, db: Database, options: Options) -> Self {
        Self {
            store: ContentStore::new(storage),
            restore,
            repo: Repository::from(&db),
            db,
            options,
            reservations: NameReservations::default(),
        }
    }

    /// Close the catalog. The vault (and its clones) must not be used after.
    pub async fn close(self) {
        self.db.close().await;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Key of a tracked source in the catalog.
    ///
    /// Always SHA-256 of the path string so that changing the configured
    /// algorithm doesn't orphan the "latest backup" of every source.
    pub fn source_key(path: impl AsRef<Path>) -> ContentHash {
        crate::hasher::hash_path(path, HashAlgorithm::Sha256)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_backup(&self, id: &str) -> Result<Backup> {
        self.repo
            .get_backup(id)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .ok_or_raise(|| ErrorKind::BackupNotFound(id.to_string()))
    }

    pub async fn get_backup_by_name(&self, name: &str) -> Result<Backup> {
        self.repo
            .get_backup_by_name(name)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .ok_or_raise(|| ErrorKind::BackupNotFound(name.to_string()))
    }

    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.repo.list_backups().await.or_raise(|| ErrorKind::Catalog)
    }

    pub async fn list_session_backups(&self, session_id: &str) -> Result<Vec<Backup>> {
        self.repo.list_backups_for_session(session_id).await.or_raise(|| ErrorKind::Catalog)
    }

    /// The most recent backup of a source, to offer as the parent of the
    /// next one.
    pub async fn latest_backup_for_source(&self, source_path: impl AsRef<Path>) -> Result<Option<Backup>> {
        let key = Self::source_key(source_path);
        self.repo.latest_for_source(&key).await.or_raise(|| ErrorKind::Catalog)
    }

    /// Every file recorded for a backup, deleted entries included.
    pub async fn folder_contents(&self, backup_id: &str) -> Result<Vec<FileRecord>> {
        self.get_backup(backup_id).await?;
        self.repo.list_file_records(backup_id).await.or_raise(|| ErrorKind::Catalog)
    }

    /// Every recorded file, in any backup, whose content has this hash.
    pub async fn find_files_by_hash(&self, hash: &ContentHash) -> Result<Vec<FileMatch>> {
        self.repo.find_files_by_hash(hash).await.or_raise(|| ErrorKind::Catalog)
    }

    /// Like [`find_files_by_hash`](Self::find_files_by_hash), grouped by
    /// backup.
    pub async fn find_folders_with_file_hash(&self, hash: &ContentHash) -> Result<Vec<FolderMatch>> {
        Ok(group_by_backup(self.find_files_by_hash(hash).await?))
    }

    /// Percentage (0 to 100) of shared distinct content between two backups.
    pub async fn folder_similarity(&self, backup_a: &str, backup_b: &str) -> Result<f64> {
        self.get_backup(backup_a).await?;
        self.get_backup(backup_b).await?;
        let a = self.repo.list_hashes(backup_a).await.or_raise(|| ErrorKind::Catalog)?;
        let b = self.repo.list_hashes(backup_b).await.or_raise(|| ErrorKind::Catalog)?;
        Ok(similarity(&a, &b))
    }

    pub async fn read_manifest(&self, backup_name: &str) -> Result<BackupManifest> {
        read_manifest(self.store.backend().as_ref(), backup_name).await
    }

    /// Re-hash every object a backup stores itself, returning the hashes
    /// that are missing or whose bytes no longer match.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn verify_backup(&self, backup_name: &str) -> Result<Vec<ContentHash>> {
        let manifest = self.read_manifest(backup_name).await?;
        let own: BTreeSet<_> = manifest
            .present()
            .filter(|e| e.source == crate::manifest::Source::Current)
            .map(|e| &e.content_hash)
            .collect();
        let mut bad = Vec::new();
        for hash in own {
            let intact = match self.store.verify(backup_name, hash, manifest.hash_algorithm).await {
                Ok(intact) => intact,
                Err(e) if matches!(&*e, timekeep_storage::error::ErrorKind::NotFound(_)) => false,
                Err(e) => return Err(e.raise(ErrorKind::Storage)),
            };
            if !intact {
                tracing::warn!(backup = backup_name, hash = %hash, "Object is missing or corrupt");
                bad.push(hash.clone());
            }
        }
        Ok(bad)
    }

    /// Record that a backup has been synced elsewhere.
    pub async fn mark_synced(&self, backup_id: &str) -> Result<()> {
        let at = UtcDateTime::now();
        if !self.repo.mark_synced(backup_id, at).await.or_raise(|| ErrorKind::Catalog)? {
            exn::bail!(ErrorKind::BackupNotFound(backup_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete one backup: its catalog rows first, then its directory.
    ///
    /// Fails with [`HasDependents`](ErrorKind::HasDependents) while another
    /// backup uses it as a parent.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_backup(&self, backup_id: &str) -> Result<Backup> {
        let backup = self.repo.delete_backup(backup_id).await.map_err(|e| map_delete_error(e, backup_id))?;
        self.remove_directory(&backup.name).await;
        Ok(backup)
    }

    /// Delete every backup of a session in one catalog transaction, then
    /// their directories.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_session_backups(&self, session_id: &str) -> Result<Vec<Backup>> {
        let deleted = self.repo.delete_session(session_id).await.map_err(|e| map_delete_error(e, session_id))?;
        for backup in &deleted {
            self.remove_directory(&backup.name).await;
        }
        Ok(deleted)
    }

    /// Remove backup directories that have no catalog row, returning their
    /// names. Directories of backups still being written are left alone.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        let on_disk = self.store.list_backups().await.or_raise(|| ErrorKind::Storage)?;
        let known = self.repo.list_backup_names().await.or_raise(|| ErrorKind::Catalog)?;
        let mut pruned = Vec::new();
        for name in on_disk.difference(&known) {
            if self.reservations.is_reserved(name) {
                continue;
            }
            tracing::info!(backup = %name, "Removing orphaned backup directory");
            self.store.remove_backup(name).await.or_raise(|| ErrorKind::Storage)?;
            pruned.push(name.clone());
        }
        Ok(pruned)
    }

    /// Catalog rows are gone by the time this runs; a leftover directory is
    /// an orphan that [`prune_orphans`](Self::prune_orphans) will collect.
    async fn remove_directory(&self, name: &str) {
        if let Err(e) = self.store.remove_backup(name).await {
            tracing::warn!(backup = name, error = %e, "Failed to remove backup directory");
        }
    }
}

fn map_delete_error(e: timekeep_catalog::error::Error, subject: &str) -> crate::error::Error {
    let kind = match &*e {
        CatalogErrorKind::HasDependents(..) => ErrorKind::HasDependents(subject.to_string()),
        CatalogErrorKind::BackupNotFound(_) => ErrorKind::BackupNotFound(subject.to_string()),
        _ => ErrorKind::Catalog,
    };
    e.raise(kind)
}

/// `matching / max(|a|, |b|) * 100`; two empty sets have nothing in common.
pub fn similarity(a: &BTreeSet<ContentHash>, b: &BTreeSet<ContentHash>) -> f64 {
    let largest = a.len().max(b.len());
    if largest == 0 {
        return 0.0;
    }
    let matching = a.intersection(b).count();
    matching as f64 / largest as f64 * 100.0
}

fn group_by_backup(matches: Vec<FileMatch>) -> Vec<FolderMatch> {
    let mut folders: Vec<FolderMatch> = Vec::new();
    for found in matches {
        match folders.iter_mut().find(|f| f.backup_id == found.record.backup_id) {
            Some(folder) => folder.paths.push(found.record.relative_path),
            None => folders.push(FolderMatch {
                backup_id: found.record.backup_id,
                backup_name: found.backup_name,
                session_id: found.session_id,
                source_path: found.source_path,
                backup_created_at: found.backup_created_at,
                paths: vec![found.record.relative_path],
            }),
        }
    }
    folders
}
