//! Creating backups: full or differential, end to end.

use crate::diff::{FileChange, detect_changes};
use crate::error::{ErrorKind, Result};
use crate::hasher::{FileEntry, SkippedFile, Source, hash_tree};
use crate::manifest::{BackupManifest, ManifestEntry, Source as EntrySource, read_manifest, write_manifest};
use crate::name::{Reservation, base_name, candidates};
use crate::progress::{Phase, ProgressSink, Silent, Tracker};
use crate::vault::Vault;
use exn::{OptionExt, ResultExt};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use time::{OffsetDateTime, UtcDateTime};
use timekeep_catalog::{Backup, ChangeType, FileRecord};
use timekeep_storage::store::object_path;
use timekeep_storage::{ContentHash, HashAlgorithm, to_slash};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a successful backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub backup: Backup,
    pub manifest: BackupManifest,
    /// Files found in the source but not captured. They're absent from the
    /// manifest and must be shown as *not* backed up.
    pub skipped: Vec<SkippedFile>,
}

/// The parent of a differential, with what the child needs from it.
struct Parent {
    backup: Backup,
    manifest: BackupManifest,
    /// Storage-root relative object path of every file, as the parent
    /// recorded it.
    object_paths: HashMap<String, String>,
}

/// Where a file's bytes ended up.
enum Captured {
    Stored { hash: ContentHash, size: u64 },
    Skipped(String),
}

impl Vault {
    /// Back up a local file or directory.
    ///
    /// With a parent, only files that are new or changed since the parent are
    /// copied; without one, everything is.
    pub async fn create_backup(
        &self,
        session_id: &str,
        source_path: impl AsRef<Path>,
        parent_backup_id: Option<&str>,
    ) -> Result<BackupReport> {
        let source = Source::open_with(source_path, self.options.follow_symlinks)?;
        self.create_backup_from(session_id, &source, parent_backup_id, &Silent, &CancellationToken::new())
            .await
    }

    /// Back up any [`Source`], reporting progress and stopping early if
    /// `cancel` fires.
    ///
    /// Nothing is visible until the very end: objects are written first, then
    /// the manifest, then the catalog rows in one transaction. If any step
    /// fails (or the operation is cancelled) the backup directory is removed
    /// again.
    #[tracing::instrument(level = "info", skip_all, fields(source = %source.location().display(), parent = ?parent_backup_id))]
    pub async fn create_backup_from(
        &self,
        session_id: &str,
        source: &Source,
        parent_backup_id: Option<&str>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        let parent = match parent_backup_id {
            Some(id) => Some(self.load_parent(id).await?),
            None => None,
        };
        // Whole seconds: the catalog and the backup name can't hold more.
        let created_at = UtcDateTime::from_unix_timestamp(UtcDateTime::now().unix_timestamp())
            .or_raise(|| ErrorKind::Write(source.base_name()))?;
        let reservation = self.reserve_name(&base_name(&source.base_name(), created_at)).await?;
        let name = reservation.name().to_string();
        tracing::info!(backup = %name, full = parent.is_none(), "Creating backup");

        let result = self.build(session_id, source, parent.as_ref(), &name, created_at, progress, cancel).await;
        if let Err(e) = &result {
            tracing::warn!(backup = %name, error = %e, "Backup failed, removing partial data");
            if let Err(cleanup) = self.store.remove_backup(&name).await {
                tracing::warn!(backup = %name, error = %cleanup, "Failed to remove partial backup");
            }
        }
        drop(reservation);
        result
    }

    async fn load_parent(&self, id: &str) -> Result<Parent> {
        let backup = self
            .repo
            .get_backup(id)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .ok_or_raise(|| ErrorKind::ParentNotFound(id.to_string()))?;
        let manifest = read_manifest(self.store.backend().as_ref(), &backup.name).await.or_raise(|| {
            ErrorKind::ParentChainBroken { backup: backup.name.clone(), ancestor: backup.name.clone() }
        })?;
        let object_paths = self
            .repo
            .list_file_records(&backup.id)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .into_iter()
            .filter_map(|r| r.backup_file_path.map(|p| (r.relative_path, p)))
            .collect();
        Ok(Parent { backup, manifest, object_paths })
    }

    /// Claim the first free variant of `preferred`: not in the catalog, not
    /// being written by this process and without a directory on disk.
    async fn reserve_name(&self, preferred: &str) -> Result<Reservation> {
        let known = self.repo.list_backup_names().await.or_raise(|| ErrorKind::Catalog)?;
        for candidate in candidates(preferred).filter(|c| !known.contains(c)) {
            let Some(reservation) = self.reservations.reserve(&candidate) else {
                continue;
            };
            if !self.store.has_backup(&candidate).await.or_raise(|| ErrorKind::Storage)? {
                return Ok(reservation);
            }
        }
        exn::bail!(ErrorKind::NameCollision(preferred.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        session_id: &str,
        source: &Source,
        parent: Option<&Parent>,
        name: &str,
        created_at: UtcDateTime,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        // Differentials hash like their parent, or nothing would compare equal.
        let algorithm = parent.map_or(self.options.hash_algorithm, |p| p.manifest.hash_algorithm);
        let tree = hash_tree(source, algorithm, self.options.concurrency, progress, cancel).await?;
        let mut skipped = tree.skipped;

        let parent_entries = parent.map(|p| parent_entries(&p.manifest, &skipped)).unwrap_or_default();
        let changes = detect_changes(&tree.entries, &parent_entries);

        let to_copy: Vec<&FileChange> = changes.iter().filter(|c| c.change.needs_content()).collect();
        let captured = self.copy_changed(source, name, algorithm, &to_copy, progress, cancel).await?;
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }

        let mut entries = Vec::with_capacity(changes.len());
        let mut records = Vec::with_capacity(changes.len());
        let id = Uuid::new_v4().to_string();
        for change in &changes {
            let Some((entry, backup_file_path)) = self.entry_for(change, name, parent, &captured, &mut skipped)? else {
                continue;
            };
            records.push(FileRecord {
                id: None,
                backup_id: id.clone(),
                relative_path: entry.relative_path.clone(),
                content_hash: entry.content_hash.clone(),
                size_bytes: entry.size_bytes,
                modified_at: change.current.as_ref().and_then(|c| c.modified_at),
                change_type: entry.change_type,
                backup_file_path,
            });
            entries.push(entry);
        }
        skipped.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest = BackupManifest::new(
            name,
            OffsetDateTime::from_unix_timestamp(created_at.unix_timestamp()).or_raise(|| ErrorKind::Write(name.to_string()))?,
            parent.map(|p| p.backup.name.clone()),
            algorithm,
            entries,
        );
        // Hash what was captured, which isn't always what was first hashed.
        let content_hash = algorithm.combine(manifest.present().map(|e| (e.relative_path.as_str(), &e.content_hash)));
        let backup = Backup {
            id,
            name: name.to_string(),
            source_path: source.location().to_path_buf(),
            created_at,
            parent_backup_id: parent.map(|p| p.backup.id.clone()),
            is_full_backup: parent.is_none(),
            session_id: session_id.to_string(),
            file_count: manifest.file_count,
            total_size: manifest.total_size_bytes,
            content_hash,
            hash_algorithm: algorithm,
            synced_at: None,
        };

        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        write_manifest(self.store.backend().as_ref(), &manifest).await?;
        self.repo
            .record_backup(&backup, &records, &Self::source_key(source.location()))
            .await
            .or_raise(|| ErrorKind::Catalog)?;
        tracing::info!(
            backup = %backup.name,
            files = backup.file_count,
            bytes = backup.total_size,
            skipped = skipped.len(),
            "Backup created"
        );
        Ok(BackupReport { backup, manifest, skipped })
    }

    /// Copy the bytes of every added or modified file into the backup.
    ///
    /// Files are grouped by the hash they had when scanned so that one object
    /// is written per distinct content, and no two tasks ever write the same
    /// object. Unreadable files are skipped; a failing destination aborts.
    async fn copy_changed(
        &self,
        source: &Source,
        name: &str,
        algorithm: HashAlgorithm,
        changes: &[&FileChange],
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Captured>> {
        let mut groups: BTreeMap<&ContentHash, Vec<&str>> = BTreeMap::new();
        for change in changes {
            if let Some(current) = &change.current {
                groups.entry(&current.hash).or_default().push(current.relative_path.as_str());
            }
        }

        let mut tracker = Tracker::new(progress, Phase::Copying, changes.len());
        let mut captured = HashMap::with_capacity(changes.len());
        let mut copies = stream::iter(groups)
            .map(|(expected, paths)| self.copy_group(source, name, algorithm, expected, paths, cancel))
            .buffer_unordered(self.options.concurrency.max(1));
        while let Some(group) = copies.try_next().await? {
            for (path, outcome) in group {
                tracker.step(path.clone());
                captured.insert(path, outcome);
            }
        }
        Ok(captured)
    }

    async fn copy_group(
        &self,
        source: &Source,
        name: &str,
        algorithm: HashAlgorithm,
        expected: &ContentHash,
        paths: Vec<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Captured)>> {
        let mut outcomes = Vec::with_capacity(paths.len());
        // Size of the object once one of the group's files has been stored.
        let mut stored: Option<u64> = None;
        for path in paths {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            if let Some(size) = stored {
                outcomes.push((path.to_string(), Captured::Stored { hash: expected.clone(), size }));
                continue;
            }
            let reader = match source.backend().reader(Path::new(path)).await {
                Ok(reader) => reader,
                Err(e) => {
                    let reason = (*e).to_string();
                    tracing::warn!(path, error = %reason, "Skipping file that can no longer be read");
                    outcomes.push((path.to_string(), Captured::Skipped(reason)));
                    continue;
                },
            };
            let ingested = self.store.ingest(name, algorithm, reader).await.or_raise(|| ErrorKind::Write(name.to_string()))?;
            if &ingested.hash == expected {
                stored = Some(ingested.size);
            } else {
                tracing::warn!(path, "File changed while being backed up, keeping the copied version");
            }
            outcomes.push((path.to_string(), Captured::Stored { hash: ingested.hash, size: ingested.size }));
        }
        Ok(outcomes)
    }

    /// The manifest entry of one change, and where its bytes live relative to
    /// the storage root. `None` if the file wasn't captured after all.
    fn entry_for(
        &self,
        change: &FileChange,
        name: &str,
        parent: Option<&Parent>,
        captured: &HashMap<String, Captured>,
        skipped: &mut Vec<SkippedFile>,
    ) -> Result<Option<(ManifestEntry, Option<String>)>> {
        let path = &change.relative_path;
        let entry = |hash: &ContentHash, size: u64, source: EntrySource| ManifestEntry {
            relative_path: path.clone(),
            content_hash: hash.clone(),
            size_bytes: size,
            change_type: change.change,
            source,
        };
        Ok(Some(match (change.change, &change.current, &change.parent) {
            (ChangeType::Added | ChangeType::Modified, Some(_), _) => match captured.get(path) {
                Some(Captured::Stored { hash, size }) => {
                    let object = object_path(name, hash).or_raise(|| ErrorKind::Write(name.to_string()))?;
                    let object = to_slash(&object).or_raise(|| ErrorKind::Write(name.to_string()))?;
                    (entry(hash, *size, EntrySource::Current), Some(object))
                },
                Some(Captured::Skipped(reason)) => {
                    skipped.push(SkippedFile { path: path.clone(), reason: reason.clone() });
                    return Ok(None);
                },
                None => exn::bail!(ErrorKind::Write(name.to_string())),
            },
            (ChangeType::Unchanged, Some(current), Some(previous)) => {
                let object = parent.and_then(|p| p.object_paths.get(path)).cloned();
                (entry(&previous.hash, current.size_bytes, EntrySource::Parent), object)
            },
            (ChangeType::Deleted, None, Some(previous)) => (entry(&previous.hash, previous.size_bytes, EntrySource::Parent), None),
            _ => exn::bail!(ErrorKind::Write(name.to_string())),
        }))
    }
}

/// The parent's logical tree, minus anything this run couldn't read.
///
/// A file that's unreadable now isn't gone; leaving it on the parent side
/// would report it as deleted. A skip without a path means the listing is
/// incomplete somewhere unknown, so nothing can be reported as deleted.
fn parent_entries(manifest: &BackupManifest, skipped: &[SkippedFile]) -> Vec<FileEntry> {
    let is_skipped = |path: &str| {
        skipped.iter().any(|s| {
            s.path.is_empty()
                || path == s.path
                || path.strip_prefix(s.path.as_str()).is_some_and(|rest| rest.starts_with('/'))
        })
    };
    manifest
        .present()
        .filter(|e| !is_skipped(&e.relative_path))
        .map(|e| FileEntry {
            relative_path: e.relative_path.clone(),
            hash: e.content_hash.clone(),
            size_bytes: e.size_bytes,
            modified_at: None,
        })
        .collect()
}
