//! Reconstruction: materializing the complete file tree of any backup.
//!
//! A differential only stores what changed; everything else is found by
//! walking `parentBackupName` links, one path at a time, until the backup
//! holding the bytes is reached.

use crate::error::{ErrorKind, Result};
use crate::hasher::hash_file;
use crate::manifest::{BackupManifest, Source, read_manifest};
use crate::progress::{Phase, ProgressSink, Silent, Tracker};
use crate::vault::Vault;
use exn::{OptionExt, ResultExt};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use timekeep_storage::{ContentHash, HashAlgorithm, StorageBackend, to_slash};
use tokio_util::sync::CancellationToken;

/// Outcome of a reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconstruction {
    /// Directory holding the materialized tree.
    pub path: PathBuf,
    /// Files copied out of the object stores.
    pub written: u64,
    /// Files that were already in place with the right content.
    pub up_to_date: u64,
    /// Files removed because they aren't part of the backup.
    pub removed: u64,
    /// Files whose content couldn't be found. Always empty in strict mode,
    /// which fails instead.
    pub missing: Vec<String>,
}

/// A file of the logical tree and the backup whose store holds its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resolved {
    relative_path: String,
    owner: String,
    hash: ContentHash,
}

#[derive(Debug)]
enum Lookup {
    Found(Resolved),
    /// The named ancestor should hold the file but doesn't.
    Missing(String),
}

/// Manifests of one chain, read at most once each.
struct Chain<'a> {
    backend: &'a dyn StorageBackend,
    target: String,
    manifests: HashMap<String, BackupManifest>,
}
impl<'a> Chain<'a> {
    fn new(backend: &'a dyn StorageBackend, target: BackupManifest) -> Self {
        let name = target.backup_name.clone();
        Self { backend, target: name.clone(), manifests: HashMap::from([(name, target)]) }
    }

    fn broken(&self, ancestor: &str) -> ErrorKind {
        ErrorKind::ParentChainBroken { backup: self.target.clone(), ancestor: ancestor.to_string() }
    }

    async fn load(&mut self, name: &str) -> Result<&BackupManifest> {
        if !self.manifests.contains_key(name) {
            let manifest = read_manifest(self.backend, name).await.or_raise(|| self.broken(name))?;
            self.manifests.insert(name.to_string(), manifest);
        }
        self.manifests.get(name).ok_or_raise(|| self.broken(name))
    }

    /// Read every manifest from the target up to the full backup at the root
    /// of the chain. Any one of them missing breaks the whole chain, whether
    /// or not a file still depends on it.
    async fn load_ancestors(&mut self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut next = Some(self.target.clone());
        while let Some(name) = next {
            if !visited.insert(name.clone()) {
                exn::bail!(self.broken(&name));
            }
            next = self.load(&name).await?.parent_backup_name.clone();
        }
        Ok(())
    }

    /// Follow one path up the chain to the backup that stored it.
    ///
    /// A missing or unreadable ancestor manifest is always an error; an
    /// ancestor that no longer lists the path is reported as
    /// [`Lookup::Missing`].
    async fn resolve(&mut self, relative_path: &str) -> Result<Lookup> {
        let mut name = self.target.clone();
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(name.clone()) {
                // A chain that loops back on itself.
                exn::bail!(self.broken(&name));
            }
            let manifest = self.load(&name).await?;
            let Some(entry) = manifest.get(relative_path).filter(|e| e.is_present()) else {
                return Ok(Lookup::Missing(name));
            };
            match entry.source {
                Source::Current => {
                    return Ok(Lookup::Found(Resolved {
                        relative_path: relative_path.to_string(),
                        owner: name,
                        hash: entry.content_hash.clone(),
                    }));
                },
                Source::Parent => {
                    let Some(parent) = manifest.parent_backup_name.clone() else {
                        exn::bail!(self.broken(&name));
                    };
                    name = parent;
                },
            }
        }
    }
}

impl Vault {
    /// Materialize a backup's logical tree under the restore root.
    pub async fn reconstruct(&self, backup_name: &str) -> Result<Reconstruction> {
        self.reconstruct_with(backup_name, &Silent, &CancellationToken::new()).await
    }

    /// Materialize a backup into `{restore_root}/{backup_name}`.
    ///
    /// Safe to repeat: files already holding the right bytes are left alone,
    /// stale ones are rewritten and anything that isn't part of the backup is
    /// removed, so the result is the same however often it runs.
    #[tracing::instrument(level = "info", skip(self, progress, cancel))]
    pub async fn reconstruct_with(
        &self,
        backup_name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Reconstruction> {
        let storage = self.store.backend().as_ref();
        let manifest = read_manifest(storage, backup_name).await?;
        let algorithm = manifest.hash_algorithm;
        let wanted: Vec<(String, ContentHash)> =
            manifest.present().map(|e| (e.relative_path.clone(), e.content_hash.clone())).collect();

        let mut chain = Chain::new(storage, manifest);
        chain.load_ancestors().await?;
        let mut report = Reconstruction {
            path: self.restore.local_path(Path::new(backup_name)).unwrap_or_else(|| PathBuf::from(backup_name)),
            ..Reconstruction::default()
        };
        let mut resolved = Vec::with_capacity(wanted.len());
        for (relative_path, hash) in wanted {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let lookup = match chain.resolve(&relative_path).await? {
                Lookup::Found(found) if found.hash != hash => {
                    tracing::warn!(path = %relative_path, owner = %found.owner, "Ancestor holds different content");
                    Lookup::Missing(found.owner)
                },
                Lookup::Found(found) => {
                    if self.store.contains(&found.owner, &found.hash).await.or_raise(|| ErrorKind::Storage)? {
                        Lookup::Found(found)
                    } else {
                        tracing::warn!(path = %relative_path, owner = %found.owner, "Object is missing from its backup");
                        Lookup::Missing(found.owner)
                    }
                },
                missing => missing,
            };
            match lookup {
                Lookup::Found(found) => resolved.push(found),
                Lookup::Missing(ancestor) if self.options.strict_reconstruction => exn::bail!(chain.broken(&ancestor)),
                Lookup::Missing(_) => {
                    tracing::warn!(backup = backup_name, path = %relative_path, "Skipping file with missing content");
                    report.missing.push(relative_path);
                },
            }
        }

        let root = PathBuf::from(backup_name);
        let mut tracker = Tracker::new(progress, Phase::Restoring, resolved.len());
        let keep: BTreeSet<String> = resolved.iter().map(|r| r.relative_path.clone()).collect();
        let mut restores = stream::iter(resolved)
            .map(|file| {
                let root = &root;
                async move {
                    if cancel.is_cancelled() {
                        exn::bail!(ErrorKind::Cancelled);
                    }
                    let written = self.materialize(&file, root, algorithm).await?;
                    Ok((file.relative_path, written))
                }
            })
            .buffer_unordered(self.options.concurrency.max(1));
        while let Some((path, written)) = restores.try_next().await? {
            if written {
                report.written += 1;
            } else {
                report.up_to_date += 1;
            }
            tracker.step(path);
        }
        drop(restores);

        report.removed = self.remove_extra_files(&root, &keep).await?;
        tracing::info!(
            backup = backup_name,
            written = report.written,
            up_to_date = report.up_to_date,
            removed = report.removed,
            "Backup reconstructed"
        );
        Ok(report)
    }

    /// Put one file in place; `false` if it already was.
    async fn materialize(&self, file: &Resolved, root: &Path, algorithm: HashAlgorithm) -> Result<bool> {
        let target = root.join(&file.relative_path);
        let restore = self.restore.as_ref();
        if restore.exists(&target).await.or_raise(|| ErrorKind::Storage)? {
            match hash_file(restore, &target, algorithm).await {
                Ok(existing) if existing.hash == file.hash => return Ok(false),
                Ok(_) => tracing::debug!(path = %file.relative_path, "Replacing stale file"),
                Err(e) => tracing::debug!(path = %file.relative_path, error = %e, "Replacing unreadable file"),
            }
        }
        self.store
            .export(&file.owner, &file.hash, algorithm, restore, &target)
            .await
            .or_raise(|| ErrorKind::Write(root.display().to_string()))?;
        Ok(true)
    }

    /// Delete everything under `root` that isn't in `keep`.
    async fn remove_extra_files(&self, root: &Path, keep: &BTreeSet<String>) -> Result<u64> {
        let restore = self.restore.as_ref();
        let existing = restore.list(Some(root)).await.or_raise(|| ErrorKind::Storage)?;
        let mut removed = 0;
        for file in existing {
            let relative = file.path.strip_prefix(root).ok().map(to_slash);
            if let Some(Ok(relative)) = relative
                && keep.contains(&relative)
            {
                continue;
            }
            tracing::debug!(path = %file.path.display(), "Removing file not in backup");
            restore.delete(&file.path).await.or_raise(|| ErrorKind::Write(root.display().to_string()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestEntry, write_manifest};
    use time::OffsetDateTime;
    use timekeep_catalog::ChangeType;
    use timekeep_storage::backend::MockBackend;

    fn entry(path: &str, content: &str, change: ChangeType, source: Source) -> ManifestEntry {
        ManifestEntry {
            relative_path: path.to_string(),
            content_hash: HashAlgorithm::Sha256.hash_bytes(content),
            size_bytes: content.len() as u64,
            change_type: change,
            source,
        }
    }

    fn manifest(name: &str, parent: Option<&str>, entries: Vec<ManifestEntry>) -> BackupManifest {
        BackupManifest::new(name, OffsetDateTime::UNIX_EPOCH, parent.map(str::to_string), HashAlgorithm::Sha256, entries)
    }

    /// b1: a=hello, b=world; b2: a=HELLO; b3: a unchanged, b deleted.
    async fn chain() -> MockBackend {
        let backend = MockBackend::default();
        let b1 = manifest(
            "b1",
            None,
            vec![
                entry("a.txt", "hello", ChangeType::Added, Source::Current),
                entry("b.txt", "world", ChangeType::Added, Source::Current),
            ],
        );
        let b2 = manifest(
            "b2",
            Some("b1"),
            vec![
                entry("a.txt", "HELLO", ChangeType::Modified, Source::Current),
                entry("b.txt", "world", ChangeType::Unchanged, Source::Parent),
            ],
        );
        let b3 = manifest(
            "b3",
            Some("b2"),
            vec![
                entry("a.txt", "HELLO", ChangeType::Unchanged, Source::Parent),
                entry("b.txt", "world", ChangeType::Deleted, Source::Parent),
            ],
        );
        for m in [&b1, &b2, &b3] {
            write_manifest(&backend, m).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_resolve_walks_to_the_owner() {
        let backend = chain().await;
        let b3 = read_manifest(&backend, "b3").await.unwrap();
        let mut chain = Chain::new(&backend, b3);
        let Lookup::Found(a) = chain.resolve("a.txt").await.unwrap() else { panic!("a.txt not found") };
        assert_eq!(a.owner, "b2");
        assert_eq!(a.hash, HashAlgorithm::Sha256.hash_bytes("HELLO"));
        // Deleted in b3, so it's not part of the tree at all.
        assert!(matches!(chain.resolve("b.txt").await.unwrap(), Lookup::Missing(n) if n == "b3"));
        assert!(matches!(chain.resolve("c.txt").await.unwrap(), Lookup::Missing(n) if n == "b3"));

        let b2 = read_manifest(&backend, "b2").await.unwrap();
        let mut chain = Chain::new(&backend, b2);
        assert!(matches!(chain.resolve("b.txt").await.unwrap(), Lookup::Found(r) if r.owner == "b1"));
    }

    #[tokio::test]
    async fn test_resolve_fails_on_missing_ancestor_manifest() {
        let backend = chain().await;
        backend.delete(Path::new("backups/b1/manifest.json")).await.unwrap();
        let b2 = read_manifest(&backend, "b2").await.unwrap();
        let mut chain = Chain::new(&backend, b2);
        // a.txt lives in b2 itself.
        assert!(matches!(chain.resolve("a.txt").await.unwrap(), Lookup::Found(r) if r.owner == "b2"));
        let err = chain.resolve("b.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ParentChainBroken { ancestor, .. } if ancestor == "b1"));
    }

    #[tokio::test]
    async fn test_whole_chain_is_loaded_up_front() {
        let backend = chain().await;
        let b3 = read_manifest(&backend, "b3").await.unwrap();
        let mut chain = Chain::new(&backend, b3);
        chain.load_ancestors().await.unwrap();
        assert_eq!(chain.manifests.len(), 3);

        // Nothing in this b2 depends on b1, but b1 is still part of its chain.
        let backend = MockBackend::default();
        let b1 = manifest("b1", None, vec![entry("a.txt", "hello", ChangeType::Added, Source::Current)]);
        let b2 = manifest("b2", Some("b1"), vec![entry("a.txt", "HELLO", ChangeType::Modified, Source::Current)]);
        write_manifest(&backend, &b1).await.unwrap();
        write_manifest(&backend, &b2).await.unwrap();
        backend.delete(Path::new("backups/b1/manifest.json")).await.unwrap();
        let mut chain = Chain::new(&backend, b2);
        let err = chain.load_ancestors().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ParentChainBroken { ancestor, .. } if ancestor == "b1"));
    }
}
