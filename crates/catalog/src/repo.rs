//! Repository for backups and their file records.
//!
//! Backups and file records are written together: a backup row is never
//! visible without its records, and deleting a backup cascades to them.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{Backup, BackupRow, FileMatch, FileMatchRow, FileRecord, FileRecordRow};
use exn::{OptionExt, ResultExt};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use time::UtcDateTime;
use timekeep_storage::ContentHash;

/// Queries and mutations against the backup catalog.
///
/// # Relationships
///
/// - A backup owns its file records; deleting the backup deletes them.
/// - A differential backup references its parent; a parent can't be deleted
///   while any backup still references it.
/// - A tracked source points at the most recent backup of a folder, keyed by
///   the hash of the folder's path.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn backups(rows: Vec<BackupRow>) -> Result<Vec<Backup>> {
        rows.into_iter().map(Backup::try_from).collect()
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Record a backup, all of its file records and the tracked source entry
    /// in a single transaction.
    ///
    /// Either everything is visible afterwards, or nothing is.
    #[tracing::instrument(level = "debug", skip_all, fields(backup = %backup.name, records = records.len()))]
    pub async fn record_backup(&self, backup: &Backup, records: &[FileRecord], source_key: &ContentHash) -> Result<()> {
        let backup_row = BackupRow::try_from(backup)?;
        let record_rows = records
            .iter()
            .map(|record| {
                if record.backup_id != backup.id {
                    exn::bail!(ErrorKind::Constraint("file record belongs to another backup"));
                }
                FileRecordRow::try_from(record)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/insert_backup.sql"))
            .bind(&backup_row.id)
            .bind(&backup_row.name)
            .bind(&backup_row.source_path)
            .bind(backup_row.created_at)
            .bind(&backup_row.parent_backup_id)
            .bind(backup_row.is_full_backup)
            .bind(&backup_row.session_id)
            .bind(backup_row.file_count)
            .bind(backup_row.total_size)
            .bind(&backup_row.content_hash)
            .bind(&backup_row.hash_algorithm)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for row in record_rows {
            sqlx::query(include_str!("../queries/insert_file_record.sql"))
                .bind(row.backup_id)
                .bind(row.relative_path)
                .bind(row.content_hash)
                .bind(row.size_bytes)
                .bind(row.modified_at)
                .bind(row.change_type)
                .bind(row.backup_file_path)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        sqlx::query(include_str!("../queries/upsert_tracked_source.sql"))
            .bind(source_key.as_str())
            .bind(&backup_row.source_path)
            .bind(&backup_row.id)
            .bind(backup_row.created_at)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn get_backup(&self, id: impl AsRef<str>) -> Result<Option<Backup>> {
        let row: Option<BackupRow> = sqlx::query_as(include_str!("../queries/get_backup_by_id.sql"))
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Backup::try_from).transpose()
    }

    pub async fn get_backup_by_name(&self, name: impl AsRef<str>) -> Result<Option<Backup>> {
        let row: Option<BackupRow> = sqlx::query_as(include_str!("../queries/get_backup_by_name.sql"))
            .bind(name.as_ref())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Backup::try_from).transpose()
    }

    /// Like [`get_backup`](Self::get_backup), but a missing backup is an error.
    pub async fn require_backup(&self, id: impl AsRef<str>) -> Result<Backup> {
        let id = id.as_ref();
        self.get_backup(id).await?.ok_or_raise(|| ErrorKind::BackupNotFound(id.to_string()))
    }

    /// Most recent backup of a tracked source, keyed by the hash of its path.
    pub async fn latest_for_source(&self, source_key: &ContentHash) -> Result<Option<Backup>> {
        let row: Option<BackupRow> = sqlx::query_as(include_str!("../queries/get_latest_for_source.sql"))
            .bind(source_key.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Backup::try_from).transpose()
    }

    /// Every file record with this content hash, across all backups.
    ///
    /// Deleted records are left out: they describe content that's gone.
    pub async fn find_files_by_hash(&self, hash: &ContentHash) -> Result<Vec<FileMatch>> {
        let rows: Vec<FileMatchRow> = sqlx::query_as(include_str!("../queries/find_files_by_hash.sql"))
            .bind(hash.as_str())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileMatch::try_from).collect()
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// All backups, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        let rows: Vec<BackupRow> = sqlx::query_as(include_str!("../queries/list_backups.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::backups(rows)
    }

    pub async fn list_backups_for_session(&self, session_id: impl AsRef<str>) -> Result<Vec<Backup>> {
        let rows: Vec<BackupRow> = sqlx::query_as(include_str!("../queries/list_backups_for_session.sql"))
            .bind(session_id.as_ref())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::backups(rows)
    }

    /// Names of every recorded backup.
    ///
    /// Cheaper than [`list_backups`](Self::list_backups) when comparing
    /// against the directories on disk.
    pub async fn list_backup_names(&self) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_backup_names.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(names.into_iter().collect())
    }

    /// File records of a backup, sorted by path.
    pub async fn list_file_records(&self, backup_id: impl AsRef<str>) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRecordRow> = sqlx::query_as(include_str!("../queries/list_file_records.sql"))
            .bind(backup_id.as_ref())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Distinct content hashes of the files present in a backup.
    pub async fn list_hashes(&self, backup_id: impl AsRef<str>) -> Result<BTreeSet<ContentHash>> {
        let hashes: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_hashes_for_backup.sql"))
            .bind(backup_id.as_ref())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        hashes
            .into_iter()
            .map(|h| h.parse::<ContentHash>().or_raise(|| ErrorKind::InvalidData("content hash")))
            .collect()
    }

    pub async fn count_children(&self, backup_id: impl AsRef<str>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_children.sql"))
            .bind(backup_id.as_ref())
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("child count"))
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Flag a backup as synchronized. Returns `false` if there's no such backup.
    pub async fn mark_synced(&self, backup_id: impl AsRef<str>, at: UtcDateTime) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/mark_synced.sql"))
            .bind(at.unix_timestamp())
            .bind(backup_id.as_ref())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete one backup and its file records.
    ///
    /// Fails with [`HasDependents`](ErrorKind::HasDependents) if any other
    /// backup uses it as a parent.
    pub async fn delete_backup(&self, backup_id: impl AsRef<str>) -> Result<Backup> {
        let backup_id = backup_id.as_ref();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let row: Option<BackupRow> = sqlx::query_as(include_str!("../queries/get_backup_by_id.sql"))
            .bind(backup_id)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let backup = Backup::try_from(row.ok_or_raise(|| ErrorKind::BackupNotFound(backup_id.to_string()))?)?;
        let children: i64 = sqlx::query_scalar(include_str!("../queries/count_children.sql"))
            .bind(backup_id)
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if children > 0 {
            exn::bail!(ErrorKind::HasDependents(backup.name, children.unsigned_abs()));
        }
        sqlx::query(include_str!("../queries/delete_backup.sql"))
            .bind(backup_id)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(backup)
    }

    /// Delete every backup of a session, and their file records, together.
    ///
    /// Backups of the same session may depend on each other; backups of other
    /// sessions may not depend on any of them.
    pub async fn delete_session(&self, session_id: impl AsRef<str>) -> Result<Vec<Backup>> {
        let session_id = session_id.as_ref();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let external: i64 = sqlx::query_scalar(include_str!("../queries/count_external_children.sql"))
            .bind(session_id)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if external > 0 {
            exn::bail!(ErrorKind::HasDependents(format!("session {session_id}"), external.unsigned_abs()));
        }
        let rows: Vec<BackupRow> = sqlx::query_as(include_str!("../queries/list_backups_for_session.sql"))
            .bind(session_id)
            .fetch_all(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let backups = Self::backups(rows)?;
        sqlx::query(include_str!("../queries/delete_session.sql"))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(backups)
    }
}
