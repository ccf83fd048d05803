use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use time::UtcDateTime;
use timekeep_storage::{ContentHash, HashAlgorithm};

/// One snapshot of a tracked folder or file.
///
/// Immutable once recorded, except for [`synced_at`](Self::synced_at).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: String,
    /// Filesystem-safe, unique name; also the directory name under `backups/`.
    pub name: String,
    /// Absolute path of the tracked folder or file at capture time.
    pub source_path: PathBuf,
    pub created_at: UtcDateTime,
    /// `None` for full backups.
    pub parent_backup_id: Option<String>,
    pub is_full_backup: bool,
    pub session_id: String,
    pub file_count: u64,
    pub total_size: u64,
    /// Directory hash of the captured tree.
    pub content_hash: ContentHash,
    pub hash_algorithm: HashAlgorithm,
    pub synced_at: Option<UtcDateTime>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct BackupRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) source_path: String,
    pub(crate) created_at: i64,
    pub(crate) parent_backup_id: Option<String>,
    pub(crate) is_full_backup: bool,
    pub(crate) session_id: String,
    pub(crate) file_count: i64,
    pub(crate) total_size: i64,
    pub(crate) content_hash: String,
    pub(crate) hash_algorithm: String,
    #[sqlx(default)]
    pub(crate) synced_at: Option<i64>,
}
impl TryFrom<&Backup> for BackupRow {
    type Error = Error;
    fn try_from(backup: &Backup) -> Result<Self, Self::Error> {
        if backup.is_full_backup != backup.parent_backup_id.is_none() {
            exn::bail!(ErrorKind::Constraint("full backups have no parent, differentials have one"));
        }
        Ok(Self {
            id: backup.id.clone(),
            name: backup.name.clone(),
            source_path: backup.source_path.to_str().ok_or_raise(|| ErrorKind::InvalidData("source path"))?.to_string(),
            created_at: backup.created_at.unix_timestamp(),
            parent_backup_id: backup.parent_backup_id.clone(),
            is_full_backup: backup.is_full_backup,
            session_id: backup.session_id.clone(),
            file_count: i64::try_from(backup.file_count).or_raise(|| ErrorKind::InvalidData("file count"))?,
            total_size: i64::try_from(backup.total_size).or_raise(|| ErrorKind::InvalidData("total size"))?,
            content_hash: backup.content_hash.to_string(),
            hash_algorithm: backup.hash_algorithm.to_string(),
            synced_at: backup.synced_at.map(|t| t.unix_timestamp()),
        })
    }
}
impl TryFrom<BackupRow> for Backup {
    type Error = Error;
    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            source_path: PathBuf::from(row.source_path),
            created_at: UtcDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("creation date"))?,
            parent_backup_id: row.parent_backup_id,
            is_full_backup: row.is_full_backup,
            session_id: row.session_id,
            file_count: u64::try_from(row.file_count).or_raise(|| ErrorKind::InvalidData("file count"))?,
            total_size: u64::try_from(row.total_size).or_raise(|| ErrorKind::InvalidData("total size"))?,
            content_hash: row.content_hash.parse::<ContentHash>().or_raise(|| ErrorKind::InvalidData("content hash"))?,
            hash_algorithm: row.hash_algorithm.parse::<HashAlgorithm>().or_raise(|| ErrorKind::InvalidData("hash algorithm"))?,
            synced_at: row
                .synced_at
                .map(UtcDateTime::from_unix_timestamp)
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("sync date"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(parent: Option<&str>) -> Backup {
        Backup {
            id: "id-1".to_string(),
            name: "thesis_2026-10-19_09-30-00".to_string(),
            source_path: PathBuf::from("/home/user/thesis"),
            created_at: UtcDateTime::from_unix_timestamp(1_792_402_200).unwrap(),
            parent_backup_id: parent.map(str::to_string),
            is_full_backup: parent.is_none(),
            session_id: "session-1".to_string(),
            file_count: 2,
            total_size: 10,
            content_hash: HashAlgorithm::Sha256.hash_bytes(b"tree"),
            hash_algorithm: HashAlgorithm::Sha256,
            synced_at: None,
        }
    }

    #[test]
    fn test_model_row_model() {
        let model = backup(Some("id-0"));
        let row = BackupRow::try_from(&model).unwrap();
        assert_eq!(row.hash_algorithm, "sha256");
        assert!(!row.is_full_backup);
        assert_eq!(Backup::try_from(row).unwrap(), model);
    }

    #[test]
    fn test_full_flag_must_match_parent() {
        let mut model = backup(None);
        model.is_full_backup = false;
        let err = BackupRow::try_from(&model).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Constraint(_)));
    }

    #[test]
    fn test_corrupt_hash_is_rejected() {
        let mut row = BackupRow::try_from(&backup(None)).unwrap();
        row.content_hash = "nope".to_string();
        let err = Backup::try_from(row).err().unwrap();
        assert!(matches!(&*err, ErrorKind::InvalidData("content hash")));
    }
}
