use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::UtcDateTime;
use timekeep_storage::ContentHash;

/// How a path compares with the same path in the parent backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Unchanged,
    Deleted,
}
impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the backup this change belongs to had to store new bytes.
    pub fn needs_content(&self) -> bool {
        matches!(self, Self::Added | Self::Modified)
    }
}
impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for ChangeType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "added" => Self::Added,
            "modified" => Self::Modified,
            "unchanged" => Self::Unchanged,
            "deleted" => Self::Deleted,
            _ => exn::bail!(ErrorKind::InvalidData("change type")),
        })
    }
}

/// One file of a backup, as recorded for similarity and duplicate queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Assigned by the database; `None` until inserted.
    pub id: Option<i64>,
    pub backup_id: String,
    /// `/`-separated path relative to the backup source.
    pub relative_path: String,
    /// For deleted files, the hash the file had in the parent.
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub modified_at: Option<UtcDateTime>,
    pub change_type: ChangeType,
    /// Storage-root-relative path of the object holding this file's bytes.
    pub backup_file_path: Option<String>,
}

/// A file record together with the backup it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub record: FileRecord,
    pub backup_name: String,
    pub session_id: String,
    pub source_path: PathBuf,
    pub backup_created_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRecordRow {
    #[sqlx(default)]
    pub(crate) id: Option<i64>,
    pub(crate) backup_id: String,
    pub(crate) relative_path: String,
    pub(crate) content_hash: String,
    pub(crate) size_bytes: i64,
    pub(crate) modified_at: Option<i64>,
    pub(crate) change_type: String,
    pub(crate) backup_file_path: Option<String>,
}
impl TryFrom<&FileRecord> for FileRecordRow {
    type Error = Error;
    fn try_from(record: &FileRecord) -> Result<Self, Self::Error> {
        if record.change_type == ChangeType::Deleted && record.backup_file_path.is_some() {
            exn::bail!(ErrorKind::Constraint("deleted files have no stored content"));
        }
        Ok(Self {
            id: record.id,
            backup_id: record.backup_id.clone(),
            relative_path: record.relative_path.clone(),
            content_hash: record.content_hash.to_string(),
            size_bytes: i64::try_from(record.size_bytes).or_raise(|| ErrorKind::InvalidData("file size"))?,
            modified_at: record.modified_at.map(|t| t.unix_timestamp()),
            change_type: record.change_type.to_string(),
            backup_file_path: record.backup_file_path.clone(),
        })
    }
}
impl TryFrom<FileRecordRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            backup_id: row.backup_id,
            relative_path: row.relative_path,
            content_hash: row.content_hash.parse::<ContentHash>().or_raise(|| ErrorKind::InvalidData("content hash"))?,
            size_bytes: u64::try_from(row.size_bytes).or_raise(|| ErrorKind::InvalidData("file size"))?,
            modified_at: row
                .modified_at
                .map(UtcDateTime::from_unix_timestamp)
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("modification date"))?,
            change_type: row.change_type.parse()?,
            backup_file_path: row.backup_file_path,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileMatchRow {
    #[sqlx(flatten)]
    pub(crate) file: FileRecordRow,
    pub(crate) backup_name: String,
    pub(crate) session_id: String,
    pub(crate) source_path: String,
    pub(crate) backup_created_at: i64,
}
impl TryFrom<FileMatchRow> for FileMatch {
    type Error = Error;
    fn try_from(row: FileMatchRow) -> Result<Self, Self::Error> {
        Ok(Self {
            record: row.file.try_into()?,
            backup_name: row.backup_name,
            session_id: row.session_id,
            source_path: PathBuf::from(row.source_path),
            backup_created_at: UtcDateTime::from_unix_timestamp(row.backup_created_at)
                .or_raise(|| ErrorKind::InvalidData("creation date"))?,
        })
    }
}
