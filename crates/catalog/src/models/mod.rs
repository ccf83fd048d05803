//! Catalog models and the rows they're stored as.
//!
//! Public models use domain types ([`ContentHash`](timekeep_storage::ContentHash),
//! [`UtcDateTime`](time::UtcDateTime), unsigned sizes). Rows mirror the SQLite
//! columns exactly and convert with `TryFrom` in both directions.

mod backup;
mod file_record;

pub use self::backup::Backup;
pub(crate) use self::backup::BackupRow;
pub use self::file_record::{ChangeType, FileMatch, FileRecord};
pub(crate) use self::file_record::{FileMatchRow, FileRecordRow};
