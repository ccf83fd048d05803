//! Storage primitives for timekeep backups.
//!
//! - [`StorageBackend`]: an async CRUD interface over a root directory (the
//!   local filesystem, or an in-memory map for tests).
//! - [`ContentHash`] and [`HashAlgorithm`]: 256-bit content identities.
//! - [`ContentStore`]: the per-backup content-addressed object store, laid out
//!   as `backups/{backupName}/files/{contentHash}` beneath the storage root.

pub mod backend;
pub mod error;
pub mod file;
pub mod hash;
mod path;
pub mod store;

pub use crate::backend::StorageBackend;
pub use crate::hash::{ContentHash, HashAlgorithm};
pub use crate::path::{to_slash, validate as validate_path, validate_component};
pub use crate::store::ContentStore;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
