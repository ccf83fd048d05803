//! Path validation and security utilities.
//!
//! Storage paths are always relative to a backend root. These helpers make
//! sure they can't escape it, and give every platform the same `/`-separated
//! spelling for paths that end up in manifests and the catalog.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage path for security and correctness.
/// Ensures that paths don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use timekeep_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("docs/report.txt").is_ok());
/// assert!(validate_path("a/b/c/file.bin").is_ok());
/// assert!(validate_path("a/../file.bin").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves the root)
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../still-wrong/.././correct//./path.txt/").unwrap(),
///     Path::new("correct/path.txt")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls; reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Validates that `name` is exactly one normal path component, so it can be
/// used as a directory name directly beneath a fixed prefix (backup names).
pub fn validate_component(name: &str) -> Result<&str> {
    let validated = validate(name)?;
    if validated.components().count() != 1 || validated.as_os_str() != name {
        exn::bail!(ErrorKind::InvalidPath(PathBuf::from(name)));
    }
    Ok(name)
}

/// Spell a validated relative path with `/` separators.
///
/// Manifests and catalog rows must read the same on every platform.
///
/// ```
/// use std::path::Path;
/// use timekeep_storage::to_slash;
/// assert_eq!(to_slash(Path::new("a/b/c.txt")).unwrap(), "a/b/c.txt");
/// ```
pub fn to_slash(path: impl AsRef<Path>) -> Result<String> {
    let validated = validate(path.as_ref())?;
    let mut parts = Vec::new();
    for component in validated.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(path.as_ref().to_path_buf())))?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert_eq!(validate(Path::new("docs/report.txt")).unwrap(), Path::new("docs/report.txt"));
        assert_eq!(validate(Path::new("a/b/c/file.bin")).unwrap(), Path::new("a/b/c/file.bin"));
        assert_eq!(validate(Path::new("simple.txt")).unwrap(), Path::new("simple.txt"));
    }

    #[test]
    fn test_path_normalization() {
        // Double slashes are normalized
        assert_eq!(validate(Path::new("a//b//c")).unwrap(), Path::new("a/b/c"));
        // Current directory references removed
        assert_eq!(validate(Path::new("a/./b/./c")).unwrap(), Path::new("a/b/c"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(validate(Path::new("../etc/passwd")).is_err());
        assert!(validate(Path::new("a/../../b")).is_err());
        assert!(validate(Path::new("..")).is_err());
        assert!(validate(Path::new("../..")).is_err());
    }

    #[test]
    fn test_reverse_attempts() {
        // Traversal remains within the root
        assert_eq!(validate(Path::new("a/b/..")).unwrap(), Path::new("a"));
    }

    #[test]
    fn test_invalid_characters() {
        assert!(validate(Path::new("a\0b")).is_err());
        assert!(validate(Path::new("\0")).is_err());
    }

    #[test]
    fn test_empty_paths() {
        assert!(validate(Path::new("")).is_err());
        assert!(validate(Path::new(".")).is_err());
        assert!(validate(Path::new("./")).is_err());
        assert!(validate(Path::new("//")).is_err());
    }

    #[test]
    fn test_trailing_slashes() {
        assert_eq!(validate(Path::new("Projects/")).unwrap(), Path::new("Projects"));
        assert_eq!(validate(Path::new("a/b/c///")).unwrap(), Path::new("a/b/c"));
    }

    #[test]
    fn test_component() {
        assert!(validate_component("thesis_2026-10-19_09-30-00").is_ok());
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("..").is_err());
        assert!(validate_component("./name").is_err());
        assert!(validate_component("").is_err());
    }

    #[test]
    fn test_to_slash() {
        assert_eq!(to_slash("a//b/./c.txt").unwrap(), "a/b/c.txt");
        assert!(to_slash("../c.txt").is_err());
    }
}
