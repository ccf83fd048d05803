//! Change detection between a tree and its parent backup.

use crate::hasher::FileEntry;
use std::collections::BTreeMap;
use timekeep_catalog::ChangeType;

/// Classification of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub relative_path: String,
    pub change: ChangeType,
    /// The file as it is now; `None` if deleted.
    pub current: Option<FileEntry>,
    /// The file as the parent recorded it; `None` if added.
    pub parent: Option<FileEntry>,
}

/// Classify every path of `current` and `parent`.
///
/// The output covers the union of both path sets, each path exactly once,
/// sorted by path. With an empty parent everything is
/// [`Added`](ChangeType::Added); with an empty current list everything is
/// [`Deleted`](ChangeType::Deleted).
pub fn detect_changes(current: &[FileEntry], parent: &[FileEntry]) -> Vec<FileChange> {
    let mut parents: BTreeMap<&str, &FileEntry> = parent.iter().map(|e| (e.relative_path.as_str(), e)).collect();
    let currents: BTreeMap<&str, &FileEntry> = current.iter().map(|e| (e.relative_path.as_str(), e)).collect();
    let mut changes = Vec::with_capacity(currents.len().max(parents.len()));
    for (path, now) in currents {
        let before = parents.remove(path);
        let change = match before {
            None => ChangeType::Added,
            Some(before) if before.hash != now.hash => ChangeType::Modified,
            Some(_) => ChangeType::Unchanged,
        };
        changes.push(FileChange {
            relative_path: path.to_string(),
            change,
            current: Some(now.clone()),
            parent: before.cloned(),
        });
    }
    for (path, before) in parents {
        changes.push(FileChange {
            relative_path: path.to_string(),
            change: ChangeType::Deleted,
            current: None,
            parent: Some(before.clone()),
        });
    }
    changes.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeSet;
    use timekeep_storage::HashAlgorithm;

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry {
            relative_path: path.to_string(),
            hash: HashAlgorithm::Sha256.hash_bytes(content),
            size_bytes: content.len() as u64,
            modified_at: None,
        }
    }

    fn kinds(changes: &[FileChange]) -> Vec<(&str, ChangeType)> {
        changes.iter().map(|c| (c.relative_path.as_str(), c.change)).collect()
    }

    #[test]
    fn test_all_four_kinds() {
        let parent = vec![entry("same.txt", "x"), entry("edit.txt", "old"), entry("gone.txt", "bye")];
        let current = vec![entry("edit.txt", "new"), entry("same.txt", "x"), entry("new.txt", "hi")];
        let changes = detect_changes(&current, &parent);
        assert_eq!(
            kinds(&changes),
            vec![
                ("edit.txt", ChangeType::Modified),
                ("gone.txt", ChangeType::Deleted),
                ("new.txt", ChangeType::Added),
                ("same.txt", ChangeType::Unchanged),
            ]
        );
        let gone = &changes[1];
        assert!(gone.current.is_none());
        assert_eq!(gone.parent.as_ref().unwrap().hash, HashAlgorithm::Sha256.hash_bytes("bye"));
    }

    #[test]
    fn test_empty_parent_is_all_added() {
        let current = vec![entry("a.txt", "hello"), entry("b.txt", "world")];
        assert!(detect_changes(&current, &[]).iter().all(|c| c.change == ChangeType::Added));
    }

    #[test]
    fn test_empty_current_is_all_deleted() {
        let parent = vec![entry("a.txt", "hello"), entry("b.txt", "world")];
        assert!(detect_changes(&[], &parent).iter().all(|c| c.change == ChangeType::Deleted));
    }

    #[rstest]
    #[case(&[], &[])]
    #[case(&["a"], &[])]
    #[case(&[], &["a"])]
    #[case(&["a", "b", "c"], &["b", "c", "d"])]
    #[case(&["x/1", "x/2"], &["x/1", "y/2", "x/2"])]
    fn test_covers_union_exactly_once(#[case] current: &[&str], #[case] parent: &[&str]) {
        let current: Vec<_> = current.iter().map(|p| entry(p, p)).collect();
        let parent: Vec<_> = parent.iter().map(|p| entry(p, "parent")).collect();
        let changes = detect_changes(&current, &parent);
        let union: BTreeSet<_> =
            current.iter().chain(parent.iter()).map(|e| e.relative_path.clone()).collect();
        let seen: Vec<_> = changes.iter().map(|c| c.relative_path.clone()).collect();
        assert_eq!(seen.len(), union.len());
        assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), union);
    }
}
