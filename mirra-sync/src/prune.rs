//! Empty mirror directory removal.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{io_err, SyncError};

/// Remove `dir` if empty, then walk upward doing the same, stopping at (and
/// never removing) `stop_at`. Directories that are already gone are skipped.
///
/// Returns the directories actually removed, deepest first.
pub fn prune_upward(dir: &Path, stop_at: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut removed = Vec::new();
    let mut current = dir;
    while current.starts_with(stop_at) && current != stop_at {
        match std::fs::remove_dir(current) {
            Ok(()) => {
                tracing::debug!("pruned empty dir {}", current.display());
                removed.push(current.to_path_buf());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(_) if is_not_empty(current) => break,
            Err(err) => return Err(io_err(current, err)),
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(removed)
}

/// Remove every empty directory below `root`, bottom-up. `root` itself stays.
/// Symlinks are not followed.
pub fn prune_tree(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut removed = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(removed),
        Err(err) => return Err(io_err(root, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(root, e))?;
        let file_type = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if !file_type.is_dir() {
            continue;
        }
        let child = entry.path();
        removed.extend(prune_tree(&child)?);
        match std::fs::remove_dir(&child) {
            Ok(()) => removed.push(child),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(_) if is_not_empty(&child) => {}
            Err(err) => return Err(io_err(&child, err)),
        }
    }
    Ok(removed)
}

/// A failed `remove_dir` on a directory that still has entries. Checked by
/// listing rather than by error kind, which varies by platform.
fn is_not_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn prunes_chain_up_to_but_not_including_stop() {
        let tmp = TempDir::new().expect("tempdir");
        let mirror = tmp.path().join(".mirror");
        let deep = mirror.join("a/b/c");
        fs::create_dir_all(&deep).expect("mkdir");

        let removed = prune_upward(&deep, &mirror).expect("prune");
        assert_eq!(removed.len(), 3);
        assert!(!mirror.join("a").exists());
        assert!(mirror.is_dir());
    }

    #[test]
    fn stops_at_first_non_empty_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let mirror = tmp.path().join(".mirror");
        fs::create_dir_all(mirror.join("a/b")).expect("mkdir");
        fs::write(mirror.join("a/keep.webp"), b"x").expect("write");

        let removed = prune_upward(&mirror.join("a/b"), &mirror).expect("prune");
        assert_eq!(removed, vec![mirror.join("a/b")]);
        assert!(mirror.join("a/keep.webp").exists());
    }

    #[test]
    fn already_removed_dir_is_not_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let mirror = tmp.path().join(".mirror");
        fs::create_dir_all(&mirror).expect("mkdir");
        let removed = prune_upward(&mirror.join("gone/deeper"), &mirror).expect("prune");
        assert!(removed.is_empty());
    }

    #[test]
    fn never_touches_paths_outside_stop() {
        let tmp = TempDir::new().expect("tempdir");
        let mirror = tmp.path().join(".mirror");
        let outside = tmp.path().join("elsewhere");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::create_dir_all(&mirror).expect("mkdir");

        assert!(prune_upward(&outside, &mirror).expect("prune").is_empty());
        assert!(prune_upward(&mirror, &mirror).expect("prune").is_empty());
        assert!(outside.exists() && mirror.exists());
    }

    #[test]
    fn prune_tree_removes_empty_branches_only() {
        let tmp = TempDir::new().expect("tempdir");
        let mirror = tmp.path().join(".mirror");
        fs::create_dir_all(mirror.join("empty/nested")).expect("mkdir");
        fs::create_dir_all(mirror.join("full/nested")).expect("mkdir");
        fs::write(mirror.join("full/nested/a.webp"), b"x").expect("write");

        let removed = prune_tree(&mirror).expect("prune");
        assert_eq!(removed.len(), 2);
        assert!(!mirror.join("empty").exists());
        assert!(mirror.join("full/nested/a.webp").exists());
        assert!(mirror.is_dir());
    }
}
