//! Full-tree diff between a source subtree and its mirror.
//!
//! Two walks per scope:
//!
//! 1. Source walk: every tracked file whose artifact is missing or older is
//!    *stale*. The walk skips the mirror directory, subtrees that belong to a
//!    deeper watched root, and symlinks.
//! 2. Mirror walk: every file with no surviving source (including leftover
//!    `*.mirra.tmp` files) is an *orphan*.
//!
//! [`plan`] only reads. [`run`] removes orphans, converts stale sources through
//! the [`Synchronizer`], and prunes empty mirror directories. A second [`plan`]
//! right after a successful [`run`] is empty.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mirra_core::{Extension, PathMapper, WatchedRoot};

use crate::error::{io_err, SyncError};
use crate::prune::{prune_tree, prune_upward};
use crate::staleness;
use crate::synchronizer::{Applied, Synchronizer};

/// Work found by one reconciliation walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Sources whose artifact is missing or older, in mirror-path order.
    pub stale: Vec<PathBuf>,
    /// Mirror files with no source counterpart, sorted.
    pub orphans: Vec<PathBuf>,
    /// Sources whose artifact is current.
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.orphans.is_empty()
    }
}

/// Per-root outcome of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootReport {
    pub root: PathBuf,
    pub converted: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub dry_run: bool,
}

impl RootReport {
    pub fn new(root: &WatchedRoot) -> Self {
        Self {
            root: root.path().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn changed(&self) -> bool {
        self.converted + self.removed + self.pruned > 0
    }
}

/// Walk `scope` (the root itself or a directory below it) and its mirror.
pub fn plan(mapper: &PathMapper, root: &WatchedRoot, scope: &Path) -> Result<ReconcilePlan, SyncError> {
    let mut sources = Vec::new();
    walk_sources(mapper, root, scope, &mut sources)?;

    // One artifact per mirror path; when spellings collide the lowest
    // extension wins, matching the synchronizer's choice.
    let mut by_mirror: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for source in sources {
        let mirror = mapper.to_mirror(&source, root)?;
        match by_mirror.get(&mirror) {
            Some(current) if Extension::of(current) <= Extension::of(&source) => {}
            _ => {
                by_mirror.insert(mirror, source);
            }
        }
    }

    let mut plan = ReconcilePlan::default();
    for (mirror, source) in &by_mirror {
        let source_mtime = match staleness::source_mtime(source) {
            Ok(mtime) => mtime,
            Err(err) if err.is_stale_race() => continue,
            Err(err) => return Err(err),
        };
        if staleness::check(source_mtime, mirror)?.needs_convert() {
            plan.stale.push(source.clone());
        } else {
            plan.unchanged += 1;
        }
    }

    let expected: BTreeSet<&PathBuf> = by_mirror.keys().collect();
    let mirror_scope = mapper.to_mirror_dir(scope, root)?;
    let mut artifacts = Vec::new();
    walk_files(&mirror_scope, &mut artifacts)?;
    plan.orphans = artifacts
        .into_iter()
        .filter(|artifact| !expected.contains(artifact))
        .collect();
    plan.orphans.sort();

    Ok(plan)
}

/// Delete every orphan in `plan`. Returns `(removed, failed)`.
///
/// Only files strictly inside the root's mirror directory are touched.
pub fn remove_orphans(plan: &ReconcilePlan, root: &WatchedRoot) -> (usize, usize) {
    let mirror_root = root.mirror_dir();
    let (mut removed, mut failed) = (0, 0);
    for orphan in &plan.orphans {
        if !orphan.starts_with(&mirror_root) || orphan == &mirror_root {
            tracing::error!("refusing to remove {} outside {}", orphan.display(), mirror_root.display());
            failed += 1;
            continue;
        }
        match std::fs::remove_file(orphan) {
            Ok(()) => {
                tracing::info!("removed orphan {}", orphan.display());
                removed += 1;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!("cannot remove orphan {}: {}", orphan.display(), err);
                failed += 1;
            }
        }
    }
    (removed, failed)
}

/// Remove empty directories in the mirror of `scope`, then walk upward.
pub fn prune_scope(mapper: &PathMapper, root: &WatchedRoot, scope: &Path) -> Result<usize, SyncError> {
    let mirror_root = root.mirror_dir();
    let mirror_scope = mapper.to_mirror_dir(scope, root)?;
    let mut pruned = prune_tree(&mirror_scope)?.len();
    if mirror_scope != mirror_root {
        pruned += prune_upward(&mirror_scope, &mirror_root)?.len();
    }
    Ok(pruned)
}

/// Plan, then bring the mirror of `scope` in line. Per-file failures are
/// counted, logged and skipped.
pub fn run(sync: &Synchronizer, root: &WatchedRoot, scope: &Path, dry_run: bool) -> Result<RootReport, SyncError> {
    let mapper = sync.mapper();
    let plan = plan(mapper, root, scope)?;
    let mut report = RootReport::new(root);
    report.unchanged = plan.unchanged;
    report.dry_run = dry_run;

    if dry_run {
        for source in &plan.stale {
            tracing::info!("[dry-run] would convert: {}", source.display());
        }
        for orphan in &plan.orphans {
            tracing::info!("[dry-run] would remove: {}", orphan.display());
        }
        report.converted = plan.stale.len();
        report.removed = plan.orphans.len();
        return Ok(report);
    }

    let (removed, failed) = remove_orphans(&plan, root);
    report.removed = removed;
    report.failed = failed;

    for source in &plan.stale {
        match sync.convert(source) {
            Ok(Applied::Converted { .. }) => report.converted += 1,
            Ok(_) => report.unchanged += 1,
            Err(err) if err.is_stale_race() => {
                tracing::debug!("{}", err);
            }
            Err(err) => {
                tracing::warn!("{}", err);
                report.failed += 1;
            }
        }
    }

    report.pruned = prune_scope(mapper, root, scope)?;
    if report.changed() || report.failed > 0 {
        tracing::info!(
            "reconciled {}: {} converted, {} unchanged, {} removed, {} pruned, {} failed",
            scope.display(),
            report.converted,
            report.unchanged,
            report.removed,
            report.pruned,
            report.failed
        );
    }
    Ok(report)
}

fn walk_sources(mapper: &PathMapper, root: &WatchedRoot, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SyncError> {
    let Some(entries) = read_dir_tolerant(dir)? else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            if mapper.is_mirror_path(&path) {
                continue;
            }
            let owned_here = mapper.root_for(&path).map(|r| r.path()) == Some(root.path());
            if owned_here {
                walk_sources(mapper, root, &path, out)?;
            }
        } else if file_type.is_file() && mapper.is_tracked(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SyncError> {
    let Some(entries) = read_dir_tolerant(dir)? else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// `None` when `dir` is gone or not a directory.
fn read_dir_tolerant(dir: &Path) -> Result<Option<std::fs::ReadDir>, SyncError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            tracing::warn!("skipping unreadable directory {}", dir.display());
            Ok(None)
        }
        Err(err) if dir.is_file() => {
            tracing::debug!("{} is not a directory: {}", dir.display(), err);
            Ok(None)
        }
        Err(err) => Err(io_err(dir, err)),
    }
}
