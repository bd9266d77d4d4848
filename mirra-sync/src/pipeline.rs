//! Shared reconciliation entrypoint used by CLI and daemon.

use std::path::PathBuf;
use std::sync::Arc;

use mirra_core::{MirrorConfig, PathError};

use crate::encoder::Encoder;
use crate::reconcile::{self, RootReport};
use crate::synchronizer::Synchronizer;
use crate::SyncError;

/// Scope for a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// Every watched root.
    All,
    /// One directory: a watched root or anything below one.
    Dir(PathBuf),
}

/// One-shot reconciliation of every watched root.
///
/// This is the canonical scan entrypoint for `mirra scan`; the daemon's
/// startup pass and rescan command go through [`scan_with`].
pub fn scan(
    config: &MirrorConfig,
    encoder: Arc<dyn Encoder>,
    dry_run: bool,
) -> Result<Vec<RootReport>, SyncError> {
    let sync = Synchronizer::new(config, encoder);
    scan_with(&sync, &ScanScope::All, dry_run)
}

/// Reconcile `scope` with an existing synchronizer. Reports come back sorted
/// by root path.
pub fn scan_with(
    sync: &Synchronizer,
    scope: &ScanScope,
    dry_run: bool,
) -> Result<Vec<RootReport>, SyncError> {
    let mapper = sync.mapper();
    let mut reports = match scope {
        ScanScope::All => {
            let mut reports = Vec::with_capacity(mapper.roots().len());
            for root in mapper.roots() {
                reports.push(reconcile::run(sync, root, root.path(), dry_run)?);
            }
            reports
        }
        ScanScope::Dir(dir) => {
            if let Some(owner) = mapper.mirror_root_for(dir) {
                return Err(PathError::InsideMirror {
                    path: dir.clone(),
                    mirror: owner.mirror_dir(),
                }
                .into());
            }
            let root = mapper.root_for(dir).ok_or_else(|| PathError::OutsideRoots {
                path: dir.clone(),
            })?;
            vec![reconcile::run(sync, root, dir, dry_run)?]
        }
    };
    reports.sort_by(|a, b| a.root.cmp(&b.root));
    Ok(reports)
}
