//! The single consumer's side effects: apply one [`Mutation`] to the mirror.
//!
//! Every operation writes below a mirror directory only. Sources are stat'ed
//! and read, never modified. The filesystem at processing time wins over the
//! event that triggered the work: a removal whose source is back becomes a
//! conversion, a conversion whose source is gone is a [`SyncError::StaleRace`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use mirra_core::{EncodingConfig, Extension, MirrorConfig, PathError, PathMapper, WatchedRoot};

use crate::encoder::Encoder;
use crate::error::{io_err, SyncError};
use crate::event::Mutation;
use crate::prune::prune_upward;
use crate::reconcile::{self, RootReport};
use crate::staleness;

/// What a mutation ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Applied {
    Converted { source: PathBuf, mirror: PathBuf },
    /// Mirror already at least as new as the source.
    Unchanged { mirror: PathBuf },
    Removed {
        mirror: PathBuf,
        existed: bool,
        pruned: usize,
    },
    Renamed { from: PathBuf, to: PathBuf },
    Rescanned(RootReport),
    Skipped { path: PathBuf, reason: &'static str },
}

pub struct Synchronizer {
    mapper: PathMapper,
    encoding: EncodingConfig,
    encoder: Arc<dyn Encoder>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("mapper", &self.mapper)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    pub fn new(config: &MirrorConfig, encoder: Arc<dyn Encoder>) -> Self {
        Self::from_parts(PathMapper::new(config), config.encoding.clone(), encoder)
    }

    pub fn from_parts(mapper: PathMapper, encoding: EncodingConfig, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            mapper,
            encoding,
            encoder,
        }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn apply(&self, mutation: &Mutation) -> Result<Applied, SyncError> {
        if let Some(path) = self.touches_mirror(mutation) {
            tracing::warn!(
                "refusing {} on mirror-side path {}",
                mutation.label(),
                path.display()
            );
            return Ok(Applied::Skipped {
                path: path.to_path_buf(),
                reason: "inside a mirror directory",
            });
        }

        match mutation {
            Mutation::Convert { source } => self.convert(source),
            Mutation::Regenerate { source } => self.regenerate(source),
            Mutation::Remove { source, is_dir } => self.remove(source, *is_dir),
            Mutation::Rename { from, to, is_dir } => self.rename(from, to, *is_dir),
            Mutation::Rescan { dir } => self.rescan(dir),
        }
    }

    /// Encode `source` if its artifact is missing or older than it.
    ///
    /// When several tracked spellings share one artifact (`a.jpg`, `a.png`),
    /// the artifact is always built from the first existing one in extension
    /// order.
    pub fn convert(&self, source: &Path) -> Result<Applied, SyncError> {
        self.encode_mirror(source, false)
    }

    /// Encode `source` whatever the artifact's mtime says.
    pub fn regenerate(&self, source: &Path) -> Result<Applied, SyncError> {
        self.encode_mirror(source, true)
    }

    fn encode_mirror(&self, source: &Path, force: bool) -> Result<Applied, SyncError> {
        let (root, mirror) = self.mapper.locate(source)?;
        if !self.owns_mirror(root, &mirror) {
            tracing::warn!(
                "{} maps into a mirror not owned by {}; skipped",
                source.display(),
                root
            );
            return Ok(Applied::Skipped {
                path: source.to_path_buf(),
                reason: "mapped into a foreign mirror",
            });
        }

        let source = self.winner(source, &mirror, root);
        if force {
            staleness::source_mtime(&source)?;
        } else if !staleness::check_paths(&source, &mirror)?.needs_convert() {
            tracing::trace!("up to date: {}", mirror.display());
            return Ok(Applied::Unchanged { mirror });
        }

        if let Some(parent) = mirror.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let options = Extension::of(&source)
            .map(|ext| self.encoding.options_for(&ext))
            .unwrap_or(&self.encoding.default);
        self.encoder
            .encode(&source, &mirror, options)
            .map_err(|error| SyncError::Encode {
                source_path: source.clone(),
                dest: mirror.clone(),
                error,
            })?;

        tracing::info!("converted {} -> {}", source.display(), mirror.display());
        Ok(Applied::Converted { source, mirror })
    }

    /// Reconcile the subtree at `dir` against its mirror.
    pub fn rescan(&self, dir: &Path) -> Result<Applied, SyncError> {
        let root = self
            .mapper
            .root_for(dir)
            .ok_or_else(|| PathError::OutsideRoots {
                path: dir.to_path_buf(),
            })?;
        let report = reconcile::run(self, root, dir, false)?;
        Ok(Applied::Rescanned(report))
    }

    fn remove(&self, source: &Path, is_dir: bool) -> Result<Applied, SyncError> {
        if is_dir && source.is_dir() {
            tracing::debug!("{} exists again; rescanning instead of removing", source.display());
            return self.rescan(source);
        }
        if !is_dir && source.is_file() {
            tracing::debug!("{} exists again; converting instead of removing", source.display());
            return self.convert(source);
        }
        if is_dir {
            self.remove_dir(source)
        } else {
            self.remove_file(source)
        }
    }

    fn remove_file(&self, source: &Path) -> Result<Applied, SyncError> {
        let (root, mirror) = self.mapper.locate(source)?;
        let existed = remove_if_exists(&mirror)?;
        if existed {
            tracing::info!("removed {}", mirror.display());
        }

        if let Some(sibling) = self.surviving_sibling(source, &mirror, root) {
            tracing::info!("{} is still backed by {}", mirror.display(), sibling.display());
            return self.convert(&sibling);
        }

        let pruned = prune_parent(&mirror, root)?;
        Ok(Applied::Removed {
            mirror,
            existed,
            pruned,
        })
    }

    fn remove_dir(&self, source: &Path) -> Result<Applied, SyncError> {
        let root = self
            .mapper
            .root_for(source)
            .ok_or_else(|| PathError::OutsideRoots {
                path: source.to_path_buf(),
            })?;
        let mirror_dir = self.mapper.to_mirror_dir(source, root)?;
        let mirror_root = root.mirror_dir();
        if mirror_dir == mirror_root {
            return Ok(Applied::Skipped {
                path: source.to_path_buf(),
                reason: "is a watched root",
            });
        }

        let existed = match std::fs::remove_dir_all(&mirror_dir) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(io_err(&mirror_dir, err)),
        };
        if existed {
            tracing::info!("removed mirror subtree {}", mirror_dir.display());
        }
        let pruned = prune_parent(&mirror_dir, root)?;
        Ok(Applied::Removed {
            mirror: mirror_dir,
            existed,
            pruned,
        })
    }

    fn rename(&self, from: &Path, to: &Path, is_dir: bool) -> Result<Applied, SyncError> {
        let from_root = self.mapper.root_for(from);
        let to_root = self.mapper.root_for(to);
        let root = match (from_root, to_root) {
            (Some(a), Some(b)) if a == b && (is_dir || self.mapper.is_tracked(to)) => a,
            _ => return self.relocate(from, from_root.is_some(), to, to_root.is_some(), is_dir),
        };
        if is_dir {
            self.rename_dir(from, to, root)
        } else {
            self.rename_file(from, to, root)
        }
    }

    /// A rename that cannot be carried over: drop the old side, build the new.
    fn relocate(
        &self,
        from: &Path,
        from_watched: bool,
        to: &Path,
        to_watched: bool,
        is_dir: bool,
    ) -> Result<Applied, SyncError> {
        tracing::debug!(
            "{} -> {} cannot be renamed in the mirror; removing and rebuilding",
            from.display(),
            to.display()
        );
        let removed = if from_watched {
            Some(self.remove(from, is_dir)?)
        } else {
            None
        };
        match removed {
            _ if to_watched && is_dir => self.rescan(to),
            _ if to_watched && self.mapper.is_tracked(to) => self.regenerate(to),
            Some(applied) => Ok(applied),
            None => Ok(Applied::Skipped {
                path: to.to_path_buf(),
                reason: "outside every watched root",
            }),
        }
    }

    fn rename_file(&self, from: &Path, to: &Path, root: &WatchedRoot) -> Result<Applied, SyncError> {
        let old = self.mapper.to_mirror(from, root)?;
        let new = self.mapper.to_mirror(to, root)?;
        if !old.is_file() {
            // Whatever already sits at `new` was built from a different file.
            return self.regenerate(to);
        }
        if old != new {
            let winner = self.winner(to, &new, root);
            if winner != to {
                tracing::debug!(
                    "{} stays backed by {}; dropping {}",
                    new.display(),
                    winner.display(),
                    old.display()
                );
                self.remove_file(from)?;
                return self.convert(&winner);
            }
        }

        if let Some(parent) = new.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        // Replaces any artifact left at `new` by the overwritten destination.
        std::fs::rename(&old, &new).map_err(|e| io_err(&old, e))?;
        tracing::info!("renamed {} -> {}", old.display(), new.display());

        if old != new {
            match self.surviving_sibling(from, &old, root) {
                Some(sibling) => {
                    if let Err(err) = self.convert(&sibling) {
                        tracing::warn!("cannot rebuild {} from {}: {}", old.display(), sibling.display(), err);
                    }
                }
                None => {
                    prune_parent(&old, root)?;
                }
            }
        }

        match staleness::check_paths(to, &new) {
            Ok(freshness) if freshness.needs_convert() => return self.convert(to),
            Ok(_) => {}
            Err(err) if err.is_stale_race() => {}
            Err(err) => return Err(err),
        }
        Ok(Applied::Renamed { from: old, to: new })
    }

    fn rename_dir(&self, from: &Path, to: &Path, root: &WatchedRoot) -> Result<Applied, SyncError> {
        let old = self.mapper.to_mirror_dir(from, root)?;
        let new = self.mapper.to_mirror_dir(to, root)?;
        let mirror_root = root.mirror_dir();
        if old == mirror_root || new == mirror_root {
            return Ok(Applied::Skipped {
                path: to.to_path_buf(),
                reason: "is a watched root",
            });
        }

        // A directory only renames onto an empty one, so nothing left under
        // `new` belongs to the moved tree.
        if discard(&new)? {
            tracing::info!("discarded stale mirror subtree {}", new.display());
        }
        if old.is_dir() {
            if let Some(parent) = new.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            std::fs::rename(&old, &new).map_err(|e| io_err(&old, e))?;
            tracing::info!("renamed mirror dir {} -> {}", old.display(), new.display());
            prune_parent(&old, root)?;
        }

        // Anything written into the tree mid-move, or never mirrored.
        let report = reconcile::run(self, root, to, false)?;
        tracing::debug!(
            "post-rename rescan of {}: {} converted, {} removed",
            to.display(),
            report.converted,
            report.removed
        );
        Ok(Applied::Renamed { from: old, to: new })
    }

    fn touches_mirror<'m>(&self, mutation: &'m Mutation) -> Option<&'m Path> {
        match mutation {
            Mutation::Rename { from, to, .. } => [from.as_path(), to.as_path()]
                .into_iter()
                .find(|p| self.mapper.is_mirror_path(p)),
            other => Some(other.path()).filter(|p| self.mapper.is_mirror_path(p)),
        }
    }

    fn owns_mirror(&self, root: &WatchedRoot, mirror: &Path) -> bool {
        self.mapper.mirror_root_for(mirror).map(|r| r.path()) == Some(root.path())
    }

    fn winner(&self, source: &Path, mirror: &Path, root: &WatchedRoot) -> PathBuf {
        self.mapper
            .to_source_candidates(mirror, root)
            .ok()
            .and_then(|candidates| {
                candidates
                    .into_iter()
                    .find(|c| c.as_path() == source || c.is_file())
            })
            .unwrap_or_else(|| source.to_path_buf())
    }

    fn surviving_sibling(&self, vacated: &Path, mirror: &Path, root: &WatchedRoot) -> Option<PathBuf> {
        self.mapper
            .to_source_candidates(mirror, root)
            .ok()?
            .into_iter()
            .find(|c| c.as_path() != vacated && c.is_file())
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Remove whatever is at `path`, file or tree.
fn discard(path: &Path) -> Result<bool, SyncError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(io_err(path, err)),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path).map_err(|e| io_err(path, e))?;
        Ok(true)
    } else {
        remove_if_exists(path)
    }
}

fn prune_parent(mirror: &Path, root: &WatchedRoot) -> Result<usize, SyncError> {
    match mirror.parent() {
        Some(parent) => Ok(prune_upward(parent, &root.mirror_dir())?.len()),
        None => Ok(0),
    }
}
