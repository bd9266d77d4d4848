//! Change events and the mutations they resolve into.

use std::path::{Path, PathBuf};
use std::time::Instant;

/// Links a move-out half to its move-in half (inotify cookie, notify tracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoveToken(pub usize);

/// What happened to a source path. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created {
        path: PathBuf,
    },
    Modified {
        path: PathBuf,
    },
    Deleted {
        path: PathBuf,
        is_dir: bool,
    },
    MovedOut {
        path: PathBuf,
        is_dir: bool,
        token: Option<MoveToken>,
    },
    MovedIn {
        path: PathBuf,
        is_dir: bool,
        token: Option<MoveToken>,
    },
}

impl ChangeKind {
    pub fn path(&self) -> &Path {
        match self {
            ChangeKind::Created { path }
            | ChangeKind::Modified { path }
            | ChangeKind::Deleted { path, .. }
            | ChangeKind::MovedOut { path, .. }
            | ChangeKind::MovedIn { path, .. } => path,
        }
    }

    /// Dedup class; `None` for moves, which the pending-move table handles.
    pub fn class(&self) -> Option<EventClass> {
        match self {
            ChangeKind::Created { .. } | ChangeKind::Modified { .. } => Some(EventClass::Write),
            ChangeKind::Deleted { .. } => Some(EventClass::Remove),
            ChangeKind::MovedOut { .. } | ChangeKind::MovedIn { .. } => None,
        }
    }
}

/// One normalized notification, stamped when it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, observed_at: Instant) -> Self {
        Self { kind, observed_at }
    }

    pub fn now(kind: ChangeKind) -> Self {
        Self::new(kind, Instant::now())
    }

    pub fn path(&self) -> &Path {
        self.kind.path()
    }
}

/// Created and Modified collapse into one class: the engine recomputes from
/// modification times and never needs to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Write,
    Remove,
}

/// A single change to apply to the mirror tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// (Re)generate the artifact for `source` if it is missing or stale.
    Convert { source: PathBuf },
    /// Re-encode `source` even when the artifact looks current. Used for
    /// arrivals whose modification time says nothing about the artifact.
    Regenerate { source: PathBuf },
    /// Drop the artifact (or mirrored subtree) for a vanished source.
    Remove { source: PathBuf, is_dir: bool },
    /// Move the artifact along with a correlated source rename.
    Rename {
        from: PathBuf,
        to: PathBuf,
        is_dir: bool,
    },
    /// Reconcile a whole source subtree.
    Rescan { dir: PathBuf },
}

impl Mutation {
    /// Short label for logs and counters.
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::Convert { .. } => "convert",
            Mutation::Regenerate { .. } => "regenerate",
            Mutation::Remove { .. } => "remove",
            Mutation::Rename { .. } => "rename",
            Mutation::Rescan { .. } => "rescan",
        }
    }

    /// Primary path the mutation concerns.
    pub fn path(&self) -> &Path {
        match self {
            Mutation::Convert { source }
            | Mutation::Regenerate { source }
            | Mutation::Remove { source, .. } => source,
            Mutation::Rename { to, .. } => to,
            Mutation::Rescan { dir } => dir,
        }
    }
}
