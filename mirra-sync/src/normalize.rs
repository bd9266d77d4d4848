//! Raw watch notifications → [`ChangeEvent`]s.
//!
//! Rules, applied in order:
//! 1. anything inside a mirror directory is dropped (our own writes)
//! 2. directory events are dropped unless they are moves
//! 3. file events with an untracked extension are dropped
//! 4. the raw kind is mapped onto [`ChangeKind`]

use std::path::PathBuf;
use std::time::Instant;

use mirra_core::PathMapper;

use crate::event::{ChangeEvent, ChangeKind, MoveToken};

/// Notification kinds as delivered by the watch facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Create,
    /// Data written; may arrive many times per save.
    Modify,
    /// File closed after writing.
    CloseWrite,
    Remove,
    MoveFrom,
    MoveTo,
}

/// One record from the watch facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub kind: RawKind,
    pub path: PathBuf,
    pub is_dir: bool,
    pub cookie: Option<usize>,
}

impl RawNotification {
    pub fn file(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_dir: false,
            cookie: None,
        }
    }

    pub fn with_cookie(mut self, cookie: usize) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn dir(mut self) -> Self {
        self.is_dir = true;
        self
    }
}

/// Stateless filter/map from raw notifications to change events.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mapper: PathMapper,
}

impl Normalizer {
    pub fn new(mapper: PathMapper) -> Self {
        Self { mapper }
    }

    pub fn normalize(&self, raw: RawNotification, observed_at: Instant) -> Option<ChangeEvent> {
        if self.mapper.is_mirror_path(&raw.path) {
            tracing::trace!("ignoring mirror-side notification: {}", raw.path.display());
            return None;
        }

        let is_move = matches!(raw.kind, RawKind::MoveFrom | RawKind::MoveTo);
        if raw.is_dir && !is_move {
            return None;
        }
        if !raw.is_dir && !self.mapper.is_tracked(&raw.path) {
            return None;
        }

        let RawNotification {
            kind,
            path,
            is_dir,
            cookie,
        } = raw;
        let token = cookie.map(MoveToken);
        let kind = match kind {
            RawKind::Create => ChangeKind::Created { path },
            RawKind::Modify | RawKind::CloseWrite => ChangeKind::Modified { path },
            RawKind::Remove => ChangeKind::Deleted { path, is_dir },
            RawKind::MoveFrom => ChangeKind::MovedOut {
                path,
                is_dir,
                token,
            },
            RawKind::MoveTo => ChangeKind::MovedIn {
                path,
                is_dir,
                token,
            },
        };
        Some(ChangeEvent::new(kind, observed_at))
    }
}
