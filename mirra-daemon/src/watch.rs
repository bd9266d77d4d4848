//! `notify` events in, [`RawNotification`]s out.

use std::collections::VecDeque;
use std::path::Path;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use mirra_core::{PathMapper, WatchedRoot};
use mirra_sync::{RawKind, RawNotification};

const RECENT_TRACKERS: usize = 256;

/// Translates backend events. Stateful only to drop the `Name(Both)` echo
/// that inotify emits after the two halves it already reported.
pub struct WatchAdapter {
    mapper: PathMapper,
    recent: VecDeque<usize>,
    synthetic: usize,
}

impl WatchAdapter {
    pub fn new(mapper: PathMapper) -> Self {
        Self {
            mapper,
            recent: VecDeque::with_capacity(RECENT_TRACKERS),
            synthetic: 0,
        }
    }

    pub fn translate(&mut self, event: Event) -> Vec<RawNotification> {
        let tracker = event.tracker();
        let mut paths = event.paths.into_iter();
        let mut out = Vec::new();

        match event.kind {
            EventKind::Create(kind) => {
                for path in paths {
                    let is_dir = kind == CreateKind::Folder || path.is_dir();
                    out.push(with_dir(RawNotification::file(RawKind::Create, path), is_dir));
                }
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                out.extend(paths.map(|p| RawNotification::file(RawKind::Modify, p)));
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                out.extend(paths.map(|p| RawNotification::file(RawKind::CloseWrite, p)));
            }
            EventKind::Remove(kind) => {
                let is_dir = kind == RemoveKind::Folder;
                for path in paths {
                    out.push(with_dir(RawNotification::file(RawKind::Remove, path), is_dir));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in paths {
                    out.push(self.move_from(path, tracker));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in paths {
                    out.push(self.move_to(path, tracker));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if tracker.is_some_and(|t| self.recent.contains(&t)) {
                    return out;
                }
                let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                    return out;
                };
                let cookie = tracker.unwrap_or_else(|| self.next_synthetic());
                out.push(self.move_from(from, Some(cookie)));
                out.push(self.move_to(to, Some(cookie)));
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Backends that cannot tell which half they saw.
                for path in paths {
                    if path.exists() {
                        out.push(self.move_to(path, None));
                    } else {
                        out.push(self.move_from(path, None));
                    }
                }
            }
            _ => {}
        }
        out
    }

    fn move_from(&mut self, path: std::path::PathBuf, tracker: Option<usize>) -> RawNotification {
        // The source is gone; the mirror still shows what it was.
        let is_dir = self
            .mapper
            .root_for(&path)
            .and_then(|root| self.mapper.to_mirror_dir(&path, root).ok())
            .is_some_and(|mirror| mirror.is_dir());
        self.raw_move(RawKind::MoveFrom, path, is_dir, tracker)
    }

    fn move_to(&mut self, path: std::path::PathBuf, tracker: Option<usize>) -> RawNotification {
        let is_dir = path.is_dir();
        self.raw_move(RawKind::MoveTo, path, is_dir, tracker)
    }

    fn raw_move(
        &mut self,
        kind: RawKind,
        path: std::path::PathBuf,
        is_dir: bool,
        tracker: Option<usize>,
    ) -> RawNotification {
        let mut raw = with_dir(RawNotification::file(kind, path), is_dir);
        if let Some(cookie) = tracker {
            self.remember(cookie);
            raw = raw.with_cookie(cookie);
        }
        raw
    }

    fn remember(&mut self, tracker: usize) {
        if self.recent.contains(&tracker) {
            return;
        }
        if self.recent.len() == RECENT_TRACKERS {
            self.recent.pop_front();
        }
        self.recent.push_back(tracker);
    }

    // Counts down from the top so it never meets a kernel cookie in practice.
    fn next_synthetic(&mut self) -> usize {
        self.synthetic = self.synthetic.wrapping_add(1);
        usize::MAX - self.synthetic
    }
}

fn with_dir(raw: RawNotification, is_dir: bool) -> RawNotification {
    if is_dir {
        raw.dir()
    } else {
        raw
    }
}

/// Register every root recursively. Roots that cannot be watched are logged
/// and skipped; returns how many were registered.
pub fn register_roots<W: Watcher>(watcher: &mut W, roots: &[WatchedRoot]) -> usize {
    let mut registered = 0;
    for root in roots {
        match register_root(watcher, root.path()) {
            Ok(()) => {
                tracing::info!(root = %root.path().display(), "watching root");
                registered += 1;
            }
            Err(err) => {
                tracing::warn!(root = %root.path().display(), error = %err, "cannot watch root; skipping");
            }
        }
    }
    registered
}

fn register_root<W: Watcher>(watcher: &mut W, root: &Path) -> Result<(), notify::Error> {
    if !root.is_dir() {
        return Err(notify::Error::path_not_found().add_path(root.to_path_buf()));
    }
    watcher.watch(root, RecursiveMode::Recursive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_core::{ConfigFile, MirrorConfig};
    use notify::event::{DataChange, MetadataKind};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn adapter(root: &Path) -> WatchAdapter {
        let file = ConfigFile::with_roots(vec![root.to_path_buf()]);
        let config = MirrorConfig::from_file(file, Path::new("/")).expect("config");
        WatchAdapter::new(PathMapper::new(&config))
    }

    fn rename(mode: RenameMode) -> EventKind {
        EventKind::Modify(ModifyKind::Name(mode))
    }

    #[test]
    fn write_kinds_map_and_metadata_is_ignored() {
        let tmp = TempDir::new().expect("tempdir");
        let mut adapter = adapter(tmp.path());
        let path = tmp.path().join("a.png");

        let data = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.clone());
        let close = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path.clone());
        let meta = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))).add_path(path.clone());
        let open = Event::new(EventKind::Access(AccessKind::Open(AccessMode::Any))).add_path(path.clone());

        assert_eq!(adapter.translate(data), vec![RawNotification::file(RawKind::Modify, &path)]);
        assert_eq!(adapter.translate(close), vec![RawNotification::file(RawKind::CloseWrite, &path)]);
        assert!(adapter.translate(meta).is_empty());
        assert!(adapter.translate(open).is_empty());
    }

    #[test]
    fn folder_events_carry_is_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let mut adapter = adapter(tmp.path());
        let dir = tmp.path().join("album");
        fs::create_dir(&dir).expect("mkdir");

        let created = adapter.translate(Event::new(EventKind::Create(CreateKind::Any)).add_path(dir.clone()));
        assert_eq!(created, vec![RawNotification::file(RawKind::Create, &dir).dir()]);

        let removed = adapter.translate(Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(dir.clone()));
        assert_eq!(removed, vec![RawNotification::file(RawKind::Remove, &dir).dir()]);
    }

    #[test]
    fn move_halves_keep_tracker_and_both_echo_is_dropped() {
        let tmp = TempDir::new().expect("tempdir");
        let mut adapter = adapter(tmp.path());
        let from = tmp.path().join("a.png");
        let to = tmp.path().join("b.png");
        fs::write(&to, b"png").expect("write");

        let out = adapter.translate(Event::new(rename(RenameMode::From)).add_path(from.clone()).set_tracker(7));
        assert_eq!(out, vec![RawNotification::file(RawKind::MoveFrom, &from).with_cookie(7)]);
        let out = adapter.translate(Event::new(rename(RenameMode::To)).add_path(to.clone()).set_tracker(7));
        assert_eq!(out, vec![RawNotification::file(RawKind::MoveTo, &to).with_cookie(7)]);

        let echo = Event::new(rename(RenameMode::Both))
            .add_path(from)
            .add_path(to)
            .set_tracker(7);
        assert!(adapter.translate(echo).is_empty());
    }

    #[test]
    fn standalone_both_is_split_with_a_shared_cookie() {
        let tmp = TempDir::new().expect("tempdir");
        let mut adapter = adapter(tmp.path());
        let from = tmp.path().join("a.png");
        let to = tmp.path().join("b.png");

        let out = adapter.translate(Event::new(rename(RenameMode::Both)).add_path(from.clone()).add_path(to.clone()));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, RawKind::MoveFrom);
        assert_eq!(out[1].kind, RawKind::MoveTo);
        assert!(out[0].cookie.is_some());
        assert_eq!(out[0].cookie, out[1].cookie);
        assert_eq!((out[0].path.clone(), out[1].path.clone()), (from, to));
    }

    #[test]
    fn vanished_dir_is_recognised_through_its_mirror() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().canonicalize().expect("canonical");
        let mut adapter = adapter(&root);
        fs::create_dir_all(root.join("webp/album")).expect("mkdir mirror");

        let gone = root.join("album");
        let out = adapter.translate(Event::new(rename(RenameMode::From)).add_path(gone.clone()).set_tracker(3));
        assert_eq!(out, vec![RawNotification::file(RawKind::MoveFrom, &gone).with_cookie(3).dir()]);
    }

    #[test]
    fn ambiguous_rename_decides_by_existence() {
        let tmp = TempDir::new().expect("tempdir");
        let mut adapter = adapter(tmp.path());
        let present = tmp.path().join("here.png");
        fs::write(&present, b"png").expect("write");
        let absent = tmp.path().join("gone.png");

        let out = adapter.translate(
            Event::new(rename(RenameMode::Any))
                .add_path(present.clone())
                .add_path(absent.clone()),
        );
        assert_eq!(
            out,
            vec![
                RawNotification::file(RawKind::MoveTo, &present),
                RawNotification::file(RawKind::MoveFrom, &absent),
            ]
        );
    }

    #[test]
    fn missing_roots_are_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let mut watcher = notify::recommended_watcher(|_| {}).expect("watcher");
        let roots = vec![
            WatchedRoot::new(tmp.path(), "webp"),
            WatchedRoot::new(PathBuf::from("/definitely/not/here"), "webp"),
        ];
        assert_eq!(register_roots(&mut watcher, &roots), 1);
    }
}
