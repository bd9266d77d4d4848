//! Rename correlation and dedup in front of the synchronizer.
//!
//! The consumer loop works in passes: one blocking dequeue plus a drain of
//! whatever is already queued. A move-out is parked in the pending table and
//! only resolved as a delete at the end of the *next* pass, which gives its
//! move-in half one full pass to show up.
//!
//! ```text
//! pass N:   MovedOut(T, a.jpg)            -> parked
//!           MovedIn(T, b.jpg)             -> Rename{a.jpg -> b.jpg}
//! pass N:   MovedOut(T, c.jpg)            -> parked
//! pass N+1: (no MovedIn for T)            -> end_pass: Remove{c.jpg}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use crate::debounce::Debouncer;
use crate::event::{ChangeEvent, ChangeKind, EventClass, MoveToken, Mutation};

/// Pending-table key: the correlation token when the watch facility gave one,
/// otherwise the vacated path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PendingKey {
    Token(MoveToken),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
struct PendingMove {
    path: PathBuf,
    is_dir: bool,
    pass: u64,
}

/// Owned exclusively by the consumer loop; no locking.
#[derive(Debug)]
pub struct Correlator {
    pass: u64,
    pending: BTreeMap<PendingKey, PendingMove>,
    debouncer: Debouncer,
}

impl Correlator {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            pass: 0,
            pending: BTreeMap::new(),
            debouncer: Debouncer::new(debounce_window),
        }
    }

    /// Start a new pass. Call before feeding the pass's first event.
    pub fn begin_pass(&mut self) {
        self.pass += 1;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Turn one event into zero or more mutations.
    pub fn accept(&mut self, event: ChangeEvent) -> Vec<Mutation> {
        let now = event.observed_at;
        self.debouncer.sweep(now);

        match event.kind {
            ChangeKind::Created { path } | ChangeKind::Modified { path } => {
                self.admit_write(path, now).into_iter().collect()
            }
            ChangeKind::Deleted { path, is_dir } => {
                if self.debouncer.admit(&path, EventClass::Remove, None, now) {
                    vec![Mutation::Remove { source: path, is_dir }]
                } else {
                    tracing::debug!("dedup: dropped repeated delete of {}", path.display());
                    Vec::new()
                }
            }
            ChangeKind::MovedOut {
                path,
                is_dir,
                token,
            } => {
                let key = match token {
                    Some(token) => PendingKey::Token(token),
                    None => PendingKey::Path(path.clone()),
                };
                let parked = PendingMove {
                    path,
                    is_dir,
                    pass: self.pass,
                };
                tracing::trace!("parked move-out {:?} -> {}", key, parked.path.display());
                // At most one pending half per key; a displaced half is final.
                match self.pending.insert(key, parked) {
                    Some(displaced) => vec![Mutation::Remove {
                        source: displaced.path,
                        is_dir: displaced.is_dir,
                    }],
                    None => Vec::new(),
                }
            }
            ChangeKind::MovedIn {
                path,
                is_dir,
                token,
            } => {
                if let Some(token) = token {
                    if let Some(out) = self.pending.remove(&PendingKey::Token(token)) {
                        return vec![Mutation::Rename {
                            from: out.path,
                            to: path,
                            is_dir: out.is_dir || is_dir,
                        }];
                    }
                } else if self.pending.remove(&PendingKey::Path(path.clone())).is_some() {
                    tracing::debug!("{} moved back in before its move-out resolved", path.display());
                }

                if is_dir {
                    vec![Mutation::Rescan { dir: path }]
                } else {
                    // A moved-in file keeps its own mtime, which may be older
                    // than the artifact already sitting at its mirror path.
                    let mtime = modified_time(&path);
                    self.debouncer.admit(&path, EventClass::Write, mtime, now);
                    vec![Mutation::Regenerate { source: path }]
                }
            }
        }
    }

    /// Close the current pass: move-outs parked in an earlier pass that never
    /// met their move-in become removals.
    pub fn end_pass(&mut self) -> Vec<Mutation> {
        let current = self.pass;
        let expired: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.pass < current)
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .map(|p| {
                tracing::debug!("unmatched move-out resolved as delete: {}", p.path.display());
                Mutation::Remove {
                    source: p.path,
                    is_dir: p.is_dir,
                }
            })
            .collect()
    }

    fn admit_write(&mut self, path: PathBuf, now: Instant) -> Option<Mutation> {
        let mtime = modified_time(&path);
        if self.debouncer.admit(&path, EventClass::Write, mtime, now) {
            Some(Mutation::Convert { source: path })
        } else {
            tracing::debug!("dedup: dropped repeated write of {}", path.display());
            None
        }
    }
}

fn modified_time(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ev(kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::now(kind)
    }

    fn moved_out(path: &str, token: Option<usize>) -> ChangeEvent {
        ev(ChangeKind::MovedOut {
            path: path.into(),
            is_dir: false,
            token: token.map(MoveToken),
        })
    }

    fn moved_in(path: &str, token: Option<usize>) -> ChangeEvent {
        ev(ChangeKind::MovedIn {
            path: path.into(),
            is_dir: false,
            token: token.map(MoveToken),
        })
    }

    #[test]
    fn matching_halves_in_one_pass_become_a_rename() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        assert!(c.accept(moved_out("/w/a.jpg", Some(7))).is_empty());
        let out = c.accept(moved_in("/w/b.jpg", Some(7)));
        assert_eq!(
            out,
            vec![Mutation::Rename {
                from: "/w/a.jpg".into(),
                to: "/w/b.jpg".into(),
                is_dir: false,
            }]
        );
        assert!(c.end_pass().is_empty());
        assert!(!c.has_pending());
    }

    #[test]
    fn move_in_may_arrive_one_pass_later() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        c.accept(moved_out("/w/a.jpg", Some(1)));
        assert!(c.end_pass().is_empty());

        c.begin_pass();
        let out = c.accept(moved_in("/w/b.jpg", Some(1)));
        assert!(matches!(out.as_slice(), [Mutation::Rename { .. }]));
    }

    #[test]
    fn unmatched_move_out_resolves_as_delete_after_next_pass() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        c.accept(moved_out("/w/a.jpg", Some(1)));
        c.accept(moved_out("/w/gone.png", None));
        assert!(c.end_pass().is_empty());
        assert_eq!(c.pending_len(), 2);

        c.begin_pass();
        let mut out = c.end_pass();
        out.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(
            out,
            vec![
                Mutation::Remove {
                    source: "/w/a.jpg".into(),
                    is_dir: false
                },
                Mutation::Remove {
                    source: "/w/gone.png".into(),
                    is_dir: false
                },
            ]
        );
        assert!(!c.has_pending());
    }

    #[test]
    fn unmatched_move_in_is_an_arrival() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        assert_eq!(
            c.accept(moved_in("/w/new.jpg", Some(4))),
            vec![Mutation::Regenerate {
                source: "/w/new.jpg".into()
            }]
        );
        assert_eq!(
            c.accept(ev(ChangeKind::MovedIn {
                path: "/w/album".into(),
                is_dir: true,
                token: None,
            })),
            vec![Mutation::Rescan {
                dir: "/w/album".into()
            }]
        );
    }

    #[test]
    fn second_move_out_with_same_token_displaces_the_first() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        c.accept(moved_out("/w/a.jpg", Some(3)));
        let out = c.accept(moved_out("/w/b.jpg", Some(3)));
        assert_eq!(
            out,
            vec![Mutation::Remove {
                source: "/w/a.jpg".into(),
                is_dir: false
            }]
        );
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn tokenless_move_back_cancels_pending_delete() {
        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        c.accept(moved_out("/w/a.jpg", None));
        let out = c.accept(moved_in("/w/a.jpg", None));
        assert!(matches!(out.as_slice(), [Mutation::Regenerate { .. }]));
        assert!(!c.has_pending());
    }

    #[test]
    fn move_in_over_a_recent_write_still_regenerates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("b.jpg");
        std::fs::write(&file, b"x").expect("write");

        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        assert_eq!(c.accept(ev(ChangeKind::Modified { path: file.clone() })).len(), 1);
        let out = c.accept(ev(ChangeKind::MovedIn {
            path: file.clone(),
            is_dir: false,
            token: None,
        }));
        assert_eq!(out, vec![Mutation::Regenerate { source: file }]);
    }

    #[test]
    fn duplicate_writes_collapse_and_deletes_pass_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"x").expect("write");

        let mut c = Correlator::new(Duration::from_secs(2));
        c.begin_pass();
        let created = ev(ChangeKind::Created { path: file.clone() });
        let modified = ev(ChangeKind::Modified { path: file.clone() });
        assert_eq!(c.accept(created).len(), 1);
        assert!(c.accept(modified).is_empty());

        let deleted = ev(ChangeKind::Deleted {
            path: file.clone(),
            is_dir: false,
        });
        assert_eq!(c.accept(deleted.clone()).len(), 1);
        assert!(c.accept(deleted).is_empty());
        assert!(Path::new(&file).exists());
    }
}
