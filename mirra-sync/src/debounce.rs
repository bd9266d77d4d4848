//! Duplicate-notification filter.
//!
//! A record per path remembers when it was last admitted, the source mtime at
//! that moment, and the event class. A new event is dropped when all three
//! match a record younger than the window. Records are kept in a time-ordered
//! index so eviction never scans the whole table.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::event::EventClass;

/// Hard cap on live records, independent of the time-based sweep.
pub const MAX_RECORDS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DedupRecord {
    seen_at: Instant,
    mtime: Option<SystemTime>,
    class: EventClass,
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    records: HashMap<PathBuf, DedupRecord>,
    /// Admission order. An entry is live only while its instant equals the
    /// record's `seen_at`; superseded entries are skipped on eviction.
    order: VecDeque<(Instant, PathBuf)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns `false` when the event duplicates a recent one and should be
    /// dropped; otherwise records it and returns `true`.
    pub fn admit(
        &mut self,
        path: &Path,
        class: EventClass,
        mtime: Option<SystemTime>,
        now: Instant,
    ) -> bool {
        if let Some(record) = self.records.get(path) {
            let young = now.saturating_duration_since(record.seen_at) < self.window;
            if young && record.class == class && record.mtime == mtime {
                return false;
            }
        }

        self.records.insert(
            path.to_path_buf(),
            DedupRecord {
                seen_at: now,
                mtime,
                class,
            },
        );
        self.order.push_back((now, path.to_path_buf()));
        self.enforce_cap();
        true
    }

    /// Evict records older than twice the window.
    pub fn sweep(&mut self, now: Instant) {
        let horizon = self.window * 2;
        while let Some((seen_at, _)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < horizon {
                break;
            }
            self.pop_oldest();
        }
    }

    fn enforce_cap(&mut self) {
        while self.records.len() > MAX_RECORDS || self.order.len() > MAX_RECORDS * 2 {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    fn pop_oldest(&mut self) -> bool {
        let Some((seen_at, path)) = self.order.pop_front() else {
            return false;
        };
        if self.records.get(&path).map(|r| r.seen_at) == Some(seen_at) {
            self.records.remove(&path);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn mtime(secs: u64) -> Option<SystemTime> {
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn identical_event_within_window_is_dropped() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        let p = Path::new("/w/a.png");
        assert!(d.admit(p, EventClass::Write, mtime(10), t0));
        assert!(!d.admit(p, EventClass::Write, mtime(10), t0 + Duration::from_millis(300)));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn distinct_mtime_or_class_is_admitted() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        let p = Path::new("/w/a.png");
        assert!(d.admit(p, EventClass::Write, mtime(10), t0));
        assert!(d.admit(p, EventClass::Write, mtime(11), t0));
        assert!(d.admit(p, EventClass::Remove, None, t0));
        assert!(d.admit(p, EventClass::Write, mtime(11), t0));
    }

    #[test]
    fn same_event_after_window_is_admitted() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        let p = Path::new("/w/a.png");
        assert!(d.admit(p, EventClass::Write, mtime(10), t0));
        assert!(d.admit(p, EventClass::Write, mtime(10), t0 + WINDOW));
    }

    #[test]
    fn sweep_evicts_records_older_than_twice_the_window() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.admit(Path::new("/w/old.png"), EventClass::Write, mtime(1), t0);
        d.admit(Path::new("/w/new.png"), EventClass::Write, mtime(1), t0 + Duration::from_secs(3));

        d.sweep(t0 + Duration::from_secs(4));
        assert_eq!(d.len(), 1);
        assert!(!d.admit(
            Path::new("/w/new.png"),
            EventClass::Write,
            mtime(1),
            t0 + Duration::from_secs(4)
        ));
    }

    #[test]
    fn superseded_order_entries_do_not_evict_fresh_records() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        let p = Path::new("/w/a.png");
        d.admit(p, EventClass::Write, mtime(1), t0);
        d.admit(p, EventClass::Write, mtime(2), t0 + Duration::from_secs(3));

        d.sweep(t0 + Duration::from_secs(4));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn record_count_is_capped() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        for i in 0..(MAX_RECORDS + 10) {
            let p = PathBuf::from(format!("/w/{i}.png"));
            d.admit(&p, EventClass::Write, mtime(1), t0);
        }
        assert_eq!(d.len(), MAX_RECORDS);
        assert!(d.admit(Path::new("/w/0.png"), EventClass::Write, mtime(1), t0));
    }
}
