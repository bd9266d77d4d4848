//! Mirror freshness check.
//!
//! A mirror artifact is current iff it exists and its mtime is not older than
//! the source's. The encoder copies the source mtime onto the artifact, so a
//! freshly converted pair compares equal.

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{io_err, SyncError};

/// Freshness of one mirror artifact relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No artifact at the mirror path.
    Missing,
    /// Artifact exists but its mtime is `behind` the source's.
    Stale { behind: Duration },
    Current,
}

impl Freshness {
    pub fn needs_convert(&self) -> bool {
        !matches!(self, Freshness::Current)
    }
}

/// Compare a source mtime against the artifact at `mirror`.
pub fn check(source_mtime: SystemTime, mirror: &Path) -> Result<Freshness, SyncError> {
    let meta = match std::fs::metadata(mirror) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Freshness::Missing),
        Err(err) => return Err(io_err(mirror, err)),
    };
    if !meta.is_file() {
        return Ok(Freshness::Missing);
    }
    let mirror_mtime = meta.modified().map_err(|e| io_err(mirror, e))?;
    Ok(compare(source_mtime, mirror_mtime))
}

/// Stat `source` and check its artifact. A vanished source is a
/// [`SyncError::StaleRace`].
pub fn check_paths(source: &Path, mirror: &Path) -> Result<Freshness, SyncError> {
    let source_mtime = source_mtime(source)?;
    check(source_mtime, mirror)
}

pub(crate) fn source_mtime(source: &Path) -> Result<SystemTime, SyncError> {
    match std::fs::metadata(source) {
        Ok(meta) if meta.is_file() => meta.modified().map_err(|e| io_err(source, e)),
        Ok(_) => Err(SyncError::StaleRace {
            path: source.to_path_buf(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(SyncError::StaleRace {
            path: source.to_path_buf(),
        }),
        Err(err) => Err(io_err(source, err)),
    }
}

fn compare(source_mtime: SystemTime, mirror_mtime: SystemTime) -> Freshness {
    match source_mtime.duration_since(mirror_mtime) {
        Ok(behind) if !behind.is_zero() => Freshness::Stale { behind },
        _ => Freshness::Current,
    }
}

/// Compact human form: `42s`, `5m`, `3h`, `2d`.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::TempDir;

    fn pair(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let source = dir.path().join("a.png");
        let mirror = dir.path().join("a.webp");
        fs::write(&source, b"src").expect("source");
        (source, mirror)
    }

    #[test]
    fn missing_mirror_is_missing() {
        let dir = TempDir::new().expect("tempdir");
        let (source, mirror) = pair(&dir);
        assert_eq!(check_paths(&source, &mirror).expect("check"), Freshness::Missing);
    }

    #[test]
    fn equal_mtimes_are_current() {
        let dir = TempDir::new().expect("tempdir");
        let (source, mirror) = pair(&dir);
        fs::write(&mirror, b"out").expect("mirror");
        let t = FileTime::from_unix_time(1_700_000_000, 0);
        set_file_mtime(&source, t).expect("mtime");
        set_file_mtime(&mirror, t).expect("mtime");
        assert_eq!(check_paths(&source, &mirror).expect("check"), Freshness::Current);
    }

    #[test]
    fn older_mirror_is_stale_by_the_difference() {
        let dir = TempDir::new().expect("tempdir");
        let (source, mirror) = pair(&dir);
        fs::write(&mirror, b"out").expect("mirror");
        set_file_mtime(&source, FileTime::from_unix_time(1_700_000_090, 0)).expect("mtime");
        set_file_mtime(&mirror, FileTime::from_unix_time(1_700_000_000, 0)).expect("mtime");

        let freshness = check_paths(&source, &mirror).expect("check");
        assert_eq!(
            freshness,
            Freshness::Stale {
                behind: Duration::from_secs(90)
            }
        );
        assert!(freshness.needs_convert());
    }

    #[test]
    fn vanished_source_is_a_stale_race() {
        let dir = TempDir::new().expect("tempdir");
        let err = check_paths(&dir.path().join("gone.png"), &dir.path().join("gone.webp"))
            .unwrap_err();
        assert!(err.is_stale_race(), "got: {err}");
    }

    #[test]
    fn formats_durations_compactly() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(5 * 60 + 3)), "5m");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600)), "3h");
        assert_eq!(format_duration(Duration::from_secs(2 * 86_400 + 1)), "2d");
    }
}
