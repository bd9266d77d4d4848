//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use filetime::{set_file_mtime, FileTime};
use mirra_core::{ConfigFile, EncodeOptions, MirrorConfig, PathMapper};
use mirra_sync::encoder::{copy_metadata, snapshot, write_atomic};
use mirra_sync::{
    Applied, Correlator, EncodeError, Encoder, Normalizer, RawNotification, Synchronizer,
};
use tempfile::TempDir;

/// Copies source bytes to the destination and remembers every call.
#[derive(Default)]
pub struct RecordingEncoder {
    calls: Mutex<Vec<PathBuf>>,
    rewrite: Mutex<Option<(Vec<u8>, i64)>>,
}

impl RecordingEncoder {
    /// On the next call, overwrite the source after it has been read and
    /// before the artifact is written.
    pub fn rewrite_source_mid_encode(&self, body: &[u8], mtime: i64) {
        *self.rewrite.lock().expect("lock") = Some((body.to_vec(), mtime));
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }
}

impl Encoder for RecordingEncoder {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> Result<(), EncodeError> {
        self.calls.lock().expect("lock").push(source.to_path_buf());
        let meta = snapshot(source)?;
        let bytes = fs::read(source).map_err(|e| EncodeError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        if let Some((body, mtime)) = self.rewrite.lock().expect("lock").take() {
            fs::write(source, body).expect("rewrite source");
            set_file_mtime(source, FileTime::from_unix_time(mtime, 0)).expect("mtime");
        }
        write_atomic(dest, &bytes)?;
        if options.preserve_metadata {
            copy_metadata(&meta, dest);
        }
        Ok(())
    }
}

/// A watched root in a scratch dir plus an engine wired like the daemon's
/// consumer loop, minus the queue.
pub struct Fixture {
    _tmp: TempDir,
    pub base: PathBuf,
    pub root: PathBuf,
    pub mirror: PathBuf,
    pub config: MirrorConfig,
    pub encoder: Arc<RecordingEncoder>,
    pub normalizer: Normalizer,
    pub correlator: Correlator,
    pub sync: Synchronizer,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().expect("tempdir");
        let base = fs::canonicalize(tmp.path()).expect("canon");
        let root = base.join("w");
        fs::create_dir_all(&root).expect("mkdir root");

        let mut file = ConfigFile::with_roots(vec![root.clone()]);
        file.output_subdir = ".mirror".to_string();
        let config = MirrorConfig::from_file(file, &base).expect("config");

        let encoder = Arc::new(RecordingEncoder::default());
        let sync = Synchronizer::new(&config, encoder.clone());
        Self {
            _tmp: tmp,
            mirror: root.join(".mirror"),
            base,
            root,
            normalizer: Normalizer::new(PathMapper::new(&config)),
            correlator: Correlator::new(config.debounce_window),
            sync,
            encoder,
            config,
        }
    }

    pub fn src(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn mirror_of(&self, rel: &str) -> PathBuf {
        self.mirror.join(rel)
    }

    /// Write a source file with a fixed mtime.
    pub fn write(&self, rel: &str, body: &[u8], mtime: i64) -> PathBuf {
        let path = self.src(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, body).expect("write");
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).expect("mtime");
        path
    }

    /// Run one consumer pass over `raws` and return what was applied.
    pub fn pass(&mut self, raws: Vec<RawNotification>) -> Vec<Applied> {
        self.correlator.begin_pass();
        let mut mutations = Vec::new();
        for raw in raws {
            if let Some(event) = self.normalizer.normalize(raw, Instant::now()) {
                mutations.extend(self.correlator.accept(event));
            }
        }
        mutations.extend(self.correlator.end_pass());

        let mut applied = Vec::new();
        for mutation in mutations {
            match self.sync.apply(&mutation) {
                Ok(outcome) => applied.push(outcome),
                Err(err) if err.is_stale_race() => {}
                Err(err) => panic!("{} failed: {err}", mutation.label()),
            }
        }
        applied
    }

    pub fn plan_is_empty(&self) -> bool {
        let root = &self.config.roots[0];
        mirra_sync::reconcile::plan(self.sync.mapper(), root, root.path())
            .expect("plan")
            .is_empty()
    }
}
