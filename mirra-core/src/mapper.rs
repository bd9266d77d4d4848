//! Source ⇄ mirror path mapping.
//!
//! ```text
//! <root>/a/b/img.png  ⇄  <root>/<mirror_subdir>/a/b/img.webp
//! ```
//!
//! Every function here is pure: no filesystem access. Paths are compared
//! component-wise, so `/w/.mirrored` is not inside `/w/.mirror`.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::error::PathError;
use crate::types::{Extension, MirrorConfig, WatchedRoot};

/// Maps source paths to mirror paths and back for a fixed set of roots.
#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Sorted deepest-first so the first prefix match is the longest one.
    roots: Vec<WatchedRoot>,
    mirror_extension: Extension,
    tracked: BTreeSet<Extension>,
}

impl PathMapper {
    pub fn new(config: &MirrorConfig) -> Self {
        Self::from_parts(
            config.roots.clone(),
            config.mirror_extension.clone(),
            config.tracked.clone(),
        )
    }

    pub fn from_parts(
        mut roots: Vec<WatchedRoot>,
        mirror_extension: Extension,
        tracked: BTreeSet<Extension>,
    ) -> Self {
        roots.sort_by(|a, b| {
            b.path()
                .components()
                .count()
                .cmp(&a.path().components().count())
                .then_with(|| a.path().cmp(b.path()))
        });
        Self {
            roots,
            mirror_extension,
            tracked,
        }
    }

    pub fn roots(&self) -> &[WatchedRoot] {
        &self.roots
    }

    pub fn mirror_extension(&self) -> &Extension {
        &self.mirror_extension
    }

    /// True when `path` has a tracked extension (case-insensitive).
    pub fn is_tracked(&self, path: &Path) -> bool {
        Extension::of(path)
            .map(|ext| self.tracked.contains(&ext))
            .unwrap_or(false)
    }

    /// True when `path` lies in the mirror directory of any watched root.
    pub fn is_mirror_path(&self, path: &Path) -> bool {
        self.mirror_root_for(path).is_some()
    }

    /// The root whose mirror directory contains `path`.
    pub fn mirror_root_for(&self, path: &Path) -> Option<&WatchedRoot> {
        self.roots.iter().find(|root| root.contains_mirror_path(path))
    }

    /// The deepest watched root containing `path`.
    pub fn root_for(&self, path: &Path) -> Option<&WatchedRoot> {
        self.roots.iter().find(|root| path.starts_with(root.path()))
    }

    /// Root lookup plus [`PathMapper::to_mirror`].
    pub fn locate(&self, source: &Path) -> Result<(&WatchedRoot, PathBuf), PathError> {
        let root = self.root_for(source).ok_or_else(|| PathError::OutsideRoots {
            path: source.to_path_buf(),
        })?;
        let mirror = self.to_mirror(source, root)?;
        Ok((root, mirror))
    }

    /// `<root>/<rel>` → `<root>/<mirror_subdir>/<rel>` with the mirror extension.
    pub fn to_mirror(&self, source: &Path, root: &WatchedRoot) -> Result<PathBuf, PathError> {
        let rel = self.source_relative(source, root)?;
        if rel.as_os_str().is_empty() {
            return Err(PathError::Malformed {
                path: source.to_path_buf(),
                reason: "is the watched root itself",
            });
        }
        Ok(root
            .mirror_dir()
            .join(rel)
            .with_extension(self.mirror_extension.as_str()))
    }

    /// Directory variant of [`PathMapper::to_mirror`]: no extension rewrite.
    /// The root itself maps to its mirror directory.
    pub fn to_mirror_dir(&self, source_dir: &Path, root: &WatchedRoot) -> Result<PathBuf, PathError> {
        let rel = self.source_relative(source_dir, root)?;
        Ok(root.mirror_dir().join(rel))
    }

    /// Inverse of [`PathMapper::to_mirror`].
    ///
    /// The extension rewrite is many-to-one (`a.png` and `a.jpg` both become
    /// `a.webp`), so every tracked spelling is returned, in sorted order.
    pub fn to_source_candidates(
        &self,
        mirror: &Path,
        root: &WatchedRoot,
    ) -> Result<Vec<PathBuf>, PathError> {
        let mirror_dir = root.mirror_dir();
        let rel = mirror
            .strip_prefix(&mirror_dir)
            .map_err(|_| PathError::OutsideRoot {
                path: mirror.to_path_buf(),
                root: mirror_dir.clone(),
            })?;
        check_normal(mirror, rel)?;
        if rel.as_os_str().is_empty() {
            return Err(PathError::Malformed {
                path: mirror.to_path_buf(),
                reason: "is the mirror directory itself",
            });
        }
        if Extension::of(mirror).as_ref() != Some(&self.mirror_extension) {
            return Err(PathError::Malformed {
                path: mirror.to_path_buf(),
                reason: "is not a mirror artifact",
            });
        }
        let base = root.path().join(rel);
        Ok(self
            .tracked
            .iter()
            .map(|ext| base.with_extension(ext.as_str()))
            .collect())
    }

    fn source_relative<'p>(&self, source: &'p Path, root: &WatchedRoot) -> Result<&'p Path, PathError> {
        let rel = source
            .strip_prefix(root.path())
            .map_err(|_| PathError::OutsideRoot {
                path: source.to_path_buf(),
                root: root.path().to_path_buf(),
            })?;
        check_normal(source, rel)?;
        if let Some(mirror_root) = self.mirror_root_for(source) {
            return Err(PathError::InsideMirror {
                path: source.to_path_buf(),
                mirror: mirror_root.mirror_dir(),
            });
        }
        Ok(rel)
    }
}

fn check_normal(path: &Path, rel: &Path) -> Result<(), PathError> {
    if rel.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(())
    } else {
        Err(PathError::Malformed {
            path: path.to_path_buf(),
            reason: "contains non-normal components",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mapper() -> PathMapper {
        PathMapper::from_parts(
            vec![
                WatchedRoot::new("/w", ".mirror"),
                WatchedRoot::new("/w/nested", ".mirror"),
                WatchedRoot::new("/srv/site", "webp"),
            ],
            Extension::from("webp"),
            ["jpg", "jpeg", "png"].into_iter().map(Extension::from).collect(),
        )
    }

    #[rstest]
    #[case("/w/a/img.png", "/w/.mirror/a/img.webp")]
    #[case("/w/img.JPG", "/w/.mirror/img.webp")]
    #[case("/w/nested/b/c.jpeg", "/w/nested/.mirror/b/c.webp")]
    #[case("/srv/site/x.y.png", "/srv/site/webp/x.y.webp")]
    fn to_mirror_rewrites_prefix_and_extension(#[case] source: &str, #[case] expected: &str) {
        let mapper = mapper();
        let (_, mirror) = mapper.locate(Path::new(source)).expect("locate");
        assert_eq!(mirror, PathBuf::from(expected));
    }

    #[test]
    fn to_mirror_rejects_paths_outside_root() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        let err = mapper.to_mirror(Path::new("/elsewhere/a.png"), &root).unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot { .. }), "got: {err}");
        assert!(matches!(
            mapper.locate(Path::new("/elsewhere/a.png")),
            Err(PathError::OutsideRoots { .. })
        ));
    }

    #[test]
    fn mirror_of_mirror_is_rejected() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        let mirror = mapper.to_mirror(Path::new("/w/a/img.png"), &root).expect("map");
        let err = mapper.to_mirror(&mirror, &root).unwrap_err();
        assert!(matches!(err, PathError::InsideMirror { .. }), "got: {err}");
    }

    #[test]
    fn to_mirror_rejects_parent_components_and_root_itself() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        assert!(matches!(
            mapper.to_mirror(Path::new("/w/../etc/a.png"), &root),
            Err(PathError::Malformed { .. })
        ));
        assert!(matches!(
            mapper.to_mirror(Path::new("/w"), &root),
            Err(PathError::Malformed { .. })
        ));
    }

    #[test]
    fn to_mirror_dir_keeps_name_and_maps_root_to_mirror_dir() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        assert_eq!(
            mapper.to_mirror_dir(Path::new("/w/albums.2024"), &root).expect("dir"),
            PathBuf::from("/w/.mirror/albums.2024")
        );
        assert_eq!(
            mapper.to_mirror_dir(Path::new("/w"), &root).expect("root"),
            PathBuf::from("/w/.mirror")
        );
    }

    #[test]
    fn to_source_candidates_inverts_to_mirror() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        let source = Path::new("/w/a/img.png");
        let mirror = mapper.to_mirror(source, &root).expect("map");
        let candidates = mapper.to_source_candidates(&mirror, &root).expect("inverse");
        assert!(candidates.iter().any(|c| c == source));
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], PathBuf::from("/w/a/img.jpeg"));
    }

    #[test]
    fn to_source_candidates_rejects_non_mirror_input() {
        let mapper = mapper();
        let root = WatchedRoot::new("/w", ".mirror");
        assert!(matches!(
            mapper.to_source_candidates(Path::new("/w/a/img.webp"), &root),
            Err(PathError::OutsideRoot { .. })
        ));
        assert!(matches!(
            mapper.to_source_candidates(Path::new("/w/.mirror/a/img.webp.mirra.tmp"), &root),
            Err(PathError::Malformed { .. })
        ));
    }

    #[test]
    fn nested_root_wins_over_outer_root() {
        let mapper = mapper();
        let root = mapper.root_for(Path::new("/w/nested/x.png")).expect("root");
        assert_eq!(root.path(), Path::new("/w/nested"));
        assert!(mapper.is_mirror_path(Path::new("/w/nested/.mirror/x.webp")));
        assert!(!mapper.is_mirror_path(Path::new("/w/nested/x.png")));
    }

    #[test]
    fn tracked_check_is_case_insensitive() {
        let mapper = mapper();
        assert!(mapper.is_tracked(Path::new("/w/A.PNG")));
        assert!(!mapper.is_tracked(Path::new("/w/a.gif")));
        assert!(!mapper.is_tracked(Path::new("/w/Makefile")));
    }
}
