use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::CatalogError;
use crate::state::data::ScannedFile;

/// Walks a directory tree and yields launchable files.
///
/// Each call to [`PathIndexer::walk`] starts from scratch; no walk state is
/// kept between calls.
#[derive(Debug, Clone)]
pub struct PathIndexer {
    root: PathBuf,
    extensions: Arc<[String]>,
    follow_links: bool,
}

impl PathIndexer {
    pub fn new<I, S>(root: impl Into<PathBuf>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        PathIndexer {
            root: root.into(),
            extensions: extensions.into(),
            follow_links: true,
        }
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a lazy walk. Only an unreadable root is an error; everything
    /// below it that cannot be read is logged and skipped.
    pub fn walk(&self) -> Result<ScanIter, CatalogError> {
        let unavailable = |source: io::Error| CatalogError::RootUnavailable {
            path: self.root.clone(),
            source,
        };
        let root = fs::canonicalize(&self.root).map_err(unavailable)?;
        fs::read_dir(&root).map_err(unavailable)?;

        debug!(root = %root.display(), extensions = ?self.extensions, "walking");
        let inner = WalkDir::new(&root)
            .follow_links(self.follow_links)
            .min_depth(1)
            .into_iter();
        Ok(ScanIter {
            inner,
            extensions: Arc::clone(&self.extensions),
            skipped: 0,
        })
    }

    pub fn is_launchable(&self, path: &Path) -> bool {
        matches_extension(&self.extensions, path)
    }
}

fn matches_extension(extensions: &[String], path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|x| *x == ext))
}

/// Lazy walk over one directory tree. Deeper entries are discovered only as
/// the caller pulls, so early items can be processed right away.
pub struct ScanIter {
    inner: walkdir::IntoIter,
    extensions: Arc<[String]>,
    skipped: usize,
}

impl ScanIter {
    /// Directories and files skipped so far because they could not be read
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn skip(&mut self, err: walkdir::Error) {
        self.skipped += 1;
        let path = err.path().map(Path::to_path_buf).unwrap_or_default();
        if let Some(ancestor) = err.loop_ancestor() {
            warn!(
                path = %path.display(),
                ancestor = %ancestor.display(),
                "symlink cycle, skipping"
            );
        } else if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::PermissionDenied) {
            warn!("{}, skipping", CatalogError::PermissionDenied { path });
        } else {
            warn!(path = %path.display(), error = %err, "unreadable entry, skipping");
        }
    }
}

impl Iterator for ScanIter {
    type Item = ScannedFile;

    fn next(&mut self) -> Option<ScannedFile> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    self.skip(err);
                    continue;
                }
            };

            if !matches_extension(&self.extensions, entry.path()) {
                continue;
            }

            // `Foo.app` style bundles are one launchable unit
            if entry.file_type().is_dir() {
                self.inner.skip_current_dir();
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    self.skip(err);
                    continue;
                }
            };
            let size = if metadata.is_dir() { 0 } else { metadata.len() };
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

            return Some(ScannedFile {
                path: entry.into_path(),
                size,
                modified,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(files: &[ScannedFile]) -> Vec<String> {
        let mut out: Vec<String> = files
            .iter()
            .filter_map(|f| f.path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn walk_finds_nested_launchables() {
        let dir = TempDir::new().expect("tempdir");
        let deep = dir.path().join("dos").join("arcade");
        fs::create_dir_all(&deep).expect("mkdir");
        fs::write(dir.path().join("top.exe"), [0u8; 100]).expect("write");
        fs::write(deep.join("pong.SH"), b"#!/bin/sh").expect("write");
        fs::write(deep.join("readme.txt"), b"hi").expect("write");
        fs::write(deep.join("pong.png"), b"png").expect("write");

        let indexer = PathIndexer::new(dir.path(), ["exe", ".sh"]);
        let files: Vec<ScannedFile> = indexer.walk().expect("walk").collect();
        assert_eq!(names(&files), vec!["pong.SH", "top.exe"]);

        let top = files
            .iter()
            .find(|f| f.path.ends_with("top.exe"))
            .expect("top.exe");
        assert_eq!(top.size, 100);
        assert!(top.path.is_absolute());
    }

    #[test]
    fn walk_is_restartable() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.exe"), b"a").expect("write");
        let indexer = PathIndexer::new(dir.path(), ["exe"]);

        assert_eq!(indexer.walk().expect("walk").count(), 1);
        fs::write(dir.path().join("b.exe"), b"b").expect("write");
        assert_eq!(indexer.walk().expect("walk").count(), 2);
    }

    #[test]
    fn walk_yields_incrementally() {
        let dir = TempDir::new().expect("tempdir");
        for i in 0..5 {
            let sub = dir.path().join(format!("d{i}"));
            fs::create_dir_all(&sub).expect("mkdir");
            fs::write(sub.join(format!("g{i}.exe")), b"x").expect("write");
        }
        let indexer = PathIndexer::new(dir.path(), ["exe"]);
        let mut iter = indexer.walk().expect("walk");
        assert!(iter.next().is_some());
        assert_eq!(iter.count(), 4);
    }

    #[test]
    fn app_bundle_is_one_entry() {
        let dir = TempDir::new().expect("tempdir");
        let bundle = dir.path().join("Solitaire.app");
        fs::create_dir_all(bundle.join("Contents").join("MacOS")).expect("mkdir");
        fs::write(bundle.join("Contents").join("MacOS").join("inner.app"), b"x").expect("write");

        let indexer = PathIndexer::new(dir.path(), ["exe", "app", "sh"]);
        let files: Vec<ScannedFile> = indexer.walk().expect("walk").collect();
        assert_eq!(names(&files), vec!["Solitaire.app"]);
        assert_eq!(files[0].size, 0);
    }

    #[test]
    fn missing_root_is_root_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let indexer = PathIndexer::new(dir.path().join("nope"), ["exe"]);
        assert!(matches!(
            indexer.walk(),
            Err(CatalogError::RootUnavailable { .. })
        ));
    }

    #[test]
    fn file_root_is_root_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("a.exe");
        fs::write(&file, b"x").expect("write");
        let indexer = PathIndexer::new(&file, ["exe"]);
        assert!(matches!(
            indexer.walk(),
            Err(CatalogError::RootUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let locked = dir.path().join("locked");
        fs::create_dir_all(&locked).expect("mkdir");
        fs::write(locked.join("hidden.exe"), b"x").expect("write");
        fs::write(dir.path().join("open.exe"), b"x").expect("write");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");

        // privileged users read through mode 000; nothing to test then
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let indexer = PathIndexer::new(dir.path(), ["exe"]);
        let mut iter = indexer.walk().expect("walk");
        let files: Vec<ScannedFile> = iter.by_ref().collect();
        let skipped = iter.skipped();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert_eq!(names(&files), vec!["open.exe"]);
        assert_eq!(skipped, 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).expect("mkdir");
        fs::write(sub.join("game.exe"), b"x").expect("write");
        std::os::unix::fs::symlink(dir.path(), sub.join("loop")).expect("symlink");

        let indexer = PathIndexer::new(dir.path(), ["exe"]);
        let mut iter = indexer.walk().expect("walk");
        let files: Vec<ScannedFile> = iter.by_ref().collect();
        assert_eq!(names(&files), vec!["game.exe"]);
        assert!(iter.skipped() >= 1);
    }
}
