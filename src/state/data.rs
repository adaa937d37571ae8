/// Shared data structures for the catalog
///
/// These structs represent the data model that flows between
/// the store, the reconciler and the presentation layer.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Path-derived identity of a catalog entry.
///
/// Two scans of the same path always produce the same id, so an entry can be
/// tracked across rescans, restarts and remounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// Number of digest bytes kept in the id (24 hex chars)
    const DIGEST_BYTES: usize = 12;

    pub fn from_path(path: &Path) -> Self {
        let normalized = normalize_path(path);
        let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
        let hex = digest
            .iter()
            .take(Self::DIGEST_BYTES)
            .map(|b| format!("{b:02x}"))
            .collect();
        StableId(hex)
    }

    /// Wrap an id read back from storage
    pub(crate) fn from_raw(raw: String) -> Self {
        StableId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexically normalize a path: drop `.` segments and fold `..` into its parent.
/// Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Cheap change detector: size plus modification time.
///
/// A file rewritten with identical size and mtime is indistinguishable from
/// the file it replaced. That is a known limitation, content hashing is not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Nanoseconds since the Unix epoch (0 when the platform has no mtime)
    pub mtime_ns: u64,
}

impl Fingerprint {
    pub fn new(size: u64, modified: SystemTime) -> Self {
        let mtime_ns = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Fingerprint { size, mtime_ns }
    }

    /// Key used to address cached thumbnails for this fingerprint
    pub fn cache_key(&self) -> String {
        format!("{:x}-{:x}", self.size, self.mtime_ns)
    }
}

/// One launchable file (or bundle directory) yielded by the indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl ScannedFile {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.size, self.modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    /// Soft-deleted: the path was absent from the latest pass
    Missing,
}

/// Where the presentation layer finds an entry's preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThumbnailRef {
    /// PNG blob inside the thumbnail cache directory
    Cached { path: PathBuf },
    /// Derivation failed; draw the default tile icon
    Placeholder { reason: String },
}

impl ThumbnailRef {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, ThumbnailRef::Placeholder { .. })
    }
}

/// Represents a single game in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub stable_id: StableId,
    /// File stem, e.g. "Chess Master" for `Chess Master.exe`
    pub display_title: String,
    pub source_path: PathBuf,
    /// None while a preview is still being derived
    pub thumbnail: Option<ThumbnailRef>,
    pub fingerprint: Fingerprint,
    pub status: EntryStatus,
    pub added_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub(crate) fn discovered(file: &ScannedFile) -> Self {
        CatalogEntry {
            stable_id: StableId::from_path(&file.path),
            display_title: display_title_for(&file.path),
            source_path: file.path.clone(),
            thumbnail: None,
            fingerprint: file.fingerprint(),
            status: EntryStatus::Active,
            added_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }
}

pub fn display_title_for(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// The full catalog: stable_id -> entry plus a revision counter.
///
/// Owned by the MetadataStore; everyone else sees it through `Arc` snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub(crate) revision: u64,
    pub(crate) entries: HashMap<StableId, CatalogEntry>,
}

impl Catalog {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &StableId) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&CatalogEntry> {
        self.entries.get(&StableId::from_path(path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn active_entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values().filter(|e| e.is_active())
    }
}

/// Which activity produced a ChangeSet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A full reconciliation pass
    Pass,
    /// Thumbnails resolved after their pass had already been published
    Thumbnails,
}

/// Non-fatal problems attached to a ChangeSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassWarning {
    /// The in-memory catalog advanced but could not be written to disk
    PersistFailed { reason: String },
    EvictionFailed { reason: String },
}

/// Diff produced by one reconciliation pass (or thumbnail follow-up)
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub origin: ChangeOrigin,
    /// Catalog revision after the change was applied
    pub revision: u64,
    pub added: Vec<CatalogEntry>,
    pub updated: Vec<CatalogEntry>,
    pub removed: Vec<StableId>,
    pub warnings: Vec<PassWarning>,
}

impl ChangeSet {
    pub fn new(origin: ChangeOrigin) -> Self {
        ChangeSet {
            origin,
            revision: 0,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// True when no entry was added, updated or removed. Warnings don't count.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stable_id_ignores_dot_segments() {
        let a = StableId::from_path(Path::new("/games/dos/./doom/../doom/doom.exe"));
        let b = StableId::from_path(Path::new("/games/dos/doom/doom.exe"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 24);
    }

    #[test]
    fn stable_id_differs_per_path() {
        let a = StableId::from_path(Path::new("/games/a.exe"));
        let b = StableId::from_path(Path::new("/games/b.exe"));
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_tracks_size_and_mtime() {
        let t1 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let t2 = t1 + Duration::from_millis(5);
        assert_eq!(Fingerprint::new(100, t1), Fingerprint::new(100, t1));
        assert_ne!(Fingerprint::new(100, t1), Fingerprint::new(150, t1));
        assert_ne!(Fingerprint::new(100, t1), Fingerprint::new(100, t2));
        assert_ne!(
            Fingerprint::new(100, t1).cache_key(),
            Fingerprint::new(100, t2).cache_key()
        );
    }

    #[test]
    fn display_title_is_file_stem() {
        assert_eq!(display_title_for(Path::new("/g/Chess Master.exe")), "Chess Master");
        assert_eq!(display_title_for(Path::new("/g/Solitaire.app")), "Solitaire");
        assert_eq!(display_title_for(Path::new("/g/run")), "run");
    }

    #[test]
    fn change_set_emptiness_ignores_warnings() {
        let mut changes = ChangeSet::new(ChangeOrigin::Pass);
        changes.warnings.push(PassWarning::PersistFailed {
            reason: "disk full".into(),
        });
        assert!(changes.is_empty());
        assert!(changes.has_warnings());
    }
}
