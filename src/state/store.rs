use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::data::{
    Catalog, CatalogEntry, ChangeOrigin, ChangeSet, EntryStatus, Fingerprint, ScannedFile,
    StableId, ThumbnailRef,
};
use crate::error::CatalogError;

/// Bump when the on-disk document layout changes
const CATALOG_VERSION: u32 = 1;

/// The MetadataStore owns the catalog and its JSON document on disk.
///
/// Readers get `Arc<Catalog>` snapshots. Every mutation builds a new catalog
/// and swaps it in whole, so a snapshot never shows a half-applied merge.
pub struct MetadataStore {
    catalog_path: PathBuf,
    catalog: Arc<Catalog>,
}

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    revision: u64,
    saved_at: DateTime<Utc>,
    entries: BTreeMap<StableId, CatalogEntry>,
}

impl MetadataStore {
    /// Create a store for `catalog_path` holding an empty catalog. Call
    /// [`MetadataStore::load`] to read what is on disk.
    pub fn new(catalog_path: impl Into<PathBuf>) -> Self {
        MetadataStore {
            catalog_path: catalog_path.into(),
            catalog: Arc::new(Catalog::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.catalog_path
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    /// Read the persisted catalog into memory.
    ///
    /// A missing file is an empty catalog. A corrupt file is moved aside and
    /// the store starts empty; the returned `CorruptCatalog` error tells the
    /// caller recovery happened, the store itself stays usable.
    pub fn load(&mut self) -> Result<usize, CatalogError> {
        let bytes = match fs::read(&self.catalog_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.catalog_path.display(), "no catalog on disk, starting empty");
                self.catalog = Arc::new(Catalog::default());
                return Ok(0);
            }
            Err(err) => return Err(CatalogError::io(&self.catalog_path, err)),
        };

        match parse_document(&bytes) {
            Ok(catalog) => {
                let count = catalog.len();
                info!(
                    path = %self.catalog_path.display(),
                    entries = count,
                    revision = catalog.revision,
                    "catalog loaded"
                );
                self.catalog = Arc::new(catalog);
                Ok(count)
            }
            Err(reason) => {
                let backup = self.back_up_corrupt_file();
                warn!(
                    path = %self.catalog_path.display(),
                    backup = ?backup,
                    %reason,
                    "catalog is corrupt, starting from an empty catalog"
                );
                self.catalog = Arc::new(Catalog::default());
                Err(CatalogError::CorruptCatalog {
                    path: self.catalog_path.clone(),
                    backup,
                    reason,
                })
            }
        }
    }

    fn back_up_corrupt_file(&self) -> Option<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut name = self.catalog_path.as_os_str().to_owned();
        name.push(format!(".corrupt-{stamp}"));
        let backup = PathBuf::from(name);
        match fs::rename(&self.catalog_path, &backup) {
            Ok(()) => Some(backup),
            Err(err) => {
                warn!(error = %err, "could not back up corrupt catalog");
                None
            }
        }
    }

    /// Persist the whole catalog atomically
    pub fn save(&self) -> Result<(), CatalogError> {
        write_catalog(&self.catalog_path, &self.catalog)
    }

    /// Start an incremental merge against a private copy of the catalog.
    /// Nothing is visible to readers until [`MetadataStore::commit`].
    pub fn begin_merge(&self) -> MergeSession {
        MergeSession {
            working: (*self.catalog).clone(),
            seen: HashSet::new(),
            changes: ChangeSet::new(ChangeOrigin::Pass),
        }
    }

    pub fn commit(&mut self, catalog: Catalog) {
        self.catalog = Arc::new(catalog);
    }

    /// Merge a complete scan in one go.
    ///
    /// Unseen paths are added, changed fingerprints are updated, and active
    /// entries absent from `scanned` are soft-deleted (status = missing).
    pub fn merge<I>(&mut self, scanned: I) -> ChangeSet
    where
        I: IntoIterator<Item = ScannedFile>,
    {
        let mut session = self.begin_merge();
        for file in scanned {
            session.observe(&file);
        }
        let (catalog, changes) = session.finish();
        self.commit(catalog);
        changes
    }

    /// Attach resolved thumbnails to their entries.
    ///
    /// A result is dropped when its entry is gone or the entry's fingerprint
    /// moved on since the job was dispatched. Returns the entries that changed.
    pub fn apply_thumbnails<I>(&mut self, results: I) -> Vec<CatalogEntry>
    where
        I: IntoIterator<Item = (StableId, Fingerprint, ThumbnailRef)>,
    {
        let mut next = (*self.catalog).clone();
        let mut updated = Vec::new();

        for (id, fingerprint, thumbnail) in results {
            let Some(entry) = next.entries.get_mut(&id) else {
                debug!(%id, "thumbnail for unknown entry discarded");
                continue;
            };
            if entry.fingerprint != fingerprint {
                debug!(%id, "stale thumbnail discarded");
                continue;
            }
            if entry.thumbnail.as_ref() == Some(&thumbnail) {
                continue;
            }
            entry.thumbnail = Some(thumbnail);
            updated.push(entry.clone());
        }

        if !updated.is_empty() {
            next.revision += 1;
            self.catalog = Arc::new(next);
        }
        updated
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("catalog_path", &self.catalog_path)
            .field("revision", &self.catalog.revision)
            .field("entries", &self.catalog.len())
            .finish()
    }
}

/// Outcome of observing one scanned file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// New path, or a missing entry that came back
    Added,
    Updated,
}

#[derive(Debug, Clone)]
pub struct Observed {
    pub change: Option<ChangeKind>,
    pub entry: CatalogEntry,
}

/// Per-pass working copy, fed one scanned file at a time
pub struct MergeSession {
    working: Catalog,
    seen: HashSet<StableId>,
    changes: ChangeSet,
}

impl MergeSession {
    pub fn observe(&mut self, file: &ScannedFile) -> Observed {
        let id = StableId::from_path(&file.path);
        let fingerprint = file.fingerprint();
        let first_sighting = self.seen.insert(id.clone());

        let Some(entry) = self.working.entries.get_mut(&id) else {
            let entry = CatalogEntry::discovered(file);
            self.working.entries.insert(id, entry.clone());
            self.changes.added.push(entry.clone());
            return Observed {
                change: Some(ChangeKind::Added),
                entry,
            };
        };

        if !first_sighting {
            return Observed {
                change: None,
                entry: entry.clone(),
            };
        }

        let resurrected = entry.status == EntryStatus::Missing;
        let changed = entry.fingerprint != fingerprint;
        if changed {
            entry.fingerprint = fingerprint;
            // old preview is stale until the cache answers for the new fingerprint
            entry.thumbnail = None;
        }
        entry.status = EntryStatus::Active;

        let change = if resurrected {
            self.changes.added.push(entry.clone());
            Some(ChangeKind::Added)
        } else if changed {
            self.changes.updated.push(entry.clone());
            Some(ChangeKind::Updated)
        } else {
            None
        };

        Observed {
            change,
            entry: entry.clone(),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Soft-delete everything active that was not observed and seal the pass.
    pub fn finish(mut self) -> (Catalog, ChangeSet) {
        for (id, entry) in self.working.entries.iter_mut() {
            if entry.status == EntryStatus::Active && !self.seen.contains(id) {
                entry.status = EntryStatus::Missing;
                self.changes.removed.push(id.clone());
            }
        }
        self.changes.removed.sort();

        if !self.changes.is_empty() {
            self.working.revision += 1;
        }
        self.changes.revision = self.working.revision;
        (self.working, self.changes)
    }
}

fn parse_document(bytes: &[u8]) -> Result<Catalog, String> {
    let document: CatalogDocument = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if document.version != CATALOG_VERSION {
        return Err(format!(
            "unsupported catalog version {} (expected {CATALOG_VERSION})",
            document.version
        ));
    }
    for (id, entry) in &document.entries {
        if *id != entry.stable_id {
            return Err(format!("key {id} does not match entry id {}", entry.stable_id));
        }
    }
    Ok(Catalog {
        revision: document.revision,
        entries: document.entries.into_iter().collect(),
    })
}

/// Write `catalog` to `path` via a temp file and rename, so a crash never
/// leaves a half-written document behind.
pub fn write_catalog(path: &Path, catalog: &Catalog) -> Result<(), CatalogError> {
    let persist_err = |source: io::Error| CatalogError::PersistFailed {
        path: path.to_path_buf(),
        source,
    };

    let document = CatalogDocument {
        version: CATALOG_VERSION,
        revision: catalog.revision,
        saved_at: Utc::now(),
        entries: catalog
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect(),
    };
    let data = serde_json::to_vec_pretty(&document)
        .map_err(|e| persist_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(persist_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp_path).map_err(persist_err)?;
        file.write_all(&data).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
    }
    fs::rename(&tmp_path, path).map_err(persist_err)?;

    debug!(path = %path.display(), revision = catalog.revision, "catalog saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn scanned(root: &Path, name: &str, size: u64, secs: u64) -> ScannedFile {
        ScannedFile {
            path: root.join(name),
            size,
            modified: UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    fn store_in(dir: &TempDir) -> MetadataStore {
        MetadataStore::new(dir.path().join("catalog.json"))
    }

    #[test]
    fn load_without_file_gives_empty_catalog() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = store_in(&dir);
        assert_eq!(store.load().expect("load"), 0);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn merge_classifies_added_updated_and_missing() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);

        let first = store.merge(vec![
            scanned(root, "a.exe", 100, 10),
            scanned(root, "b.sh", 20, 10),
        ]);
        assert_eq!(first.added.len(), 2);
        assert_eq!(first.revision, 1);

        let second = store.merge(vec![scanned(root, "a.exe", 150, 11)]);
        assert_eq!(second.added.len(), 0);
        assert_eq!(second.updated.len(), 1);
        assert_eq!(second.updated[0].fingerprint.size, 150);
        assert_eq!(second.removed, vec![StableId::from_path(&root.join("b.sh"))]);
        assert_eq!(second.revision, 2);

        let snapshot = store.snapshot();
        let b = snapshot.get_by_path(&root.join("b.sh")).expect("b retained");
        assert_eq!(b.status, EntryStatus::Missing);
    }

    #[test]
    fn unchanged_merge_is_empty_and_keeps_revision() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);

        store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        let again = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        assert!(again.is_empty());
        assert_eq!(store.snapshot().revision(), 1);
    }

    #[test]
    fn missing_entry_is_resurrected_with_same_id() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);

        let added = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        let id = added.added[0].stable_id.clone();
        store.merge(Vec::new());
        assert_eq!(
            store.snapshot().get(&id).map(|e| e.status),
            Some(EntryStatus::Missing)
        );

        let back = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        assert_eq!(back.added.len(), 1);
        assert_eq!(back.added[0].stable_id, id);
        assert_eq!(back.added[0].status, EntryStatus::Active);
    }

    #[test]
    fn already_missing_entries_are_not_removed_twice() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);

        store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        assert_eq!(store.merge(Vec::new()).removed.len(), 1);
        assert!(store.merge(Vec::new()).is_empty());
    }

    #[test]
    fn fingerprint_change_clears_thumbnail() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);

        let added = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        let entry = &added.added[0];
        store.apply_thumbnails(vec![(
            entry.stable_id.clone(),
            entry.fingerprint,
            ThumbnailRef::Cached {
                path: root.join("thumb.png"),
            },
        )]);

        let changed = store.merge(vec![scanned(root, "a.exe", 150, 12)]);
        assert_eq!(changed.updated[0].thumbnail, None);
    }

    #[test]
    fn save_then_load_restores_entries_and_revision() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);
        store.merge(vec![
            scanned(root, "a.exe", 100, 10),
            scanned(root, "b.exe", 100, 10),
        ]);
        store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        store.save().expect("save");
        assert!(!dir.path().join("catalog.json.tmp").exists());

        let mut reloaded = store_in(&dir);
        assert_eq!(reloaded.load().expect("load"), 2);
        assert_eq!(*reloaded.snapshot(), *store.snapshot());
    }

    #[test]
    fn corrupt_catalog_is_backed_up_and_reset() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("catalog.json");
        fs::write(&path, b"{ not json").expect("write");

        let mut store = store_in(&dir);
        let err = store.load().expect_err("corrupt");
        let backup = match err {
            CatalogError::CorruptCatalog { backup, .. } => backup.expect("backup made"),
            other => panic!("unexpected error: {other}"),
        };
        assert!(backup.exists());
        assert!(!path.exists());
        assert!(store.snapshot().is_empty());

        // the store remains usable after recovery
        let changes = store.merge(vec![scanned(dir.path(), "a.exe", 1, 1)]);
        assert_eq!(changes.added.len(), 1);
        store.save().expect("save after recovery");
    }

    #[test]
    fn version_mismatch_counts_as_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            br#"{"version":99,"revision":1,"saved_at":"2024-01-01T00:00:00Z","entries":{}}"#,
        )
        .expect("write");

        let mut store = store_in(&dir);
        assert!(matches!(
            store.load(),
            Err(CatalogError::CorruptCatalog { .. })
        ));
    }

    #[test]
    fn snapshots_are_isolated_from_later_mutation() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);
        let added = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        let entry = added.added[0].clone();

        let before = store.snapshot();
        let updated = store.apply_thumbnails(vec![(
            entry.stable_id.clone(),
            entry.fingerprint,
            ThumbnailRef::Placeholder {
                reason: "no preview".into(),
            },
        )]);
        assert_eq!(updated.len(), 1);
        assert_eq!(before.get(&entry.stable_id).and_then(|e| e.thumbnail.clone()), None);
        assert_eq!(store.snapshot().revision(), before.revision() + 1);
    }

    #[test]
    fn stale_thumbnail_results_are_discarded() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut store = store_in(&dir);
        let added = store.merge(vec![scanned(root, "a.exe", 100, 10)]);
        let old = added.added[0].clone();
        store.merge(vec![scanned(root, "a.exe", 150, 11)]);

        let updated = store.apply_thumbnails(vec![(
            old.stable_id.clone(),
            old.fingerprint,
            ThumbnailRef::Cached {
                path: root.join("old.png"),
            },
        )]);
        assert!(updated.is_empty());
    }
}
