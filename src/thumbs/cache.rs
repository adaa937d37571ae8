use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::thumbnail::{fit_to_tile, save_thumbnail, PreviewSource};
use crate::error::CatalogError;
use crate::state::data::{CatalogEntry, Fingerprint, StableId, ThumbnailRef};

const DB_FILE_NAME: &str = "thumbnails.db";

/// Size limits for generated previews
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSettings {
    pub max_width: u32,
    pub max_height: u32,
    /// Eviction kicks in once blobs on disk exceed this many bytes
    pub max_cache_bytes: u64,
}

/// One row of the thumbnail store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRecord {
    pub stable_id: StableId,
    /// `Fingerprint::cache_key` of the source when the preview was made
    pub fingerprint: String,
    /// None for a recorded derivation failure
    pub blob_path: Option<PathBuf>,
    pub error: Option<String>,
    /// `PreviewSource::preview_stamp` at derivation time
    pub preview_stamp: Option<String>,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
}

impl ThumbnailRecord {
    fn to_thumbnail_ref(&self) -> Option<ThumbnailRef> {
        match (&self.blob_path, &self.error) {
            (Some(path), _) => Some(ThumbnailRef::Cached { path: path.clone() }),
            (None, Some(reason)) => Some(ThumbnailRef::Placeholder {
                reason: reason.clone(),
            }),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub reclaimed_bytes: u64,
    pub remaining_bytes: u64,
}

/// The ThumbnailCache derives previews on demand and remembers them.
///
/// Records live in SQLite keyed by (stable_id, fingerprint); PNG blobs sit
/// next to the database. Constructed once at startup and shared via `Arc`.
pub struct ThumbnailCache {
    dir: PathBuf,
    conn: Mutex<Connection>,
    source: Arc<dyn PreviewSource>,
    settings: ThumbnailSettings,
    /// One gate per (stable_id, fingerprint key) being derived right now
    gates: Mutex<HashMap<(StableId, String), Arc<Mutex<()>>>>,
}

impl ThumbnailCache {
    /// Open (or create) the cache rooted at `dir`
    pub fn open(
        dir: &Path,
        settings: ThumbnailSettings,
        source: Arc<dyn PreviewSource>,
    ) -> Result<Self, CatalogError> {
        fs::create_dir_all(dir).map_err(|e| CatalogError::io(dir, e))?;
        let conn = Connection::open(dir.join(DB_FILE_NAME))?;
        init_schema(&conn)?;

        info!(dir = %dir.display(), "thumbnail cache opened");
        Ok(ThumbnailCache {
            dir: dir.to_path_buf(),
            conn: Mutex::new(conn),
            source,
            settings,
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, CatalogError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&*conn)?)
    }

    /// Return the preview for `entry`, deriving it only when no valid record
    /// exists for the entry's current fingerprint.
    ///
    /// Never fails: problems turn into a placeholder reference.
    pub fn get_or_create(&self, entry: &CatalogEntry) -> ThumbnailRef {
        let key = entry.fingerprint.cache_key();
        let stamp = self.source.preview_stamp(&entry.source_path);

        if let Some(found) = self.lookup_logged(entry, &key, &stamp) {
            return found;
        }

        // callers racing on the same key wait here; the loser finds the winner's record
        let gate = self.gate(&entry.stable_id, &key);
        let derived = {
            let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
            match self.lookup_logged(entry, &key, &stamp) {
                Some(found) => found,
                None => self.derive(entry, &key, &stamp),
            }
        };
        self.release_gate(&entry.stable_id, &key, gate);
        derived
    }

    fn lookup_logged(
        &self,
        entry: &CatalogEntry,
        key: &str,
        stamp: &Option<String>,
    ) -> Option<ThumbnailRef> {
        match self.lookup_valid(&entry.stable_id, key, stamp) {
            Ok(found) => found,
            Err(err) => {
                warn!(id = %entry.stable_id, error = %err, "thumbnail lookup failed");
                None
            }
        }
    }

    fn gate(&self, id: &StableId, key: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            gates
                .entry((id.clone(), key.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn release_gate(&self, id: &StableId, key: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // the map holds one reference, `gate` the other; anyone else is still waiting
        if Arc::strong_count(&gate) == 2 {
            gates.remove(&(id.clone(), key.to_string()));
        }
    }

    /// Read the source, store the result and return its reference.
    /// Called with the key's gate held.
    fn derive(&self, entry: &CatalogEntry, key: &str, stamp: &Option<String>) -> ThumbnailRef {
        let blob_path = self.blob_path(&entry.stable_id, &entry.fingerprint, stamp.as_deref());
        let derived = self
            .source
            .load_preview(&entry.source_path)
            .map(|img| fit_to_tile(img, self.settings.max_width, self.settings.max_height))
            .and_then(|img| save_thumbnail(&img, &blob_path));

        let now = Utc::now().timestamp_millis();
        match derived {
            Ok(byte_size) => {
                debug!(id = %entry.stable_id, path = %blob_path.display(), "thumbnail derived");
                let stored = self.with_conn(|conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO thumbnails
                            (stable_id, fingerprint, blob_path, error, preview_stamp, byte_size, created_at, last_validated_at)
                         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?6)",
                        params![
                            entry.stable_id.as_str(),
                            key,
                            blob_path.to_string_lossy().into_owned(),
                            stamp,
                            byte_size as i64,
                            now
                        ],
                    )
                });
                if let Err(err) = stored {
                    warn!(id = %entry.stable_id, error = %err, "failed to record thumbnail");
                }
                ThumbnailRef::Cached { path: blob_path }
            }
            Err(source) => {
                let failure = CatalogError::ThumbnailDerivationFailed {
                    path: entry.source_path.clone(),
                    source,
                };
                let reason = failure.to_string();
                warn!(id = %entry.stable_id, %reason, "using placeholder thumbnail");
                let stored = self.with_conn(|conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO thumbnails
                            (stable_id, fingerprint, blob_path, error, preview_stamp, byte_size, created_at, last_validated_at)
                         VALUES (?1, ?2, NULL, ?3, ?4, 0, ?5, ?5)",
                        params![entry.stable_id.as_str(), key, reason, stamp, now],
                    )
                });
                if let Err(err) = stored {
                    warn!(id = %entry.stable_id, error = %err, "failed to record thumbnail failure");
                }
                ThumbnailRef::Placeholder { reason }
            }
        }
    }

    /// Find a usable record and mark it validated. A record whose blob has
    /// vanished from disk, or whose preview image changed, is dropped so the
    /// caller re-derives it.
    fn lookup_valid(
        &self,
        id: &StableId,
        key: &str,
        stamp: &Option<String>,
    ) -> Result<Option<ThumbnailRef>, CatalogError> {
        let Some(record) = self.record(id, key)? else {
            return Ok(None);
        };

        let blob_missing = record.blob_path.as_ref().is_some_and(|blob| !blob.is_file());
        if blob_missing || record.preview_stamp != *stamp {
            debug!(
                %id,
                blob_missing,
                old = ?record.preview_stamp,
                new = ?stamp,
                "thumbnail record outdated, re-deriving"
            );
            if let Some(blob) = record.blob_path.as_ref().filter(|_| !blob_missing) {
                if let Err(err) = fs::remove_file(blob) {
                    warn!(blob = %blob.display(), error = %err, "could not remove outdated thumbnail");
                }
            }
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM thumbnails WHERE stable_id = ?1 AND fingerprint = ?2",
                    params![id.as_str(), key],
                )
            })?;
            return Ok(None);
        }

        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE thumbnails SET last_validated_at = ?1 WHERE stable_id = ?2 AND fingerprint = ?3",
                params![now, id.as_str(), key],
            )
        })?;
        Ok(record.to_thumbnail_ref())
    }

    /// Fetch the record for (id, fingerprint key) without validating it
    pub fn record(&self, id: &StableId, key: &str) -> Result<Option<ThumbnailRecord>, CatalogError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT stable_id, fingerprint, blob_path, error, preview_stamp, byte_size,
                        created_at, last_validated_at
                 FROM thumbnails WHERE stable_id = ?1 AND fingerprint = ?2",
                params![id.as_str(), key],
                |row| {
                    let stable_id: String = row.get(0)?;
                    let blob_path: Option<String> = row.get(2)?;
                    let byte_size: i64 = row.get(5)?;
                    Ok(ThumbnailRecord {
                        stable_id: StableId::from_raw(stable_id),
                        fingerprint: row.get(1)?,
                        blob_path: blob_path.map(PathBuf::from),
                        error: row.get(3)?,
                        preview_stamp: row.get(4)?,
                        byte_size: u64::try_from(byte_size).unwrap_or(0),
                        created_at: from_millis(row.get(6)?),
                        last_validated_at: from_millis(row.get(7)?),
                    })
                },
            )
            .optional()
        })
    }

    /// Total bytes of stored blobs
    pub fn total_bytes(&self) -> Result<u64, CatalogError> {
        let total: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(byte_size), 0) FROM thumbnails",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    pub fn record_count(&self) -> Result<usize, CatalogError> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM thumbnails", [], |row| row.get(0))
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Trim the cache below its byte bound.
    ///
    /// Only records not in `active` (pairs of stable_id and fingerprint key of
    /// active catalog entries) may go, least recently validated first.
    pub fn evict(&self, active: &HashSet<(StableId, String)>) -> Result<EvictionReport, CatalogError> {
        let mut total = self.total_bytes()?;
        let mut report = EvictionReport {
            remaining_bytes: total,
            ..EvictionReport::default()
        };
        if total <= self.settings.max_cache_bytes {
            return Ok(report);
        }

        let candidates: Vec<(String, String, Option<String>, i64)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stable_id, fingerprint, blob_path, byte_size FROM thumbnails
                 ORDER BY last_validated_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            rows.collect()
        })?;

        for (id, key, blob, size) in candidates {
            if total <= self.settings.max_cache_bytes {
                break;
            }
            let id = StableId::from_raw(id);
            if active.contains(&(id.clone(), key.clone())) {
                continue;
            }

            if let Some(blob) = blob {
                if let Err(err) = fs::remove_file(&blob) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(blob = %blob, error = %err, "could not remove evicted thumbnail");
                        continue;
                    }
                }
            }
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM thumbnails WHERE stable_id = ?1 AND fingerprint = ?2",
                    params![id.as_str(), key],
                )
            })?;

            let size = u64::try_from(size).unwrap_or(0);
            total = total.saturating_sub(size);
            report.removed += 1;
            report.reclaimed_bytes += size;
        }

        report.remaining_bytes = total;
        info!(
            removed = report.removed,
            reclaimed = report.reclaimed_bytes,
            remaining = report.remaining_bytes,
            "thumbnail cache evicted"
        );
        Ok(report)
    }

    /// `<id>-<fingerprint>[-<stamp digest>].png`; a new cover image gets a
    /// new file name so consumers notice the change
    fn blob_path(&self, id: &StableId, fingerprint: &Fingerprint, stamp: Option<&str>) -> PathBuf {
        let name = match stamp {
            Some(stamp) => {
                let digest = Sha256::digest(stamp.as_bytes());
                let short: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
                format!("{}-{}-{}.png", id, fingerprint.cache_key(), short)
            }
            None => format!("{}-{}.png", id, fingerprint.cache_key()),
        };
        self.dir.join(name)
    }

    /// Release the database handle. Outstanding blobs stay on disk.
    pub fn close(self) -> Result<(), CatalogError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| CatalogError::Database(err))?;
        debug!(dir = %self.dir.display(), "thumbnail cache closed");
        Ok(())
    }
}

impl std::fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("dir", &self.dir)
            .field("settings", &self.settings)
            .finish()
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS thumbnails (
            stable_id           TEXT NOT NULL,
            fingerprint         TEXT NOT NULL,
            blob_path           TEXT,
            error               TEXT,
            preview_stamp       TEXT,
            byte_size           INTEGER NOT NULL DEFAULT 0,
            created_at          INTEGER NOT NULL,
            last_validated_at   INTEGER NOT NULL,
            PRIMARY KEY (stable_id, fingerprint)
        )",
        [],
    )?;

    // databases created before preview stamps existed; fails harmlessly when present
    let _ = conn.execute("ALTER TABLE thumbnails ADD COLUMN preview_stamp TEXT", []);

    // eviction walks records oldest-validated first
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_thumbnails_last_validated
         ON thumbnails(last_validated_at)",
        [],
    )?;
    Ok(())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
