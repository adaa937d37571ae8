//! Error taxonomy for the catalog core
//!
//! Only `RootUnavailable` and `CorruptCatalog` ever reach the caller of a
//! top-level operation. Everything per-entry is absorbed into entry state.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::data::StableId;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("scan root {} is unavailable: {source}", path.display())]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("catalog {} is corrupt ({reason}); backup: {backup:?}", path.display())]
    CorruptCatalog {
        path: PathBuf,
        backup: Option<PathBuf>,
        reason: String,
    },

    #[error("thumbnail derivation failed for {}: {source}", path.display())]
    ThumbnailDerivationFailed {
        path: PathBuf,
        #[source]
        source: ThumbnailError,
    },

    #[error("failed to persist catalog to {}: {source}", path.display())]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied while traversing {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("thumbnail database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid setting {key}={value:?}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error("no catalog entry with id {0}")]
    UnknownEntry(StableId),

    #[error("catalog entry {0} is missing from disk")]
    EntryMissing(StableId),

    #[error("failed to launch {}: {source}", path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("catalog service has shut down")]
    ServiceStopped,
}

impl CatalogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CatalogError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for CatalogError {
    fn from(err: tokio::task::JoinError) -> Self {
        CatalogError::TaskFailed(err.to_string())
    }
}

/// Failure to produce a preview for a single entry.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("no preview image found for {}", path.display())]
    NoPreview { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write thumbnail {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to store thumbnail {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
