//! # game-library
//!
//! Scan, index and thumbnail-cache engine behind a classic game launcher.
//!
//! The engine walks a games directory, keeps a persisted catalog of
//! launchable entries in sync with it, derives cached preview tiles and
//! answers title searches. A front-end drives it through [`GameLibrary`].

pub mod config;
pub mod error;
pub mod launch;
pub mod library;
pub mod scan;
pub mod search;
pub mod state;
pub mod thumbs;

pub use config::{CatalogConfig, DisplayPrefs, JsonSettings, SettingsProvider};
pub use error::{CatalogError, ThumbnailError};
pub use launch::{Launcher, ProcessLauncher};
pub use library::GameLibrary;
pub use scan::reconciler::{CatalogEvent, PassOutcome, PassResult, ReconcilerState};
pub use search::SearchIndex;
pub use state::data::{
    Catalog, CatalogEntry, ChangeOrigin, ChangeSet, EntryStatus, Fingerprint, PassWarning,
    StableId, ThumbnailRef,
};
pub use thumbs::thumbnail::PreviewSource;

/// Install a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects the verbosity.
/// Call once from the front-end; the library never installs one itself.
pub fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    // a second call keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
