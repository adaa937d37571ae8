//! Facade the presentation layer talks to
//!
//! Owns the reconciler task and hands out read-only views of the catalog.
//! All mutation goes through the reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{CatalogConfig, DisplayPrefs};
use crate::error::CatalogError;
use crate::launch::Launcher;
use crate::scan::indexer::PathIndexer;
use crate::scan::reconciler::{
    CatalogEvent, Command, PassResult, Publisher, Reconciler, ReconcilerState,
};
use crate::search::SearchIndex;
use crate::state::data::{Catalog, CatalogEntry, StableId};
use crate::state::store::MetadataStore;
use crate::thumbs::cache::ThumbnailCache;
use crate::thumbs::thumbnail::{PreviewSource, SiblingImageSource};

/// Commands queued for the reconciler before senders start waiting
const COMMAND_BUFFER: usize = 32;

pub struct GameLibrary {
    config: CatalogConfig,
    commands: mpsc::Sender<Command>,
    refresh_requested: Arc<AtomicBool>,
    snapshots: watch::Receiver<Arc<Catalog>>,
    state: watch::Receiver<ReconcilerState>,
    search: Arc<RwLock<Arc<SearchIndex>>>,
    events: broadcast::Sender<CatalogEvent>,
    thumbnails: Arc<ThumbnailCache>,
    launcher: Arc<dyn Launcher>,
    recovery: Option<CatalogError>,
    worker: JoinHandle<()>,
}

impl GameLibrary {
    /// Open the library with sibling-image previews
    pub async fn open(
        config: CatalogConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, CatalogError> {
        Self::open_with_source(config, launcher, Arc::new(SiblingImageSource)).await
    }

    /// Load the catalog, open the thumbnail cache and start the reconciler.
    ///
    /// A corrupt catalog does not fail startup: it is backed up, the library
    /// starts empty and the error is kept in [`GameLibrary::recovery`].
    pub async fn open_with_source(
        config: CatalogConfig,
        launcher: Arc<dyn Launcher>,
        source: Arc<dyn PreviewSource>,
    ) -> Result<Self, CatalogError> {
        let catalog_path = config.catalog_path.clone();
        let (store, loaded) = task::spawn_blocking(move || {
            let mut store = MetadataStore::new(catalog_path);
            let loaded = store.load();
            (store, loaded)
        })
        .await?;

        let recovery = match loaded {
            Ok(count) => {
                debug!(entries = count, "catalog ready");
                None
            }
            Err(err @ CatalogError::CorruptCatalog { .. }) => {
                warn!(error = %err, "continuing with an empty catalog");
                Some(err)
            }
            Err(err) => return Err(err),
        };

        let thumb_dir = config.thumbnail_dir.clone();
        let settings = config.thumbnail_settings();
        let thumbnails = task::spawn_blocking(move || {
            ThumbnailCache::open(&thumb_dir, settings, source)
        })
        .await??;
        let thumbnails = Arc::new(thumbnails);

        let indexer = PathIndexer::new(&config.root_directory, &config.include_extensions)
            .follow_links(config.follow_symlinks);
        let publisher = Publisher::new(store.snapshot());
        let snapshots = publisher.snapshots.subscribe();
        let state = publisher.state.subscribe();
        let search = Arc::clone(&publisher.search);
        let events = publisher.events.clone();

        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let reconciler = Reconciler::new(
            indexer,
            store,
            Arc::clone(&thumbnails),
            config.worker_pool_size(),
            publisher,
            rx,
        )
        .with_refresh_interval(config.refresh_interval());
        let refresh_requested = reconciler.refresh_flag();
        let worker = tokio::spawn(reconciler.run());

        if config.scan_on_startup {
            let _ = commands.try_send(Command::Refresh { reply: None });
        }

        info!(
            root = %config.root_directory.display(),
            catalog = %config.catalog_path.display(),
            "game library opened"
        );
        Ok(GameLibrary {
            config,
            commands,
            refresh_requested,
            snapshots,
            state,
            search,
            events,
            thumbnails,
            launcher,
            recovery,
            worker,
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn display(&self) -> DisplayPrefs {
        self.config.display
    }

    /// Set when startup had to discard a corrupt catalog
    pub fn recovery(&self) -> Option<&CatalogError> {
        self.recovery.as_ref()
    }

    /// Latest published catalog. Never blocks on a pass in flight.
    pub fn get_snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    /// Active entries whose title contains `text`, ordered by title
    pub fn search(&self, text: &str) -> Vec<CatalogEntry> {
        let index = Arc::clone(&self.search.read().unwrap_or_else(PoisonError::into_inner));
        index.query(text).cloned().collect()
    }

    /// Request a pass without waiting for it. Requests made while a pass is
    /// running collapse into a single follow-up pass.
    pub fn trigger_refresh(&self) -> Result<(), CatalogError> {
        match self.commands.try_send(Command::Refresh { reply: None }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // picked up as soon as the reconciler drains its queue
                debug!("command queue full, raising refresh flag");
                self.refresh_requested.store(true, Ordering::Release);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CatalogError::ServiceStopped),
        }
    }

    /// Request a pass and wait for the outcome of the pass it was folded into
    pub async fn refresh(&self) -> PassResult {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Refresh { reply: Some(reply) })
            .await
            .map_err(Arc::new)?;
        outcome
            .await
            .unwrap_or_else(|_| Err(Arc::new(CatalogError::ServiceStopped)))
    }

    /// Abandon the pass in flight; nothing it saw is merged
    pub async fn cancel_refresh(&self) -> Result<(), CatalogError> {
        self.send(Command::Cancel).await
    }

    /// Abandon the pass in flight and start over
    pub async fn restart_refresh(&self) -> PassResult {
        self.cancel_refresh().await.map_err(Arc::new)?;
        self.refresh().await
    }

    /// Wait until every dispatched thumbnail has been applied to the catalog
    pub async fn flush_thumbnails(&self) -> Result<(), CatalogError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::FlushThumbnails { reply }).await?;
        done.await.map_err(|_| CatalogError::ServiceStopped)
    }

    /// Start the game behind `id` through the injected launcher
    pub fn launch(&self, id: &StableId) -> Result<(), CatalogError> {
        let snapshot = self.get_snapshot();
        let entry = snapshot
            .get(id)
            .ok_or_else(|| CatalogError::UnknownEntry(id.clone()))?;
        if !entry.is_active() {
            return Err(CatalogError::EntryMissing(id.clone()));
        }

        info!(%id, title = %entry.display_title, "launching");
        self.launcher
            .launch(&entry.source_path)
            .map_err(|source| CatalogError::LaunchFailed {
                path: entry.source_path.clone(),
                source,
            })
    }

    /// Stop the reconciler and close the thumbnail store
    pub async fn shutdown(self) -> Result<(), CatalogError> {
        let GameLibrary {
            commands,
            thumbnails,
            worker,
            ..
        } = self;

        let _ = commands.send(Command::Shutdown).await;
        worker.await?;

        match Arc::try_unwrap(thumbnails) {
            Ok(cache) => task::spawn_blocking(move || cache.close()).await??,
            Err(_) => debug!("thumbnail jobs still running, cache closes when they finish"),
        }
        info!("game library shut down");
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<(), CatalogError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CatalogError::ServiceStopped)
    }
}

impl std::fmt::Debug for GameLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameLibrary")
            .field("root", &self.config.root_directory)
            .field("state", &self.state())
            .field("revision", &self.get_snapshot().revision())
            .finish()
    }
}

