use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task;
use tokio::time::{self, Interval};
use tracing::{debug, error, info, instrument, warn};

use super::indexer::PathIndexer;
use crate::error::CatalogError;
use crate::search::SearchIndex;
use crate::state::data::{
    Catalog, CatalogEntry, ChangeOrigin, ChangeSet, Fingerprint, PassWarning, StableId,
    ThumbnailRef,
};
use crate::state::store::{write_catalog, MetadataStore};
use crate::thumbs::cache::ThumbnailCache;

/// Scanned files buffered between the walker thread and the reconciler
const SCAN_BUFFER: usize = 256;

/// Where the reconciler is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    /// Walking the tree and diffing each item as it arrives
    Scanning,
    /// Walk done; soft-deleting entries that were not seen
    Diffing,
    PersistingCatalog,
    EmittingChangeSet,
}

/// How a reconciliation pass ended
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(ChangeSet),
    /// Cancelled or superseded; nothing from the pass was merged
    Abandoned,
}

pub type PassResult = Result<PassOutcome, Arc<CatalogError>>;

/// Notifications for the presentation layer
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    Changed(ChangeSet),
    ScanFailed(Arc<CatalogError>),
    PassAbandoned,
}

#[derive(Debug)]
pub(crate) enum Command {
    Refresh {
        reply: Option<oneshot::Sender<PassResult>>,
    },
    /// Abandon the pass in flight, if any
    Cancel,
    FlushThumbnails {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// A finished thumbnail job on its way back to the single writer
#[derive(Debug)]
struct ThumbnailDone {
    id: StableId,
    fingerprint: Fingerprint,
    thumbnail: ThumbnailRef,
}

/// Channels the reconciler publishes through
pub(crate) struct Publisher {
    pub snapshots: watch::Sender<Arc<Catalog>>,
    pub search: Arc<RwLock<Arc<SearchIndex>>>,
    pub events: broadcast::Sender<CatalogEvent>,
    pub state: watch::Sender<ReconcilerState>,
}

impl Publisher {
    pub fn new(initial: Arc<Catalog>) -> Self {
        let (snapshots, _) = watch::channel(Arc::clone(&initial));
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(ReconcilerState::Idle);
        Publisher {
            snapshots,
            search: Arc::new(RwLock::new(Arc::new(SearchIndex::rebuild(&initial)))),
            events,
            state,
        }
    }

    fn catalog(&self, catalog: Arc<Catalog>) {
        let index = Arc::new(SearchIndex::rebuild(&catalog));
        *self.search.write().unwrap_or_else(PoisonError::into_inner) = index;
        self.snapshots.send_replace(catalog);
    }

    fn event(&self, event: CatalogEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Drives scan -> diff -> persist -> emit, and is the only writer of the
/// catalog. Runs as one task; everything slow is pushed to blocking workers.
pub struct Reconciler {
    indexer: PathIndexer,
    store: MetadataStore,
    thumbnails: Arc<ThumbnailCache>,
    workers: Arc<Semaphore>,
    publisher: Publisher,
    commands: mpsc::Receiver<Command>,
    thumb_tx: mpsc::UnboundedSender<ThumbnailDone>,
    thumb_rx: mpsc::UnboundedReceiver<ThumbnailDone>,
    refresh_interval: Option<Duration>,
    /// Thumbnail jobs dispatched and not yet applied
    in_flight: HashSet<(StableId, Fingerprint)>,
    /// Set by callers whose refresh could not be queued
    refresh_requested: Arc<AtomicBool>,
    pending: bool,
    pending_waiters: Vec<oneshot::Sender<PassResult>>,
    deferred_flushes: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Reconciler {
    pub(crate) fn new(
        indexer: PathIndexer,
        store: MetadataStore,
        thumbnails: Arc<ThumbnailCache>,
        pool_size: usize,
        publisher: Publisher,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (thumb_tx, thumb_rx) = mpsc::unbounded_channel();
        Reconciler {
            indexer,
            store,
            thumbnails,
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
            publisher,
            commands,
            thumb_tx,
            thumb_rx,
            refresh_interval: None,
            in_flight: HashSet::new(),
            refresh_requested: Arc::new(AtomicBool::new(false)),
            pending: false,
            pending_waiters: Vec::new(),
            deferred_flushes: Vec::new(),
            shutting_down: false,
        }
    }

    pub(crate) fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Flag a caller can raise to request a pass without the command queue
    pub(crate) fn refresh_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.refresh_requested)
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.store.snapshot()
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.pending
    }

    fn set_state(&self, state: ReconcilerState) {
        self.publisher.state.send_replace(state);
    }

    /// Main loop: wait for commands, scheduled ticks and thumbnail results
    pub async fn run(mut self) {
        info!(root = %self.indexer.root().display(), "reconciler started");
        let mut ticker = self
            .refresh_interval
            .map(|period| time::interval_at(time::Instant::now() + period, period));

        while !self.shutting_down {
            if self.refresh_requested.swap(false, Ordering::AcqRel) {
                self.pending = true;
            }
            if self.pending {
                self.pending = false;
                let waiters = std::mem::take(&mut self.pending_waiters);
                let result = self.run_pass().await.map_err(Arc::new);
                self.report(&result);
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                self.answer_deferred_flushes().await;
                continue;
            }

            tokio::select! {
                cmd = self.commands.recv() => self.handle_idle_command(cmd).await,
                Some(done) = self.thumb_rx.recv() => {
                    let mut batch = vec![done];
                    while let Ok(more) = self.thumb_rx.try_recv() {
                        batch.push(more);
                    }
                    self.apply_thumbnails(batch).await;
                }
                _ = next_tick(&mut ticker) => {
                    debug!("scheduled refresh");
                    self.pending = true;
                }
            }
        }

        for waiter in self.pending_waiters.drain(..) {
            let _ = waiter.send(Ok(PassOutcome::Abandoned));
        }
        self.set_state(ReconcilerState::Idle);
        info!(discarded_thumbnails = self.in_flight.len(), "reconciler stopped");
    }

    fn report(&self, result: &PassResult) {
        match result {
            Ok(PassOutcome::Completed(_)) => {}
            Ok(PassOutcome::Abandoned) => self.publisher.event(CatalogEvent::PassAbandoned),
            Err(err) => {
                error!(error = %err, "reconciliation pass failed");
                self.publisher.event(CatalogEvent::ScanFailed(Arc::clone(err)));
            }
        }
    }

    async fn handle_idle_command(&mut self, cmd: Option<Command>) {
        match cmd {
            Some(Command::Refresh { reply }) => {
                self.pending = true;
                self.pending_waiters.extend(reply);
            }
            Some(Command::Cancel) => debug!("no pass in flight to cancel"),
            Some(Command::FlushThumbnails { reply }) => {
                self.settle_thumbnails().await;
                let _ = reply.send(());
            }
            Some(Command::Shutdown) | None => self.shutting_down = true,
        }
    }

    /// Returns true when the pass in flight must be abandoned
    fn handle_pass_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Refresh { reply }) => {
                // coalesced into a single re-run after this pass
                self.pending = true;
                self.pending_waiters.extend(reply);
                false
            }
            Some(Command::FlushThumbnails { reply }) => {
                self.deferred_flushes.push(reply);
                false
            }
            Some(Command::Cancel) => true,
            Some(Command::Shutdown) | None => {
                self.shutting_down = true;
                true
            }
        }
    }

    async fn answer_deferred_flushes(&mut self) {
        if self.deferred_flushes.is_empty() {
            return;
        }
        self.settle_thumbnails().await;
        for reply in self.deferred_flushes.drain(..) {
            let _ = reply.send(());
        }
    }

    /// One full reconciliation pass. The state always returns to Idle.
    #[instrument(skip(self), fields(root = %self.indexer.root().display()))]
    pub async fn run_pass(&mut self) -> Result<PassOutcome, CatalogError> {
        let result = self.run_pass_inner().await;
        self.set_state(ReconcilerState::Idle);
        result
    }

    async fn run_pass_inner(&mut self) -> Result<PassOutcome, CatalogError> {
        let started = Instant::now();
        self.set_state(ReconcilerState::Scanning);

        let (tx, mut rx) = mpsc::channel(SCAN_BUFFER);
        let stop = Arc::new(AtomicBool::new(false));
        let walker = self.indexer.clone();
        let stop_flag = Arc::clone(&stop);
        let scan = task::spawn_blocking(move || -> Result<usize, CatalogError> {
            let mut files = walker.walk()?;
            for file in files.by_ref() {
                if stop_flag.load(Ordering::Relaxed) || tx.blocking_send(file).is_err() {
                    break;
                }
            }
            Ok(files.skipped())
        });

        let mut session = self.store.begin_merge();
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    if self.handle_pass_command(cmd) {
                        stop.store(true, Ordering::Relaxed);
                        info!(seen = session.seen_count(), "pass abandoned, discarding partial scan");
                        return Ok(PassOutcome::Abandoned);
                    }
                }
                item = rx.recv() => match item {
                    Some(file) => {
                        // every sighting is revalidated: the cache answers hits without
                        // touching the source and notices new cover art
                        let observed = session.observe(&file);
                        self.dispatch_thumbnail(observed.entry);
                    }
                    None => break,
                },
            }
        }

        // walk errors (root unavailable) surface here, before anything is marked missing
        let skipped = scan.await??;

        self.set_state(ReconcilerState::Diffing);
        let (catalog, mut changes) = session.finish();

        self.set_state(ReconcilerState::PersistingCatalog);
        self.store.commit(catalog);
        self.publisher.catalog(self.store.snapshot());
        if let Some(warning) = self.persist().await {
            changes.warnings.push(warning);
        }
        if let Some(warning) = self.evict().await {
            changes.warnings.push(warning);
        }

        self.set_state(ReconcilerState::EmittingChangeSet);
        info!(
            added = changes.added.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            skipped,
            revision = changes.revision,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciliation pass complete"
        );
        self.publisher.event(CatalogEvent::Changed(changes.clone()));
        Ok(PassOutcome::Completed(changes))
    }

    /// Queue preview work for `entry` on the bounded worker pool, unless a
    /// job for the same id and fingerprint is still out
    fn dispatch_thumbnail(&mut self, entry: CatalogEntry) {
        if !self
            .in_flight
            .insert((entry.stable_id.clone(), entry.fingerprint))
        {
            debug!(id = %entry.stable_id, "thumbnail already in flight");
            return;
        }
        let cache = Arc::clone(&self.thumbnails);
        let workers = Arc::clone(&self.workers);
        let done_tx = self.thumb_tx.clone();

        tokio::spawn(async move {
            let id = entry.stable_id.clone();
            let fingerprint = entry.fingerprint;
            let thumbnail = match workers.acquire_owned().await {
                Ok(permit) => {
                    let derived = task::spawn_blocking(move || {
                        let _permit = permit;
                        cache.get_or_create(&entry)
                    })
                    .await;
                    derived.unwrap_or_else(|err| ThumbnailRef::Placeholder {
                        reason: format!("thumbnail worker failed: {err}"),
                    })
                }
                Err(_) => ThumbnailRef::Placeholder {
                    reason: "thumbnail pool closed".to_string(),
                },
            };
            let _ = done_tx.send(ThumbnailDone {
                id,
                fingerprint,
                thumbnail,
            });
        });
    }

    /// Wait for every dispatched thumbnail and apply the results
    pub async fn settle_thumbnails(&mut self) -> Option<ChangeSet> {
        let mut batch = Vec::with_capacity(self.in_flight.len());
        while batch.len() < self.in_flight.len() {
            match self.thumb_rx.recv().await {
                Some(done) => batch.push(done),
                None => break,
            }
        }
        self.apply_thumbnails(batch).await
    }

    /// Merge finished thumbnails into the catalog as a follow-up update
    async fn apply_thumbnails(&mut self, batch: Vec<ThumbnailDone>) -> Option<ChangeSet> {
        for done in &batch {
            self.in_flight.remove(&(done.id.clone(), done.fingerprint));
        }
        if batch.is_empty() {
            return None;
        }

        let updated = self.store.apply_thumbnails(
            batch
                .into_iter()
                .map(|done| (done.id, done.fingerprint, done.thumbnail)),
        );
        if updated.is_empty() {
            return None;
        }

        let mut changes = ChangeSet::new(ChangeOrigin::Thumbnails);
        changes.revision = self.store.snapshot().revision();
        changes.updated = updated;
        self.publisher.catalog(self.store.snapshot());
        if let Some(warning) = self.persist().await {
            changes.warnings.push(warning);
        }

        debug!(updated = changes.updated.len(), revision = changes.revision, "thumbnails applied");
        self.publisher.event(CatalogEvent::Changed(changes.clone()));
        Some(changes)
    }

    /// Write the current catalog. Failure leaves memory as is and becomes a warning.
    async fn persist(&self) -> Option<PassWarning> {
        let path = self.store.path().to_path_buf();
        let snapshot = self.store.snapshot();
        let result = task::spawn_blocking(move || write_catalog(&path, &snapshot)).await;
        let err = match result {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => err,
            Err(join) => CatalogError::from(join),
        };
        warn!(error = %err, "catalog not persisted, keeping in-memory state");
        Some(PassWarning::PersistFailed {
            reason: err.to_string(),
        })
    }

    async fn evict(&self) -> Option<PassWarning> {
        let active: HashSet<(StableId, String)> = self
            .store
            .snapshot()
            .active_entries()
            .map(|e| (e.stable_id.clone(), e.fingerprint.cache_key()))
            .collect();
        let cache = Arc::clone(&self.thumbnails);
        let result = task::spawn_blocking(move || cache.evict(&active)).await;
        let err = match result {
            Ok(Ok(_)) => return None,
            Ok(Err(err)) => err,
            Err(join) => CatalogError::from(join),
        };
        warn!(error = %err, "thumbnail eviction failed");
        Some(PassWarning::EvictionFailed {
            reason: err.to_string(),
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
