//! Metadata manager: the registry of document caches and the write-back
//! scheduler.
//!
//! Fields register signals against bind targets. Local writes update the
//! cache, notify the other listeners immediately and mark the document dirty;
//! a periodic tick pushes dirty documents to the store. External changes
//! refresh the cache unless a local write happened within the last
//! `update_cycle_threshold` ticks, in which case the external data is assumed
//! to predate that write and is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::cache::{
    DocumentCache, Listener, Notification, SubscriberId, WriteOutcome, deliver_all,
};
use crate::config::ManagerConfig;
use crate::error::MetabindError;
use crate::signal::MetadataSignal;
use crate::store::{ExternalChange, MetadataStore, StoreError};
use crate::target::{BindTarget, DocumentKey, StorageType};

/// Identifies one registration, for later unregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    document: DocumentKey,
    subscriber: SubscriberId,
}

impl CacheHandle {
    pub fn document(&self) -> &DocumentKey {
        &self.document
    }
}

/// What happened to an external change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalChangeOutcome {
    /// Nobody has the document cached.
    Ignored,
    /// A local write is too recent; the event was dropped.
    Suppressed,
    /// The cache was replaced and every listener notified.
    Applied,
}

/// Result of one write-back pass.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Documents pushed to the store.
    pub written: Vec<DocumentKey>,
    /// Documents whose write-back failed; they stay dirty.
    pub failed: Vec<(DocumentKey, StoreError)>,
}

/// Owns every document cache and the background tasks that keep them in sync.
///
/// Cloning is cheap and yields another handle to the same manager.
#[derive(Clone)]
pub struct MetadataManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn MetadataStore>,
    config: ManagerConfig,
    caches: DashMap<DocumentKey, DocumentCache>,
    /// Held from a cache mutation until its notifications are delivered, so
    /// listeners observe mutations in the order they hit the cache. Always
    /// taken before a `caches` guard. Reentrant because listeners may call
    /// back into the manager.
    delivery: ReentrantMutex<()>,
    next_cache_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataManager {
    /// Create a manager and start its scheduler and change listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        config: ManagerConfig,
    ) -> Result<Self, MetabindError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MetabindError::NoRuntime)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let changes = store.subscribe();
        let tick_interval = config.tick_interval;

        let inner = Arc::new(ManagerInner {
            store,
            config,
            caches: DashMap::new(),
            delivery: ReentrantMutex::new(()),
            next_cache_id: AtomicU64::new(0),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let scheduler = runtime.spawn(run_scheduler(
            Arc::downgrade(&inner),
            tick_interval,
            shutdown_rx.clone(),
        ));
        let listener = runtime.spawn(run_change_listener(
            Arc::downgrade(&inner),
            changes,
            shutdown_rx,
        ));
        inner.tasks.lock().extend([scheduler, listener]);

        info!(
            threshold = inner.config.update_cycle_threshold,
            tick_ms = tick_interval.as_millis() as u64,
            "metadata manager started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Bind `signal` to `target`.
    ///
    /// Creates the document cache on first use, reading the document from the
    /// store. The signal is seeded with the current value at the target path.
    #[tracing::instrument(skip(self, target, signal), fields(bind = %target))]
    pub async fn register(
        &self,
        target: &BindTarget,
        signal: &MetadataSignal,
        subscriber: SubscriberId,
    ) -> Result<CacheHandle, MetabindError> {
        let document = target.document();
        let listener = Listener::for_signal(
            signal.downgrade(),
            target.storage_prop.clone(),
            subscriber,
            target.listen_to_children,
        );

        self.inner
            .with_cache(&document, |cache| ((), vec![cache.add_listener(listener)]))
            .await?;

        Ok(CacheHandle {
            document,
            subscriber,
        })
    }

    /// Remove a subscriber's listener. Returns false if it was not registered.
    ///
    /// A document left without listeners is dropped from the cache, unless it
    /// still has unsaved local writes; those are flushed by the next tick
    /// first.
    pub fn unregister(&self, document: &DocumentKey, subscriber: SubscriberId) -> bool {
        self.inner.unregister(document, subscriber)
    }

    /// Register and return a [`Subscription`] that undoes the registration
    /// and then runs `on_unsubscribe`.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        signal: &MetadataSignal,
        target: &BindTarget,
        on_unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Result<Subscription, MetabindError> {
        let handle = self.register(target, signal, subscriber).await?;
        Ok(Subscription {
            manager: Arc::downgrade(&self.inner),
            handle,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        })
    }

    /// Value at `target`, or `None` if the property is absent.
    ///
    /// A document that is not cached yet is fetched and cached; without
    /// listeners the entry only lives until the next tick.
    pub async fn read(&self, target: &BindTarget) -> Result<Option<Value>, MetabindError> {
        self.inner
            .with_cache(&target.document(), |cache| {
                (cache.read(&target.storage_prop), Vec::new())
            })
            .await
    }

    /// Store `value` at `target` and notify every listener bound to that path.
    ///
    /// The parent container must already exist; it is never created.
    pub async fn write(&self, value: Value, target: &BindTarget) -> Result<(), MetabindError> {
        self.write_excluding(value, target, None).await
    }

    /// Like [`write`](Self::write), but does not notify `except`.
    ///
    /// Fields use this for their own edits so they are not echoed back.
    #[tracing::instrument(skip(self, value, target), fields(bind = %target))]
    pub async fn write_excluding(
        &self,
        value: Value,
        target: &BindTarget,
        except: Option<SubscriberId>,
    ) -> Result<(), MetabindError> {
        let document = target.document();
        let result = self
            .inner
            .with_cache(&document, |cache| {
                match cache.update_at_path(value, &target.storage_prop, except) {
                    Ok(WriteOutcome::Applied(notifications)) => {
                        (Ok(Some(notifications.len())), notifications)
                    }
                    Ok(WriteOutcome::Unchanged) => (Ok(None), Vec::new()),
                    Err(error) => (Err(error), Vec::new()),
                }
            })
            .await?;

        match result {
            Ok(None) => {
                trace!("value unchanged, write skipped");
                Ok(())
            }
            Ok(Some(notified)) => {
                debug!(notified, "metadata written");
                Ok(())
            }
            Err(error) => {
                self.inner.drop_if_idle(&document);
                Err(MetabindError::from_path(&document, error))
            }
        }
    }

    /// Read-modify-write of one property.
    pub async fn update(
        &self,
        target: &BindTarget,
        f: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<(), MetabindError> {
        let current = self.read(target).await?;
        self.write(f(current), target).await
    }

    /// Set `signal` to the cached value at `target` if it differs.
    ///
    /// Runs in delivery order with every other notification of this manager.
    pub(crate) fn resync(&self, target: &BindTarget, signal: &MetadataSignal) {
        let _order = self.inner.delivery.lock();
        let current = self
            .inner
            .caches
            .get(&target.document())
            .map(|cache| cache.read(&target.storage_prop));
        if let Some(current) = current
            && signal.get() != current
        {
            signal.set(current);
        }
    }

    /// Handle an edit made outside of the field system.
    pub fn on_external_change(&self, document: &str, data: Value) -> ExternalChangeOutcome {
        self.inner.on_external_change(document, data)
    }

    /// Run one scheduler cycle now: write back dirty documents, then advance
    /// every document's staleness counter.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Write back every dirty document without advancing staleness counters.
    ///
    /// Returns the number of documents written, or the first failure.
    pub async fn flush(&self) -> Result<usize, MetabindError> {
        let report = self.inner.write_back().await;
        match report.failed.into_iter().next() {
            Some((document, source)) => Err(MetabindError::StoreWrite { document, source }),
            None => Ok(report.written.len()),
        }
    }

    /// Stop the scheduler and the change listener and wait for them to exit.
    ///
    /// Caches stay readable and writable, but nothing is written back any
    /// more unless [`tick`](Self::tick) or [`flush`](Self::flush) is called.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "manager task ended abnormally");
            }
        }
        info!("metadata manager stopped");
    }

    /// Documents currently held in the cache.
    pub fn cached_documents(&self) -> Vec<DocumentKey> {
        self.inner.caches.iter().map(|r| r.key().clone()).collect()
    }

    pub fn listener_count(&self, document: &DocumentKey) -> usize {
        self.inner
            .caches
            .get(document)
            .map(|cache| cache.listeners().len())
            .unwrap_or(0)
    }

    /// Whether the document has local writes not yet written back.
    pub fn is_dirty(&self, document: &DocumentKey) -> bool {
        self.inner
            .caches
            .get(document)
            .is_some_and(|cache| cache.is_changed())
    }

    pub fn cycles_since_last_user_input(&self, document: &DocumentKey) -> Option<u32> {
        self.inner
            .caches
            .get(document)
            .map(|cache| cache.cycles_since_last_user_input())
    }
}

impl ManagerInner {
    /// Run `f` against the cache of `document`, creating it from the store
    /// if needed, then deliver the notifications `f` returns.
    async fn with_cache<R>(
        &self,
        document: &DocumentKey,
        f: impl FnOnce(&mut DocumentCache) -> (R, Vec<Notification>),
    ) -> Result<R, MetabindError> {
        loop {
            let fetched = if self.caches.contains_key(document) {
                None
            } else {
                Some(self.fetch(document).await?)
            };

            let _order = self.delivery.lock();
            let mut cache = match self.caches.entry(document.clone()) {
                Entry::Occupied(entry) => entry.into_ref(),
                Entry::Vacant(entry) => match fetched {
                    Some(metadata) => {
                        let id = self.next_cache_id.fetch_add(1, Ordering::Relaxed);
                        debug!(document = %document, "document cache created");
                        entry.insert(DocumentCache::new(id, document.clone(), metadata))
                    }
                    // Removed between the check and now; fetch again.
                    None => continue,
                },
            };
            let (result, notifications) = f(&mut cache);
            drop(cache);
            deliver_all(notifications);
            return Ok(result);
        }
    }

    async fn fetch(&self, document: &DocumentKey) -> Result<Value, MetabindError> {
        match document.storage_type {
            StorageType::Memory => Ok(Value::Object(Map::new())),
            StorageType::Frontmatter => self
                .store
                .read_document(&document.path)
                .await
                .map_err(|source| MetabindError::StoreRead {
                    document: document.clone(),
                    source,
                }),
        }
    }

    fn unregister(&self, document: &DocumentKey, subscriber: SubscriberId) -> bool {
        let removed = match self.caches.get_mut(document) {
            Some(mut cache) => cache.remove_listener(subscriber),
            None => false,
        };
        self.drop_if_idle(document);
        removed
    }

    /// Drop the cache of `document` if it has no listeners and nothing to
    /// write back.
    fn drop_if_idle(&self, document: &DocumentKey) {
        if self
            .caches
            .remove_if(document, |_, cache| cache.is_unobserved() && !cache.is_changed())
            .is_some()
        {
            debug!(document = %document, "document cache dropped");
        }
    }

    fn on_external_change(&self, document: &str, data: Value) -> ExternalChangeOutcome {
        let key = DocumentKey::frontmatter(document);
        let _order = self.delivery.lock();
        let notifications = {
            let Some(mut cache) = self.caches.get_mut(&key) else {
                trace!(document, "external change ignored, document not cached");
                return ExternalChangeOutcome::Ignored;
            };

            let cycles = cache.cycles_since_last_user_input();
            if cycles < self.config.update_cycle_threshold {
                debug!(
                    document,
                    cycles,
                    threshold = self.config.update_cycle_threshold,
                    "external change suppressed, recent local input"
                );
                return ExternalChangeOutcome::Suppressed;
            }

            cache.update_whole(data, None)
        };

        debug!(document, notified = notifications.len(), "external change applied");
        deliver_all(notifications);
        ExternalChangeOutcome::Applied
    }

    async fn write_back(&self) -> TickReport {
        let pending: Vec<_> = self
            .caches
            .iter()
            .filter(|cache| cache.is_changed())
            .map(|cache| {
                (
                    cache.document().clone(),
                    cache.id(),
                    cache.revision(),
                    cache.metadata().clone(),
                )
            })
            .collect();

        let mut report = TickReport::default();
        for (document, id, revision, snapshot) in pending {
            let result = match document.storage_type {
                StorageType::Memory => Ok(()),
                StorageType::Frontmatter => {
                    self.store.write_document(&document.path, &snapshot).await
                }
            };

            match result {
                Ok(()) => {
                    // The entry may have been dropped or recreated meanwhile.
                    if let Some(mut cache) = self.caches.get_mut(&document)
                        && cache.id() == id
                        && !cache.mark_written(revision)
                    {
                        trace!(document = %document, "newer local write pending");
                    }
                    debug!(document = %document, "metadata written back");
                    report.written.push(document);
                }
                Err(source) => {
                    warn!(
                        document = %document,
                        error = %source,
                        "write-back failed, retrying next tick"
                    );
                    report.failed.push((document, source));
                }
            }
        }
        report
    }

    async fn tick(&self) -> TickReport {
        let report = self.write_back().await;

        for mut cache in self.caches.iter_mut() {
            cache.record_tick();
        }
        self.caches.retain(|document, cache| {
            let keep = !cache.is_unobserved() || cache.is_changed();
            if !keep {
                debug!(document = %document, "idle document cache dropped");
            }
            keep
        });

        report
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// A registration that unregisters itself when dropped.
pub struct Subscription {
    manager: Weak<ManagerInner>,
    handle: CacheHandle,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_unsubscribe) = self.on_unsubscribe.take() {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister(&self.handle.document, self.handle.subscriber);
            }
            on_unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_scheduler(
    inner: Weak<ManagerInner>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.tick().await;
            }
        }
    }

    debug!("write-back scheduler stopped");
}

async fn run_change_listener(
    inner: Weak<ManagerInner>,
    mut changes: broadcast::Receiver<ExternalChange>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            received = changes.recv() => match received {
                Ok(change) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.on_external_change(&change.document, change.data);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "external change stream lagged, edits were missed");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("external change stream closed");
                    break;
                }
            }
        }
    }

    debug!("external change listener stopped");
}
