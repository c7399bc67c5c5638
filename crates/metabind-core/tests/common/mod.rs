//! Shared helpers for the manager integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metabind_core::{
    BindTarget, ExternalChange, InMemoryStore, ManagerConfig, MetadataManager, MetadataStore,
    PropertyPath, StoreError,
};
use serde_json::Value;
use tokio::sync::{Notify, broadcast};

/// A configuration whose scheduler never fires during a test; tests call
/// `tick()` themselves.
pub fn manual_config() -> ManagerConfig {
    ManagerConfig::default().with_tick_interval(Duration::from_secs(3600))
}

pub fn manager(store: Arc<dyn MetadataStore>) -> MetadataManager {
    MetadataManager::new(store, manual_config()).unwrap()
}

pub fn target(document: &str, prop: &str) -> BindTarget {
    BindTarget::new(document, PropertyPath::parse(prop).unwrap())
}

/// Wraps an [`InMemoryStore`] and fails reads or writes on demand.
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    fail_reads: AtomicBool,
    failing_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_reads: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn read_document(&self, document: &str) -> Result<Value, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("read of {document}")));
        }
        self.inner.read_document(document).await
    }

    async fn write_document(&self, document: &str, data: &Value) -> Result<(), StoreError> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable(format!("write of {document}")));
        }
        self.inner.write_document(document, data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.inner.subscribe()
    }
}

/// Wraps an [`InMemoryStore`]; every write waits for `release` after
/// signalling `entered`.
pub struct GatedStore {
    pub inner: Arc<InMemoryStore>,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl MetadataStore for GatedStore {
    async fn read_document(&self, document: &str) -> Result<Value, StoreError> {
        self.inner.read_document(document).await
    }

    async fn write_document(&self, document: &str, data: &Value) -> Result<(), StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.write_document(document, data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.inner.subscribe()
    }
}

/// Poll `condition` until it holds or a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
