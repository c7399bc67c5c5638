//! Metadata store backed by a directory of JSON files.
//!
//! Each document is one file under the root whose content is the document's
//! metadata object. Edits made by other programs are picked up by polling the
//! documents this process has seen.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metabind_core::store::CHANGE_CHANNEL_CAPACITY;
use metabind_core::{ExternalChange, MetadataStore, StoreError};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

pub struct DirectoryStore {
    root: PathBuf,
    /// Last content read from or written to each document.
    snapshots: DashMap<String, Value>,
    /// Serializes writes with polling so a poll never compares a snapshot
    /// against a half-finished write.
    io: Mutex<()>,
    changes_tx: broadcast::Sender<ExternalChange>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            root: root.into(),
            snapshots: DashMap::new(),
            io: Mutex::new(()),
            changes_tx,
        })
    }

    /// Map a document name to a file under the root.
    fn file_path(&self, document: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(document);
        let contained = !document.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(StoreError::InvalidPath(document.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn load(&self, document: &str) -> Result<Value, StoreError> {
        let path = self.file_path(document)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(document.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let data: Value = serde_json::from_str(&content)?;
        if !data.is_object() {
            return Err(StoreError::NotAnObject(document.to_string()));
        }
        Ok(data)
    }

    /// Re-read every known document and publish those that changed on disk.
    ///
    /// Returns the number of changes published.
    pub async fn poll(&self) -> usize {
        let known: Vec<(String, Value)> = self
            .snapshots
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let mut published = 0;
        for (document, previous) in known {
            let _io = self.io.lock().await;
            let previous = match self.snapshots.get(&document) {
                Some(current) => current.clone(),
                None => previous,
            };
            let data = match self.load(&document).await {
                Ok(data) => data,
                Err(StoreError::NotFound(_)) => {
                    trace!(document = %document, "document disappeared, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(document = %document, error = %e, "failed to poll document");
                    continue;
                }
            };
            if data == previous {
                continue;
            }

            self.snapshots.insert(document.clone(), data.clone());
            debug!(document = %document, "document changed on disk");
            if self
                .changes_tx
                .send(ExternalChange { document, data })
                .is_err()
            {
                trace!("no subscribers for external change");
            }
            published += 1;
        }
        published
    }

    /// Poll every `period` until shutdown is signalled or the store is dropped.
    pub fn spawn_poller(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
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
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.poll().await;
                    }
                }
            }

            debug!("directory poller stopped");
        })
    }
}

#[async_trait]
impl MetadataStore for DirectoryStore {
    async fn read_document(&self, document: &str) -> Result<Value, StoreError> {
        let data = self.load(document).await?;
        self.snapshots.insert(document.to_string(), data.clone());
        Ok(data)
    }

    async fn write_document(&self, document: &str, data: &Value) -> Result<(), StoreError> {
        if !data.is_object() {
            return Err(StoreError::NotAnObject(document.to_string()));
        }
        let path = self.file_path(document)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(data)?;

        let _io = self.io.lock().await;
        let staging = path.with_extension("metabind-tmp");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &path).await?;
        self.snapshots.insert(document.to_string(), data.clone());
        trace!(document, path = %path.display(), "document written");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.changes_tx.subscribe()
    }
}
