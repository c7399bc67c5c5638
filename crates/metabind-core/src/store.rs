//! External document store adapter.
//!
//! The manager only needs three things from the host: read a document's
//! metadata, write it back, and hear about edits made elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast capacity for external change notifications.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Errors reported by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored data is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The document name cannot be mapped to a location in the store.
    #[error("invalid document path: {0}")]
    InvalidPath(String),

    /// The document's metadata is not an object.
    #[error("metadata of {0} is not an object")]
    NotAnObject(String),

    /// The store cannot be reached right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A document edited outside of the field system.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalChange {
    pub document: String,
    pub data: Value,
}

/// Host storage for document metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the full metadata tree of a document.
    async fn read_document(&self, document: &str) -> Result<Value, StoreError>;

    /// Replace the metadata tree of a document.
    async fn write_document(&self, document: &str, data: &Value) -> Result<(), StoreError>;

    /// Subscribe to edits made outside of this process' writes.
    fn subscribe(&self) -> broadcast::Receiver<ExternalChange>;
}

/// A store held entirely in memory.
///
/// Documents that were never written read as an empty object. Writes made
/// through [`MetadataStore::write_document`] are not echoed as external
/// changes; use [`InMemoryStore::external_edit`] to simulate an edit made by
/// another program.
pub struct InMemoryStore {
    documents: DashMap<String, Value>,
    changes_tx: broadcast::Sender<ExternalChange>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            documents: DashMap::new(),
            changes_tx,
            writes: AtomicUsize::new(0),
        })
    }

    /// Create a store pre-populated with documents.
    pub fn with_documents(documents: impl IntoIterator<Item = (String, Value)>) -> Arc<Self> {
        let store = Self::new();
        for (path, data) in documents {
            store.documents.insert(path, data);
        }
        store
    }

    /// Current stored metadata of a document.
    pub fn get(&self, document: &str) -> Option<Value> {
        self.documents.get(document).map(|r| r.value().clone())
    }

    /// Replace a document as another program would, and announce it.
    pub fn external_edit(&self, document: &str, data: Value) {
        self.documents.insert(document.to_string(), data.clone());
        if self
            .changes_tx
            .send(ExternalChange {
                document: document.to_string(),
                data,
            })
            .is_err()
        {
            trace!(document, "no subscribers for external change");
        }
    }

    /// Number of successful `write_document` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn read_document(&self, document: &str) -> Result<Value, StoreError> {
        Ok(self
            .get(document)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    async fn write_document(&self, document: &str, data: &Value) -> Result<(), StoreError> {
        if !data.is_object() {
            return Err(StoreError::NotAnObject(document.to_string()));
        }
        self.documents.insert(document.to_string(), data.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(document, "in-memory store: document written");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_document_reads_as_empty_object() {
        let store = InMemoryStore::new();
        assert_eq!(store.read_document("nope.md").await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = InMemoryStore::new();
        store
            .write_document("a.md", &json!({"status": "done"}))
            .await
            .unwrap();
        assert_eq!(
            store.read_document("a.md").await.unwrap(),
            json!({"status": "done"})
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_write_rejects_non_object() {
        let store = InMemoryStore::new();
        let err = store.write_document("a.md", &json!([1])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotAnObject(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_are_not_echoed() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe();
        store.write_document("a.md", &json!({})).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_external_edit_is_broadcast() {
        let store = InMemoryStore::with_documents([("a.md".to_string(), json!({"x": 1}))]);
        let mut rx = store.subscribe();

        store.external_edit("a.md", json!({"x": 2}));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.document, "a.md");
        assert_eq!(change.data, json!({"x": 2}));
        assert_eq!(store.get("a.md"), Some(json!({"x": 2})));
    }
}
