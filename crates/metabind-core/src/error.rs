//! Error types for the synchronization engine.

use thiserror::Error;

use crate::path::{PathError, PropertyPath};
use crate::store::StoreError;
use crate::target::DocumentKey;

/// Errors surfaced by the metadata manager and bind target resolution.
#[derive(Debug, Error)]
pub enum MetabindError {
    /// Malformed bind target, property path or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// A write addressed a path whose parent container does not exist.
    #[error("cannot write to {document}: parent `{path}` does not exist")]
    MissingParent {
        document: DocumentKey,
        path: PropertyPath,
    },

    /// Reading a document from the store failed.
    #[error("failed to read {document}: {source}")]
    StoreRead {
        document: DocumentKey,
        #[source]
        source: StoreError,
    },

    /// Writing a document back to the store failed.
    #[error("failed to write {document}: {source}")]
    StoreWrite {
        document: DocumentKey,
        #[source]
        source: StoreError,
    },

    /// The manager was constructed outside of a Tokio runtime.
    #[error("metadata manager requires a running Tokio runtime")]
    NoRuntime,
}

impl MetabindError {
    /// Attach a document to a path error.
    pub(crate) fn from_path(document: &DocumentKey, error: PathError) -> Self {
        match error {
            PathError::MissingParent { parent } => MetabindError::MissingParent {
                document: document.clone(),
                path: parent,
            },
            other => MetabindError::Validation(format!("{document}: {other}")),
        }
    }
}

impl From<PathError> for MetabindError {
    fn from(error: PathError) -> Self {
        MetabindError::Validation(error.to_string())
    }
}
