//! Reactive metadata synchronization engine.
//!
//! Fields bind [`Signal`]s to properties of a document's structured metadata.
//! The [`MetadataManager`] keeps one cache per document, fans local edits out
//! to every other field bound to the same property, writes dirty documents
//! back to a [`MetadataStore`] on a fixed tick, and folds in edits made by
//! other programs unless a local edit is more recent.
//!
//! ## Modules
//!
//! - **path**: property paths into a JSON metadata tree
//! - **signal**: single-value reactive cells
//! - **target**: bind targets and their textual declarations
//! - **cache**: per-document cached metadata and listeners
//! - **manager**: cache registry, write-back scheduler, external changes
//! - **store**: the host storage trait and an in-memory implementation
//! - **field**: field kinds and fields mounted onto a manager

mod cache;
pub mod config;
mod error;
pub mod field;
pub mod manager;
pub mod path;
pub mod signal;
pub mod store;
pub mod target;

pub use cache::SubscriberId;
pub use config::ManagerConfig;
pub use error::MetabindError;
pub use field::{BoundField, FieldKind};
pub use manager::{
    CacheHandle, ExternalChangeOutcome, MetadataManager, Subscription, TickReport,
};
pub use path::{PathError, PathStep, PropertyPath};
pub use signal::{ListenerId, MetadataSignal, Signal, WeakSignal};
pub use store::{ExternalChange, InMemoryStore, MetadataStore, StoreError};
pub use target::{BindTarget, BindTargetDeclaration, DocumentKey, StorageType};
