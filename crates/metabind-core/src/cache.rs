//! Per-document metadata cache.
//!
//! One [`DocumentCache`] holds the last known metadata of a document together
//! with the listeners bound to it. The cache never invokes listeners itself:
//! mutating operations return [`Notification`]s, which the manager delivers
//! after releasing its map guard so that listener code may call back into the
//! manager.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::path::{PathError, PropertyPath};
use crate::signal::WeakSignal;
use crate::target::DocumentKey;

/// Unique identity of one subscriber (usually one mounted field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) type ListenerCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// One listener bound to a document.
#[derive(Clone)]
pub struct Listener {
    callback: ListenerCallback,
    pub path: PropertyPath,
    pub subscriber: SubscriberId,
    pub listen_to_children: bool,
}

impl Listener {
    /// A listener that forwards values into a signal it does not own.
    pub(crate) fn for_signal(
        signal: WeakSignal<Option<Value>>,
        path: PropertyPath,
        subscriber: SubscriberId,
        listen_to_children: bool,
    ) -> Self {
        Self {
            callback: Arc::new(move |value| {
                signal.set(value);
            }),
            path,
            subscriber,
            listen_to_children,
        }
    }

    fn is_affected_by(&self, changed: &PropertyPath) -> bool {
        self.path == *changed || (self.listen_to_children && self.path.is_ancestor_of(changed))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("path", &self.path)
            .field("subscriber", &self.subscriber)
            .field("listen_to_children", &self.listen_to_children)
            .finish_non_exhaustive()
    }
}

/// A listener invocation collected while the cache was borrowed.
pub struct Notification {
    callback: ListenerCallback,
    subscriber: SubscriberId,
    value: Option<Value>,
}

impl Notification {
    fn new(listener: &Listener, value: Option<Value>) -> Self {
        Self {
            callback: Arc::clone(&listener.callback),
            subscriber: listener.subscriber,
            value,
        }
    }

    pub(crate) fn deliver(self) {
        trace!(subscriber = %self.subscriber, "notifying listener");
        (self.callback)(self.value);
    }
}

/// Deliver notifications in the order they were collected.
pub(crate) fn deliver_all(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

/// Result of a path write against the cache.
pub enum WriteOutcome {
    /// The slot already held the value. Nothing changed.
    Unchanged,
    /// The value was stored; these listeners must be told.
    Applied(Vec<Notification>),
}

/// Cached metadata and listeners of one document.
#[derive(Debug)]
pub struct DocumentCache {
    /// Distinguishes successive entries for the same document.
    id: u64,
    document: DocumentKey,
    metadata: Value,
    listeners: Vec<Listener>,
    cycles_since_last_user_input: u32,
    changed: bool,
    /// Bumped on every local write; a write-back only clears `changed` if no
    /// newer write happened while it was in flight.
    revision: u64,
}

impl DocumentCache {
    pub(crate) fn new(id: u64, document: DocumentKey, metadata: Value) -> Self {
        Self {
            id,
            document,
            metadata,
            listeners: Vec::new(),
            cycles_since_last_user_input: 0,
            changed: false,
            revision: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn document(&self) -> &DocumentKey {
        &self.document
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn cycles_since_last_user_input(&self) -> u32 {
        self.cycles_since_last_user_input
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_unobserved(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Value at `path`, cloned out of the cache.
    pub fn read(&self, path: &PropertyPath) -> Option<Value> {
        path.traverse(&self.metadata).cloned()
    }

    /// Add `listener` and return the notification that seeds it with the
    /// current value at its path.
    pub(crate) fn add_listener(&mut self, listener: Listener) -> Notification {
        trace!(
            document = %self.document,
            subscriber = %listener.subscriber,
            path = %listener.path,
            "listener added"
        );
        let seed = Notification::new(&listener, self.read(&listener.path));
        self.listeners.push(listener);
        seed
    }

    /// Remove the listener registered by `subscriber`.
    pub(crate) fn remove_listener(&mut self, subscriber: SubscriberId) -> bool {
        match self
            .listeners
            .iter()
            .position(|l| l.subscriber == subscriber)
        {
            Some(index) => {
                self.listeners.remove(index);
                trace!(document = %self.document, subscriber = %subscriber, "listener removed");
                true
            }
            None => false,
        }
    }

    /// Replace the metadata wholesale and notify every listener except
    /// `except` with the value at its own path.
    pub(crate) fn update_whole(
        &mut self,
        metadata: Value,
        except: Option<SubscriberId>,
    ) -> Vec<Notification> {
        self.metadata = metadata;
        self.cycles_since_last_user_input = 0;
        self.notify(None, except)
    }

    /// Store `value` at `path`.
    ///
    /// The parent container must exist. Writing the value already present is
    /// a no-op: no dirty flag, no notifications.
    pub(crate) fn update_at_path(
        &mut self,
        value: Value,
        path: &PropertyPath,
        except: Option<SubscriberId>,
    ) -> Result<WriteOutcome, PathError> {
        let slot = path.traverse_to_parent(&mut self.metadata)?;
        if slot.current() == Some(&value) {
            return Ok(WriteOutcome::Unchanged);
        }
        slot.assign(value)?;

        self.cycles_since_last_user_input = 0;
        self.changed = true;
        self.revision += 1;

        Ok(WriteOutcome::Applied(self.notify(Some(path), except)))
    }

    /// Collect notifications for listeners affected by `changed`, or for all
    /// listeners when no path is given.
    pub(crate) fn notify(
        &self,
        changed: Option<&PropertyPath>,
        except: Option<SubscriberId>,
    ) -> Vec<Notification> {
        self.listeners
            .iter()
            .filter(|l| Some(l.subscriber) != except)
            .filter(|l| changed.is_none_or(|path| l.is_affected_by(path)))
            .map(|l| Notification::new(l, self.read(&l.path)))
            .collect()
    }

    /// One scheduler cycle elapsed.
    pub(crate) fn record_tick(&mut self) {
        self.cycles_since_last_user_input = self.cycles_since_last_user_input.saturating_add(1);
    }

    /// A write-back of `revision` completed.
    ///
    /// Returns false if a newer local write is still pending.
    pub(crate) fn mark_written(&mut self, revision: u64) -> bool {
        if self.revision == revision {
            self.changed = false;
            true
        } else {
            false
        }
    }
}
