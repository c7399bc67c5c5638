//! Single-value reactive cells.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

/// Handle returned by [`Signal::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalState<T> {
    value: T,
    listeners: Vec<(ListenerId, Callback<T>)>,
    next_id: u64,
}

/// A reactive cell holding one value and an ordered set of listeners.
///
/// `set` notifies synchronously, in registration order, with no batching and
/// no equality check. A signal belongs to a single field; the metadata cache
/// only ever holds a [`WeakSignal`] to it.
pub struct Signal<T> {
    state: Arc<Mutex<SignalState<T>>>,
}

/// The signal type fields use to observe a metadata property.
///
/// `None` means the property is absent from the document.
pub type MetadataSignal = Signal<Option<Value>>;

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState {
                value: initial,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Store `value` and invoke every listener with it.
    ///
    /// Listeners run after the internal lock is released, so a listener may
    /// read or set the signal again.
    pub fn set(&self, value: T) {
        set_and_notify(&self.state, value);
    }

    pub fn register_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener. Returns false if it was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        match state.listeners.iter().position(|(existing, _)| *existing == id) {
            Some(index) => {
                state.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn unregister_all_listeners(&self) {
        self.state.lock().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// A non-owning reference that stops delivering once the signal is dropped.
    pub fn downgrade(&self) -> WeakSignal<T> {
        WeakSignal {
            state: Arc::downgrade(&self.state),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Signal")
            .field("value", &state.value)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Weak counterpart of [`Signal`].
pub struct WeakSignal<T> {
    state: Weak<Mutex<SignalState<T>>>,
}

impl<T: Clone + Send + 'static> WeakSignal<T> {
    /// Set the value if the signal is still alive. Returns false otherwise.
    pub fn set(&self, value: T) -> bool {
        match self.state.upgrade() {
            Some(state) => {
                set_and_notify(&state, value);
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.strong_count() > 0
    }
}

impl<T> Clone for WeakSignal<T> {
    fn clone(&self) -> Self {
        Self {
            state: Weak::clone(&self.state),
        }
    }
}

fn set_and_notify<T: Clone>(state: &Mutex<SignalState<T>>, value: T) {
    let listeners: Vec<Callback<T>> = {
        let mut guard = state.lock();
        guard.value = value.clone();
        guard
            .listeners
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    };
    for listener in listeners {
        listener(&value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_initial_value() {
        let signal = Signal::new(3);
        assert_eq!(signal.get(), 3);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_set_notifies_in_registration_order() {
        let signal = Signal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            signal.register_listener(move |v: &i32| seen.lock().push((tag, *v)));
        }

        signal.set(7);
        assert_eq!(signal.get(), 7);
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_set_does_not_deduplicate() {
        let signal = Signal::new("a".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        signal.register_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.set("a".to_string());
        signal.set("a".to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_listener_removes_exactly_one() {
        let signal = Signal::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let ids: Vec<_> = (0..3)
            .map(|_| {
                let calls = Arc::clone(&calls);
                signal.register_listener(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert!(signal.unregister_listener(ids[1]));
        assert!(!signal.unregister_listener(ids[1]));
        signal.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        signal.unregister_all_listeners();
        signal.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_reenter_signal() {
        let signal = Arc::new(Signal::new(0));
        let weak = signal.downgrade();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in = Arc::clone(&observed);
        let reader = Arc::clone(&signal);
        signal.register_listener(move |v: &i32| {
            observed_in.store(reader.get() as usize, Ordering::SeqCst);
            if *v < 3 {
                weak.set(v + 1);
            }
        });

        signal.set(1);
        assert_eq!(signal.get(), 3);
        assert_eq!(observed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_weak_signal_stops_after_drop() {
        let signal = Signal::new(1);
        let weak = signal.downgrade();
        assert!(weak.is_alive());
        assert!(weak.set(2));
        assert_eq!(signal.get(), 2);

        drop(signal);
        assert!(!weak.is_alive());
        assert!(!weak.set(3));
    }
}
