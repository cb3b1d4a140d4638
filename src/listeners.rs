//! Listener registry and delivery gate shared by all orientation sources.
//!
//! Notification is a synchronous fan-out over a snapshot of the registry, so a
//! callback may add or remove listeners (including itself) while it runs.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::SourceError;
use crate::source::OrientationSample;
use crate::utils::lock_unpoisoned;

/// Receives orientation updates from whichever source it is registered with.
///
/// Callbacks run on the producer context (hardware thread or replay task) and
/// must not block.
pub trait OrientationListener: Send + Sync {
    fn on_orientation_changed(&self, sample: &OrientationSample);

    fn on_replay_finished(&self) {}

    fn on_source_error(&self, _error: &SourceError) {}
}

fn identity(listener: &Arc<dyn OrientationListener>) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

/// Weak, identity-keyed set of listeners
#[derive(Default)]
pub struct ListenerSet {
    entries: Mutex<Vec<Weak<dyn OrientationListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the listener was already registered.
    pub fn add(&self, listener: &Arc<dyn OrientationListener>) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|w| w.strong_count() > 0);
        let id = identity(listener);
        if entries.iter().any(|w| w.as_ptr() as *const () == id) {
            return false;
        }
        entries.push(Arc::downgrade(listener));
        true
    }

    pub fn remove(&self, listener: &Arc<dyn OrientationListener>) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let id = identity(listener);
        let before = entries.len();
        entries.retain(|w| w.strong_count() > 0 && w.as_ptr() as *const () != id);
        entries.len() != before
    }

    pub fn contains(&self, listener: &Arc<dyn OrientationListener>) -> bool {
        let id = identity(listener);
        lock_unpoisoned(&self.entries)
            .iter()
            .any(|w| w.strong_count() > 0 && w.as_ptr() as *const () == id)
    }

    /// Live listeners at this instant. Dropped listeners are pruned.
    pub fn snapshot(&self) -> Vec<Arc<dyn OrientationListener>> {
        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|w| w.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static NEXT_GATE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static OPEN_GATES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Serialises a source's deliveries against its `stop()`.
///
/// Every fan-out runs inside [`DeliveryGate::deliver`]; `stop()` flips the
/// source state and then calls [`DeliveryGate::wait_idle`], after which no
/// delivery that saw the old state can still be running. A callback that
/// re-enters the same source on the delivering thread skips the wait.
pub struct DeliveryGate {
    id: usize,
    lock: Mutex<()>,
}

impl Default for DeliveryGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            lock: Mutex::new(()),
        }
    }

    fn held_by_current_thread(&self) -> bool {
        OPEN_GATES.with(|gates| gates.borrow().contains(&self.id))
    }

    pub fn deliver<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.held_by_current_thread() {
            return f();
        }
        let _guard = lock_unpoisoned(&self.lock);
        OPEN_GATES.with(|gates| gates.borrow_mut().push(self.id));
        let _open = OpenGate(self.id);
        f()
    }

    pub fn wait_idle(&self) {
        if self.held_by_current_thread() {
            return;
        }
        drop(lock_unpoisoned(&self.lock));
    }
}

// Pops the gate id even if a listener panics.
struct OpenGate(usize);

impl Drop for OpenGate {
    fn drop(&mut self) {
        OPEN_GATES.with(|gates| {
            let mut gates = gates.borrow_mut();
            if let Some(pos) = gates.iter().rposition(|id| *id == self.0) {
                gates.remove(pos);
            }
        });
    }
}

/// Fan a sample out to a snapshot of listeners.
pub(crate) fn notify_sample(listeners: &[Arc<dyn OrientationListener>], sample: &OrientationSample) {
    for listener in listeners {
        listener.on_orientation_changed(sample);
    }
}

pub(crate) fn notify_error(listeners: &[Arc<dyn OrientationListener>], error: &SourceError) {
    for listener in listeners {
        listener.on_source_error(error);
    }
}
