//! Registry of cancelable handles owned by a store.
//!
//! Long-lived operations of a store (change feeds, reactive queries, replication, session
//! renewal) register a [`Cancelable`] here.  Closing the store cancels all of them at
//! once, and dropping the registry does the same.  A handle that finishes on its own
//! deregisters itself on drop, so the registry only ever holds live operations.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    handles: BTreeMap<u64, Registered>,
    closed: bool,
}

#[derive(Debug)]
struct Registered {
    label: &'static str,
    token: CancellationToken,
}

/// Tracks the outstanding [`Cancelable`]s of one store.
#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    state: Mutex<RegistryState>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new handle.
    ///
    /// Registering on a closed registry hands out an already cancelled handle.
    pub(crate) fn register(self: &Arc<Self>, label: &'static str) -> Cancelable {
        let token = CancellationToken::new();
        let mut state = self.state.lock().expect("poisoned");
        if state.closed {
            token.cancel();
            return Cancelable {
                id: None,
                token,
                registry: Weak::new(),
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.handles.insert(
            id,
            Registered {
                label,
                token: token.clone(),
            },
        );
        trace!(id, label, "registered handle");
        Cancelable {
            id: Some(id),
            token,
            registry: Arc::downgrade(self),
        }
    }

    /// Number of live handles.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("poisoned").handles.len()
    }

    /// Cancels every registered handle and refuses new registrations.
    ///
    /// Returns the number of handles cancelled; a second call cancels nothing.
    pub(crate) fn cancel_all(&self) -> usize {
        let handles = {
            let mut state = self.state.lock().expect("poisoned");
            state.closed = true;
            std::mem::take(&mut state.handles)
        };
        for (id, handle) in &handles {
            trace!(id, label = handle.label, "cancelling handle");
            handle.token.cancel();
        }
        handles.len()
    }

    fn deregister(&self, id: u64) {
        self.state.lock().expect("poisoned").handles.remove(&id);
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// A long-lived operation that is stopped by cancelling its token.
///
/// Dropping the handle removes it from its registry without cancelling.
#[derive(Debug)]
pub struct Cancelable {
    id: Option<u64>,
    token: CancellationToken,
    registry: Weak<HandleRegistry>,
}

impl Cancelable {
    /// The token observed by the operation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests cancellation of the operation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Cancelable {
    fn drop(&mut self) {
        if let (Some(id), Some(registry)) = (self.id, self.registry.upgrade()) {
            registry.deregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_all_is_idempotent() {
        let registry = HandleRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn dropped_handles_deregister() {
        let registry = HandleRegistry::new();
        let a = registry.register("a");
        drop(a);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn register_after_close_is_cancelled() {
        let registry = HandleRegistry::new();
        registry.cancel_all();
        let late = registry.register("late");
        assert!(late.is_cancelled());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn dropping_registry_cancels() {
        let registry = HandleRegistry::new();
        let a = registry.register("a");
        drop(registry);
        assert!(a.is_cancelled());
    }
}
