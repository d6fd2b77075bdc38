//! Thread-safe listener registry with panic-isolated dispatch.
//!
//! # Concurrency model
//!
//! The receive task dispatches while application code may be adding or
//! removing listeners from any thread (including from inside a listener
//! callback).  [`ListenerSet`] keeps the listeners behind an `RwLock` and,
//! for every dispatch, copies the current `Arc`s into a snapshot and releases
//! the lock *before* calling any listener:
//!
//! - callbacks never run under the lock, so a listener may add or remove
//!   listeners (itself included) without deadlocking;
//! - an `add`/`remove` that returned before a dispatch started is always
//!   reflected in that dispatch, and a removed listener receives nothing
//!   whose dispatch starts after its removal returned.  A dispatch already
//!   in progress works on its snapshot and may still reach it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use crate::dispatch::listener::Listener;

/// A registered listener.  Identity is the `Arc` allocation.
pub type SharedListener<M> = Arc<dyn Listener<M>>;

/// Per-message dispatch tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Listeners whose `accept` returned true and whose `receive` completed.
    pub delivered: usize,
    /// Listeners whose `accept` returned false.
    pub rejected: usize,
    /// Listeners that panicked in `accept` or `receive`.
    pub failed: usize,
}

/// The set of listeners a connection dispatches to.
pub struct ListenerSet<M> {
    listeners: RwLock<Vec<SharedListener<M>>>,
}

impl<M> ListenerSet<M> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers `listener`.  Returns false if that same `Arc` is already
    /// registered.
    pub fn add(&self, listener: SharedListener<M>) -> bool {
        let mut guard = self.write();
        if guard.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        guard.push(listener);
        true
    }

    /// Unregisters `listener`.  Returns false if it was not registered.
    pub fn remove(&self, listener: &SharedListener<M>) -> bool {
        let mut guard = self.write();
        let before = guard.len();
        guard.retain(|l| !same_listener(l, listener));
        guard.len() != before
    }

    /// Returns true if `listener` is registered.
    pub fn contains(&self, listener: &SharedListener<M>) -> bool {
        self.read().iter().any(|l| same_listener(l, listener))
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Copies the current listeners out of the lock.
    pub fn snapshot(&self) -> Vec<SharedListener<M>> {
        self.read().clone()
    }

    /// Offers `message` to every listener registered right now.
    ///
    /// Each listener is isolated: a panic in its `accept` or `receive` is
    /// caught and logged, and the remaining listeners still run.
    pub fn dispatch(&self, message: &M) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for listener in self.snapshot() {
            let accepted = match panic::catch_unwind(AssertUnwindSafe(|| listener.accept(message)))
            {
                Ok(accepted) => accepted,
                Err(payload) => {
                    error!("listener panicked in accept: {}", panic_message(payload.as_ref()));
                    outcome.failed += 1;
                    continue;
                }
            };

            if !accepted {
                outcome.rejected += 1;
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| listener.receive(message))) {
                Ok(()) => outcome.delivered += 1,
                Err(payload) => {
                    error!("listener panicked in receive: {}", panic_message(payload.as_ref()));
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    // The lock only guards a Vec of Arcs and no callback runs under it, so a
    // poisoned lock still holds a consistent list.
    fn read(&self) -> RwLockReadGuard<'_, Vec<SharedListener<M>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<SharedListener<M>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M> Default for ListenerSet<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for ListenerSet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

/// Compares data pointers only; vtable pointers for the same type may differ
/// between codegen units.
fn same_listener<M>(a: &SharedListener<M>, b: &SharedListener<M>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
