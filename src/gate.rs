//! Delivery gate shared by a callback registration and its cancel handle.
//!
//! The gate is held for the whole duration of a callback. `close` takes the
//! same lock, so once it returns no callback is running and none will start.
//! The lock is re-entrant: a callback may close its own gate.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

#[derive(Debug, Clone)]
pub(crate) struct DeliveryGate(Arc<ReentrantMutex<Cell<bool>>>);

impl DeliveryGate {
    pub(crate) fn new() -> Self {
        Self(Arc::new(ReentrantMutex::new(Cell::new(true))))
    }

    /// Run `f` if the gate is still open. Returns whether it ran.
    pub(crate) fn deliver(&self, f: impl FnOnce()) -> bool {
        let open = self.0.lock();
        if !open.get() {
            return false;
        }
        f();
        true
    }

    /// Close the gate, waiting for an in-flight delivery on another thread.
    /// The wait is a blocking lock, not an async one. Returns `true` the
    /// first time only.
    pub(crate) fn close(&self) -> bool {
        self.0.lock().replace(false)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.lock().get()
    }
}

impl Default for DeliveryGate {
    fn default() -> Self {
        Self::new()
    }
}
