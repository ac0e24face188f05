//! Connection registry
//!
//! Enforces that only one driver talks to the device at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Single-slot registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    held: AtomicBool,
}

static GLOBAL_REGISTRY: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();

impl ConnectionRegistry {
    /// An empty registry, independent of the global one
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`Limonata::connect`](super::Limonata::connect)
    pub fn global() -> Arc<ConnectionRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(ConnectionRegistry::new()))
            .clone()
    }

    /// Claim the slot. Returns `false` if it is already taken.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free the slot. Releasing an empty registry is a no-op.
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Whether a driver currently holds the slot
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
