use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Liveness marker shared between a worker (or the mesh uplink) and its
/// owner.
///
/// The owning side reads it rarely, when publishing a status snapshot, so
/// a plain relaxed atomic is all this needs. Starts down; the worker
/// raises it after its ready handshake and drops it on the way out.
#[derive(Clone, Default)]
pub struct HealthFlag(Arc<AtomicBool>);

impl HealthFlag {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    /// Mark the owner as live.
    #[inline]
    pub fn up(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Mark the owner as down.
    #[inline]
    pub fn down(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Whether the owner currently reports itself live.
    #[inline]
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HealthFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HealthFlag").field(&self.is_up()).finish()
    }
}
