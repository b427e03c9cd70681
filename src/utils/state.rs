use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free snapshot cell with versioning.
///
/// Internally uses [`ArcSwap`] for atomic snapshot replacement and an
/// `AtomicU64` sequence counter for change detection. A pool supervisor
/// publishes its status snapshot here after every mutation; callers read it
/// without blocking the supervisor. Readers tolerate a stale snapshot.
#[derive(Debug)]
pub struct StateCell<S: Send + Sync + 'static> {
    snap: ArcSwap<S>,
    seq: CachePadded<AtomicU64>,
}

impl<S: Send + Sync + 'static> StateCell<S> {
    /// Create a new cell with an initial snapshot.
    pub fn new(init: S) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(init)),
            seq: CachePadded::new(AtomicU64::new(1)),
        }
    }

    /// Create a new cell wrapped in [`Arc`].
    pub fn new_arc(init: S) -> Arc<Self> {
        Arc::new(Self::new(init))
    }

    /// Publish a new snapshot (by Arc).
    #[inline]
    pub fn publish_arc(&self, next: Arc<S>) {
        self.snap.store(next);
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Publish a new snapshot (by value).
    #[inline]
    pub fn publish(&self, next: S) {
        self.publish_arc(Arc::new(next));
    }

    /// Temporary borrow of the current snapshot. Suited for local reads;
    /// keep one guard per logical read rather than calling repeatedly.
    #[inline]
    pub fn peek(&self) -> arc_swap::Guard<Arc<S>> {
        self.snap.load()
    }

    /// Get the current snapshot as an owned [`Arc`].
    #[inline]
    pub fn load(&self) -> Arc<S> {
        self.snap.load_full()
    }

    /// Apply a closure to the snapshot if the sequence changed since
    /// `last_seq`, updating `last_seq`.
    #[inline]
    pub fn with_if_changed<R>(&self, last_seq: &mut u64, f: impl FnOnce(&S) -> R) -> Option<R> {
        let cur = self.seq.load(Ordering::Acquire);
        if cur == *last_seq {
            return None;
        }
        let g = self.snap.load();
        *last_seq = cur;
        Some(f(&g))
    }

    /// Current sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Check if the sequence changed since `last`.
    #[inline]
    pub fn changed_since(&self, last: u64) -> bool {
        self.seq() != last
    }
}
