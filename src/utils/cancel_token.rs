use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Poll granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Cancellation token for one branch of the runtime's ownership tree.
///
/// The registry holds the root; each pool derives a child, and each
/// worker, channel listener, and uplink thread derives a grandchild.
/// Cancelling a token stops exactly its own subtree: every descendant
/// carries its ancestors' flags in its lineage and reads them on every
/// check, so no cross-thread notification is needed.
///
/// The lineage is flattened at derivation time. `is_cancelled` walks a
/// short array (registry, pool, worker: three entries) instead of chasing
/// parent pointers, and `cancel` is a single store on the token's own
/// flag.
#[derive(Clone)]
pub struct CancelToken {
    lineage: Arc<Vec<Arc<AtomicBool>>>,
}

impl CancelToken {
    /// Root token for a runtime instance.
    pub fn new_root() -> Self {
        Self {
            lineage: Arc::new(vec![Arc::new(AtomicBool::new(false))]),
        }
    }

    /// Derive a token one level below this one. The child observes every
    /// ancestor's cancellation; the ancestors never observe the child's.
    pub fn new_child(&self) -> Self {
        let mut lineage = Vec::with_capacity(self.lineage.len() + 1);
        lineage.extend(self.lineage.iter().cloned());
        lineage.push(Arc::new(AtomicBool::new(false)));
        Self {
            lineage: Arc::new(lineage),
        }
    }

    /// Cancel this token's subtree.
    pub fn cancel(&self) {
        if let Some(own) = self.lineage.last() {
            own.store(true, Ordering::Release);
        }
    }

    /// Whether this token, or any ancestor it was derived from, has been
    /// cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lineage
            .iter()
            .any(|flag| flag.load(Ordering::Acquire))
    }

    /// Sleep for `total`, waking early on cancellation. Returns `false`
    /// when the sleep ended because the token tripped.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("depth", &self.lineage.len())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_a_parent_trips_descendants_only() {
        let root = CancelToken::new_root();
        let pool = root.new_child();
        let worker = pool.new_child();
        let sibling = root.new_child();

        pool.cancel();
        assert!(pool.is_cancelled());
        assert!(worker.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new_root();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep_cancellable(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
