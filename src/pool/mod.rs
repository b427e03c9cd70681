pub use handle::{JobTicket, PoolHandle};
pub use metrics::{PoolCounters, PoolState, PoolStatus, ThreadInfo};
pub use supervisor::spawn_pool;
pub use thread::ThreadState;
pub(crate) use thread::epoch_micros;

mod handle;
mod metrics;
mod supervisor;
mod thread;

use std::time::Duration;

/// How long `drain` waits for in-flight jobs before giving up.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(4);

/// How long the pool waits for a worker's ready handshake.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for a worker to acknowledge `Shutdown`.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Interval of the background dequeue sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(1_500);

/// Pause between pulling threads off the free stack and terminating them.
/// The ordering (remove first, terminate second) is load-bearing on hosts
/// that share memory segments between workers; keep it even where the
/// runtime itself would tolerate the reverse.
pub const STOP_REMOVE_DELAY: Duration = Duration::from_millis(100);
