use std::{error::Error, fmt};

const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";
const ERR_MSG_PEER_GONE: &str = "other side of the channel is gone";

const ERR_MSG_POOL_CLOSED: &str = "pool is closed";
const ERR_MSG_POOL_DESTROYED: &str = "pool is destroyed";
const ERR_MSG_WORKER_EXITED: &str = "worker exited before replying";
const ERR_MSG_START_TIMEOUT: &str = "worker did not become ready in time";
const ERR_MSG_DRAINING_NOT_CLOSED: &str = "cannot drain a pool that is still open";
const ERR_MSG_DRAIN_TIMEOUT: &str = "drain timed out with jobs still running";
const ERR_MSG_NOT_DRAINED: &str = "stopThreads requires a drained pool";
const ERR_MSG_THREADS_ALIVE: &str = "startThreads requires all threads stopped";
const ERR_MSG_NO_THREADS: &str = "pool has no threads to open with";

/// Why a channel wait ended without a value.
///
/// `Closed` doubles as the destroyed-pool signal: when a supervisor exits,
/// its inbox and every outstanding one-shot disconnect, and waiters
/// translate that into `pool-destroyed`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitError {
    Timeout,
    Cancelled,
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            WaitError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            WaitError::Closed => write!(f, "{ERR_MSG_PEER_GONE}"),
        }
    }
}

impl Error for WaitError {}

/// Per-job error delivered through the submitter's [`JobTicket`].
///
/// `Failed` wraps a message produced by the hosted model (or a caught
/// panic); the other variants are admission and delivery failures. A job
/// error never takes the pool down.
///
/// [`JobTicket`]: crate::pool::JobTicket
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JobError {
    /// The model reported a failure while running the job.
    Failed(String),
    /// Submitted while the pool was closed and configured to reject.
    PoolClosed,
    /// Submitted while (or after) the pool was being destroyed.
    PoolDestroyed,
    /// The worker executing the job died before replying.
    WorkerExited,
    /// No worker became ready to take the job in time.
    StartTimeout,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Failed(msg) => write!(f, "job failed: {msg}"),
            JobError::PoolClosed => write!(f, "{ERR_MSG_POOL_CLOSED}"),
            JobError::PoolDestroyed => write!(f, "{ERR_MSG_POOL_DESTROYED}"),
            JobError::WorkerExited => write!(f, "{ERR_MSG_WORKER_EXITED}"),
            JobError::StartTimeout => write!(f, "{ERR_MSG_START_TIMEOUT}"),
        }
    }
}

impl Error for JobError {}

/// Lifecycle operation error, surfaced to the caller of
/// `close`/`drain`/`stopThreads`/`startThreads`/`reload` and to the
/// registry log. Never crashes a supervisor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolError {
    DrainingNotClosed,
    DrainTimeout,
    NotDrained,
    ThreadsAlive,
    NoThreads,
    StartTimeout,
    Destroyed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::DrainingNotClosed => write!(f, "{ERR_MSG_DRAINING_NOT_CLOSED}"),
            PoolError::DrainTimeout => write!(f, "{ERR_MSG_DRAIN_TIMEOUT}"),
            PoolError::NotDrained => write!(f, "{ERR_MSG_NOT_DRAINED}"),
            PoolError::ThreadsAlive => write!(f, "{ERR_MSG_THREADS_ALIVE}"),
            PoolError::NoThreads => write!(f, "{ERR_MSG_NO_THREADS}"),
            PoolError::StartTimeout => write!(f, "{ERR_MSG_START_TIMEOUT}"),
            PoolError::Destroyed => write!(f, "{ERR_MSG_POOL_DESTROYED}"),
        }
    }
}

impl Error for PoolError {}
