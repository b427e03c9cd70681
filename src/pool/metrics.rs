use crate::config::PoolOptions;
use crate::pool::thread::ThreadState;
use crate::utils::Name;
use serde::Serialize;

/// Lifecycle position of a pool.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Open,
    Closed,
    Drained,
    Stopped,
}

impl PoolState {
    #[inline]
    pub fn is_open(self) -> bool {
        self == PoolState::Open
    }
}

/// Supervisor-private counters. Monotonic over the pool's lifetime; reload
/// does not reset them.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolCounters {
    pub jobs_requested: u64,
    pub jobs_queued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub reloads: u64,
    pub deploys: u64,
}

impl PoolCounters {
    /// Percentage of requested jobs that had to queue, rounded to the
    /// nearest integer. Defined as 0 while nothing was requested; can never
    /// exceed 100 because a job queues at most once per request.
    pub fn queue_rate(&self) -> u8 {
        if self.jobs_requested == 0 {
            return 0;
        }
        let rate = (100 * self.jobs_queued + self.jobs_requested / 2) / self.jobs_requested;
        rate.min(100) as u8
    }
}

/// Per-thread slice of a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: String,
    pub created_at_us: u64,
    pub state: ThreadState,
    pub healthy: bool,
}

/// Consistent, eventually-consistent snapshot of one pool.
///
/// Published by the supervisor into a `StateCell` after every mutation;
/// reading it never blocks the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: Name,
    pub state: PoolState,
    pub open: bool,
    pub total_threads: usize,
    pub free_threads: usize,
    pub waiting_jobs: usize,
    pub jobs_requested: u64,
    pub jobs_queued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub queue_rate: u8,
    pub queue_tolerance: u8,
    pub min: usize,
    pub max: usize,
    pub reloads: u64,
    pub deploys: u64,
    pub threads: Vec<ThreadInfo>,
}

impl PoolStatus {
    /// Snapshot for a pool that exists in the registry but has not been
    /// spawned yet (lazy entry) or has just booted.
    pub fn initial(name: Name, opts: &PoolOptions) -> Self {
        Self {
            name,
            state: PoolState::Open,
            open: true,
            total_threads: 0,
            free_threads: 0,
            waiting_jobs: 0,
            jobs_requested: 0,
            jobs_queued: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            queue_rate: 0,
            queue_tolerance: opts.queue_tolerance,
            min: opts.min,
            max: opts.max,
            reloads: 0,
            deploys: 0,
            threads: Vec::new(),
        }
    }

    /// `noJobsRunning` predicate over this snapshot.
    pub fn no_jobs_running(&self) -> bool {
        self.total_threads == self.free_threads
    }
}
