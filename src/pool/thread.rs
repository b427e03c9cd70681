use crate::io::ring::JobTx;
use crate::utils::{CancelToken, HealthFlag};
use crate::worker::WorkerId;
use serde::Serialize;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

/// Supervisor-side lifecycle of one worker thread.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Starting,
    Idle,
    Busy,
    Draining,
    Terminated,
}

/// Supervisor-side handle over one worker.
///
/// Exclusively owned by one pool supervisor; nothing here is shared. The
/// job lane is the SPSC ring, so job order per thread is FIFO.
pub(crate) struct ThreadHandle {
    pub id: WorkerId,
    pub created_at_us: u64,
    pub state: ThreadState,
    pub job_tx: JobTx,
    pub join: Option<JoinHandle<()>>,
    pub health: HealthFlag,
    pub cancel: CancelToken,
}

/// Microseconds since the epoch; used for thread birth stamps so reload
/// freshness can be asserted.
pub(crate) fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
