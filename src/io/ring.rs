use crate::utils::CancelToken;
use crate::worker::WorkerMsg;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::time::Duration;

/// How long an idle worker naps between looks at its ring.
const POLL_NAP: Duration = Duration::from_micros(200);

/// Spins before the first nap; covers the common case where the next job
/// lands right behind the previous reply.
const POLL_SPINS: u32 = 32;

/// The one-in/one-out job lane between a pool supervisor and a single
/// worker.
///
/// Exactly one producer (the supervisor) and one consumer (the worker),
/// so per-thread job order is FIFO by construction. The supervisor only
/// posts to a thread it just popped off the free stack, which means the
/// lane holds at most one job plus the final shutdown message; posting is
/// therefore non-blocking, and a full lane marks the worker as broken
/// rather than something to wait on.
pub struct JobRing;

impl JobRing {
    pub fn new(capacity: usize) -> (JobTx, JobRx) {
        let (prod, cons) = HeapRb::<WorkerMsg>::new(capacity).split();
        (JobTx { prod }, JobRx { cons })
    }
}

pub struct JobTx {
    prod: HeapProd<WorkerMsg>,
}

impl JobTx {
    /// Post a message; a full lane hands it back.
    pub fn post(&mut self, msg: WorkerMsg) -> Result<(), WorkerMsg> {
        self.prod.try_push(msg)
    }
}

pub struct JobRx {
    cons: HeapCons<WorkerMsg>,
}

impl JobRx {
    /// Block until the next message or cancellation. `None` tells the
    /// worker loop to exit.
    pub fn next(&mut self, cancel: &CancelToken) -> Option<WorkerMsg> {
        let mut idle: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(msg) = self.cons.try_pop() {
                return Some(msg);
            }
            idle = idle.saturating_add(1);
            if idle < POLL_SPINS {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(POLL_NAP);
            }
        }
    }
}
