use crate::error::WaitError;
use crossbeam::channel as cbchan;
use std::time::Duration;

/// Single-value reply slot.
///
/// Every job completion and every lifecycle acknowledgement travels
/// through one of these. The sender side is consumed by [`OneshotTx::resolve`],
/// so a completion cannot fire twice by construction; dropping it
/// unresolved disconnects the slot, which the waiter reads as
/// [`WaitError::Closed`] (the pool went away underneath it).
pub fn oneshot<T>() -> (OneshotTx<T>, OneshotRx<T>) {
    let (tx, rx) = cbchan::bounded::<T>(1);
    (OneshotTx { tx }, OneshotRx { rx })
}

pub struct OneshotTx<T> {
    tx: cbchan::Sender<T>,
}

impl<T> OneshotTx<T> {
    /// Deliver the value. A waiter that already gave up is not an error;
    /// the value is simply dropped.
    pub fn resolve(self, value: T) {
        let _ = self.tx.try_send(value);
    }
}

pub struct OneshotRx<T> {
    rx: cbchan::Receiver<T>,
}

impl<T> OneshotRx<T> {
    /// Park until the slot resolves. Supervisors always either resolve or
    /// drop their slots on teardown, so this cannot hang on a live pool;
    /// no timeout means wait for whichever of those happens.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, WaitError> {
        match timeout {
            None => self.rx.recv().map_err(|_| WaitError::Closed),
            Some(limit) => self.rx.recv_timeout(limit).map_err(|err| match err {
                cbchan::RecvTimeoutError::Timeout => WaitError::Timeout,
                cbchan::RecvTimeoutError::Disconnected => WaitError::Closed,
            }),
        }
    }
}
