use crate::error::WaitError;
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

/// How long a blocking wait sits in the kernel before re-checking the
/// cancel token.
const CANCEL_SLICE: Duration = Duration::from_millis(25);

/// Many-writers/one-reader mailbox.
///
/// This is the shape every long-lived thread in the runtime receives on:
/// pool handles post control inputs to the supervisor, workers post
/// replies, broadcast channels post frames to their listeners, and
/// publishers post frames to the mesh uplink. Writers never block (the
/// queue is unbounded and `post` hands the value back if the reader is
/// gone); the single reader either polls opportunistically inside its own
/// loop or parks with a deadline.
pub fn inbox<T>() -> (InboxTx<T>, Inbox<T>) {
    let (tx, rx) = cbchan::unbounded::<T>();
    (InboxTx { tx }, Inbox { rx })
}

/// What [`Inbox::poll`] found.
pub enum Poll<T> {
    Item(T),
    Empty,
    /// Every writer hung up; the owning thread should wind down.
    Closed,
}

pub struct InboxTx<T> {
    tx: cbchan::Sender<T>,
}

// not derived: writers clone regardless of T
impl<T> Clone for InboxTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> InboxTx<T> {
    /// Post a value; never blocks. On a dead reader the value comes back
    /// so the caller can resolve or re-route it.
    pub fn post(&self, value: T) -> Result<(), T> {
        self.tx.send(value).map_err(|cbchan::SendError(v)| v)
    }
}

pub struct Inbox<T> {
    rx: cbchan::Receiver<T>,
}

impl<T> Inbox<T> {
    /// Non-blocking look at the queue head.
    pub fn poll(&mut self) -> Poll<T> {
        match self.rx.try_recv() {
            Ok(value) => Poll::Item(value),
            Err(cbchan::TryRecvError::Empty) => Poll::Empty,
            Err(cbchan::TryRecvError::Disconnected) => Poll::Closed,
        }
    }

    /// Park until something arrives, the writers hang up, or the token
    /// trips. `None` means stop reading, whichever way it happened.
    pub fn next(&mut self, cancel: &CancelToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(CANCEL_SLICE) {
                Ok(value) => return Some(value),
                Err(cbchan::RecvTimeoutError::Timeout) => continue,
                Err(cbchan::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Park until something arrives or `deadline` passes, honouring the
    /// cancel token. Lifecycle waits (ready handshakes, shutdown grace)
    /// run on this.
    pub fn next_before(
        &mut self,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<T, WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            match self.rx.recv_timeout((deadline - now).min(CANCEL_SLICE)) {
                Ok(value) => return Ok(value),
                Err(cbchan::RecvTimeoutError::Timeout) => continue,
                Err(cbchan::RecvTimeoutError::Disconnected) => return Err(WaitError::Closed),
            }
        }
    }
}
