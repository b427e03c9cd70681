use crate::broker::Broker;
use crate::error::{JobError, PoolError, WaitError};
use crate::io::inbox::InboxTx;
use crate::io::oneshot::{OneshotRx, OneshotTx, oneshot};
use crate::pool::metrics::PoolStatus;
use crate::utils::{Name, StateCell};
use crate::worker::JobResult;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type AckTx = OneshotTx<Result<(), PoolError>>;
pub(crate) type AckRx = OneshotRx<Result<(), PoolError>>;

/// Control-plane input consumed by a pool supervisor.
pub(crate) enum PoolInput {
    Submit {
        name: Name,
        data: Value,
        completion: OneshotTx<JobResult>,
    },
    Close {
        ack: AckTx,
    },
    Open {
        ack: AckTx,
    },
    Drain {
        ack: AckTx,
    },
    StopThreads {
        ack: AckTx,
    },
    StartThreads {
        ack: AckTx,
    },
    Reload {
        ack: AckTx,
    },
    Destroy {
        ack: AckTx,
    },
}

/// One-shot future for a submitted job.
///
/// Resolves exactly once: with the worker's reply, with an admission error,
/// or with `PoolDestroyed` when the pool went away underneath it.
pub struct JobTicket {
    rx: OneshotRx<JobResult>,
}

impl JobTicket {
    /// Ticket resolved up front with an admission error.
    pub(crate) fn failed(err: JobError) -> Self {
        let (tx, rx) = oneshot::<JobResult>();
        tx.resolve(Err(err));
        Self { rx }
    }

    /// Block until the job resolves.
    pub fn wait(self) -> JobResult {
        match self.rx.wait(None) {
            Ok(result) => result,
            Err(_) => Err(JobError::PoolDestroyed),
        }
    }

    /// Block until the job resolves or `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<JobResult> {
        match self.rx.wait(Some(timeout)) {
            Ok(result) => Some(result),
            Err(WaitError::Timeout) => None,
            Err(_) => Some(Err(JobError::PoolDestroyed)),
        }
    }
}

/// Cloneable façade over one pool supervisor.
///
/// `submit` and the lifecycle operations are messages to the supervisor
/// thread; `status` reads the supervisor's last published snapshot without
/// messaging it.
#[derive(Clone)]
pub struct PoolHandle {
    name: Name,
    control_tx: InboxTx<PoolInput>,
    status: Arc<StateCell<PoolStatus>>,
    broker: Arc<Broker>,
}

impl PoolHandle {
    pub(crate) fn new(
        name: Name,
        control_tx: InboxTx<PoolInput>,
        status: Arc<StateCell<PoolStatus>>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            name,
            control_tx,
            status,
            broker,
        }
    }

    #[inline]
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Broker carrying this pool's domain and lifecycle events.
    #[inline]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Latest status snapshot (non-blocking, eventually consistent).
    pub fn status(&self) -> Arc<PoolStatus> {
        self.status.load()
    }

    /// Submit a job. Returns immediately; admission errors resolve the
    /// returned ticket.
    pub fn submit(&self, job_name: impl Into<Name>, data: Value) -> JobTicket {
        let (completion, rx) = oneshot::<JobResult>();
        let input = PoolInput::Submit {
            name: job_name.into(),
            data,
            completion,
        };

        // a dead supervisor hands the input back; recover the completion
        // slot and resolve the ticket instead of hanging it
        if let Err(input) = self.control_tx.post(input)
            && let PoolInput::Submit { completion, .. } = input
        {
            completion.resolve(Err(JobError::PoolDestroyed));
        }

        JobTicket { rx }
    }

    /// Stop admitting new jobs. Idempotent.
    pub fn close(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::Close { ack })
    }

    /// Resume admitting jobs. Idempotent; fails when the pool has no
    /// threads to run them.
    pub fn open(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::Open { ack })
    }

    /// Wait until no jobs are running. Requires a closed pool.
    pub fn drain(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::Drain { ack })
    }

    /// Terminate every thread. Requires a drained pool.
    pub fn stop_threads(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::StopThreads { ack })
    }

    /// Bring the pool back up to its `min` threads. Requires all previous
    /// threads stopped.
    pub fn start_threads(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::StartThreads { ack })
    }

    /// Hot-swap: close, drain, stop, start, open, bump the deploy count.
    /// Atomic with respect to new submissions.
    pub fn reload(&self) -> Result<(), PoolError> {
        match self.reload_async()?.wait(None) {
            Ok(result) => result,
            Err(_) => Err(PoolError::Destroyed),
        }
    }

    /// Kick off a reload and return the ack slot, so the registry can
    /// reload many pools in parallel.
    pub(crate) fn reload_async(&self) -> Result<AckRx, PoolError> {
        let (ack, ack_rx) = oneshot();
        self.control_tx
            .post(PoolInput::Reload { ack })
            .map_err(|_| PoolError::Destroyed)?;
        Ok(ack_rx)
    }

    /// Final teardown message; resolves queued work with `pool-destroyed`
    /// and ends the supervisor.
    pub(crate) fn destroy(&self) -> Result<(), PoolError> {
        self.call(|ack| PoolInput::Destroy { ack })
    }

    fn call(&self, make: impl FnOnce(AckTx) -> PoolInput) -> Result<(), PoolError> {
        let (ack, ack_rx) = oneshot();
        self.control_tx
            .post(make(ack))
            .map_err(|_| PoolError::Destroyed)?;

        match ack_rx.wait(None) {
            Ok(result) => result,
            Err(_) => Err(PoolError::Destroyed),
        }
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("name", &self.name)
            .finish()
    }
}
