use crate::error::JobError;
use crate::io::inbox::InboxTx;
use crate::io::ring::JobRx;
use crate::model::{HandlerFactory, WorkerContext};
use crate::utils::{CancelToken, HealthFlag, Name};
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;
use uuid::fmt::Simple;

/// Result of one job, delivered back to the submitter.
pub type JobResult = Result<Value, JobError>;

/// Unique identifier of a worker thread.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WorkerId {
    raw: Simple,
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerId {
    /// Generate a new random id.
    pub fn new() -> WorkerId {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Message posted into a worker's job lane (supervisor → worker).
pub enum WorkerMsg {
    Job { name: Name, data: Value },
    Shutdown,
}

/// Message emitted by a worker (worker → supervisor).
///
/// `Ready` is the startup handshake; the pool treats a thread as usable
/// only after it arrives. `Exited` acknowledges a shutdown or reports an
/// unexpected death.
pub enum WorkerEvent {
    Ready(WorkerId),
    Reply(WorkerId, JobResult),
    Exited(WorkerId),
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}

/// Spawn one worker thread hosting a fresh model instance.
///
/// The model is built by `factory` on the worker's own thread, so its state
/// never crosses a thread boundary. Job errors and panics are wrapped as
/// replies; only `Shutdown` or cancellation ends the loop.
pub(crate) fn spawn_worker(
    id: WorkerId,
    thread_name: String,
    factory: Arc<dyn HandlerFactory>,
    ctx: WorkerContext,
    mut job_rx: JobRx,
    event_tx: InboxTx<WorkerEvent>,
    cancel: CancelToken,
    health: HealthFlag,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(thread_name).spawn(move || {
        let mut handler = match factory.build(&ctx) {
            Ok(h) => h,
            Err(err) => {
                tracing::error!("[{}] worker {} failed to build model: {}", ctx.model_name, id, err);
                let _ = event_tx.post(WorkerEvent::Exited(id));
                return;
            }
        };

        health.up();
        if event_tx.post(WorkerEvent::Ready(id)).is_err() {
            return;
        }

        loop {
            match job_rx.next(&cancel) {
                Some(WorkerMsg::Job { name, data }) => {
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| handler.handle(name.as_str(), data)));
                    let reply = match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(JobError::Failed(err.to_string())),
                        Err(payload) => Err(JobError::Failed(panic_message(payload))),
                    };

                    if event_tx.post(WorkerEvent::Reply(id, reply)).is_err() {
                        break;
                    }
                }
                Some(WorkerMsg::Shutdown) | None => break,
            }
        }

        health.down();
        let _ = event_tx.post(WorkerEvent::Exited(id));
    })
}
