pub use crate::abi::{StringPairHandler, lift, lower};
pub use crate::broker::{Broker, events};
pub use crate::config::{Deployment, ModelDeployment, PoolOptions, RuntimeConfig};
pub use crate::error::{JobError, PoolError, WaitError};
pub use crate::io::inbox::{Inbox, InboxTx, Poll, inbox};
pub use crate::io::oneshot::{OneshotRx, OneshotTx, oneshot};
pub use crate::io::ring::{JobRing, JobRx, JobTx};
pub use crate::mesh::{MeshConfig, MeshUplink};
pub use crate::model::{HandlerFactory, JobHandler, ModelSpec, PortKind, PortSpec, WorkerContext};
pub use crate::pool::{JobTicket, PoolHandle, PoolState, PoolStatus};
pub use crate::registry::{PoolRef, PoolRegistry};
pub use crate::router::{BroadcastChannel, BroadcastHub, PortEventRouter};
pub use crate::utils::{CancelToken, HealthFlag, Name, StateCell};
pub use crate::worker::{JobResult, WorkerId};
