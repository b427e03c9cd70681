use crate::utils::Name;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Event names observable on pool brokers and the mesh wire.
pub mod events {
    /// Pool accepted new work again.
    pub const POOL_OPEN: &str = "pool-open";
    /// Pool stopped admitting work.
    pub const POOL_CLOSE: &str = "pool-close";
    /// Pool finished quiescing.
    pub const POOL_DRAIN: &str = "pool-drain";
    /// Last in-flight job of a pool completed.
    pub const NO_JOBS_RUNNING: &str = "noJobsRunning";
    /// Locally unconsumed producer events, picked up by the mesh uplink.
    pub const TO_MAIN: &str = "to_main";
    /// Channel frame arrived without an `eventName` field.
    pub const MISSING_EVENT_NAME: &str = "missingEventName";
    /// Mesh uplink finished its handshake.
    pub const UPLINK_UP: &str = "aegis-up";
    /// Field carrying the event name on every channel/mesh frame.
    pub const EVENT_NAME_FIELD: &str = "eventName";
}

type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Process-local pub/sub keyed by string event name.
///
/// `on` appends; `notify` invokes handlers sequentially in registration
/// order. A failing or panicking handler is logged and the fan-out
/// continues, so one bad subscriber cannot starve its siblings.
pub struct Broker {
    handlers: RwLock<AHashMap<Name, Vec<Handler>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(AHashMap::new()),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a handler for `event`. Handlers fire in registration order.
    pub fn on(
        &self,
        event: impl Into<Name>,
        handler: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Fan `data` out to every handler of `event`.
    ///
    /// The handler list is snapshotted before the fan-out, so handlers may
    /// notify or subscribe re-entrantly without deadlocking.
    pub fn notify(&self, event: &str, data: &Value) {
        let snapshot: Vec<Handler> = match self.handlers.read().get(event) {
            Some(list) => list.clone(),
            None => return,
        };

        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!("[Broker] handler for '{}' failed: {}", event, err);
                }
                Err(_) => {
                    tracing::error!("[Broker] handler for '{}' panicked", event);
                }
            }
        }
    }

    /// Number of handlers currently attached to `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("events", &self.handlers.read().len())
            .finish()
    }
}
