use crate::utils::Name;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of a declared port.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Inbound,
    Outbound,
}

/// Declared event interface on a model.
///
/// Producer and consumer ports are matched by string equality of their
/// event names; the router decides at wiring time whether a pair is
/// intra-pool, inter-pool, or remote.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortSpec {
    pub service: Name,
    pub kind: PortKind,
    #[serde(default)]
    pub consumes_event: Option<Name>,
    #[serde(default)]
    pub produces_event: Option<Name>,
    /// Name of the domain callback invoked when the consumed event arrives.
    #[serde(default)]
    pub callback: Option<String>,
    /// Name of the compensating callback.
    #[serde(default)]
    pub undo: Option<String>,
}

impl PortSpec {
    pub fn inbound(service: impl Into<Name>, consumes: impl Into<Name>) -> Self {
        Self {
            service: service.into(),
            kind: PortKind::Inbound,
            consumes_event: Some(consumes.into()),
            produces_event: None,
            callback: None,
            undo: None,
        }
    }

    pub fn outbound(service: impl Into<Name>, produces: impl Into<Name>) -> Self {
        Self {
            service: service.into(),
            kind: PortKind::Outbound,
            consumes_event: None,
            produces_event: Some(produces.into()),
            callback: None,
            undo: None,
        }
    }
}

/// Registered description of one domain model: its name plus the ports it
/// exposes. Loaded from config files or built in code.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    pub model_name: Name,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

impl ModelSpec {
    pub fn new(model_name: impl Into<Name>) -> Self {
        Self {
            model_name: model_name.into(),
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.ports.push(port);
        self
    }
}

/// Context handed to a [`HandlerFactory`] inside each worker thread.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub model_name: Name,
    pub worker_data: Value,
    pub file: Option<String>,
}

/// A hosted model instance living inside one worker.
///
/// One instance per worker thread; the pool never shares an instance
/// between threads, so `&mut self` is uncontended. An `Err` is wrapped as a
/// job failure and returned to the submitter; it does not kill the worker.
pub trait JobHandler: Send + 'static {
    fn handle(&mut self, job: &str, data: Value) -> anyhow::Result<Value>;
}

impl<F> JobHandler for F
where
    F: FnMut(&str, Value) -> anyhow::Result<Value> + Send + 'static,
{
    fn handle(&mut self, job: &str, data: Value) -> anyhow::Result<Value> {
        self(job, data)
    }
}

/// Builds a fresh [`JobHandler`] inside each worker thread.
///
/// The factory runs on the worker's own thread so model state never crosses
/// a thread boundary.
pub trait HandlerFactory: Send + Sync + 'static {
    fn build(&self, ctx: &WorkerContext) -> anyhow::Result<Box<dyn JobHandler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&WorkerContext) -> anyhow::Result<Box<dyn JobHandler>> + Send + Sync + 'static,
{
    fn build(&self, ctx: &WorkerContext) -> anyhow::Result<Box<dyn JobHandler>> {
        self(ctx)
    }
}
