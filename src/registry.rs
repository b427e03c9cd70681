use crate::broker::Broker;
use crate::config::{Deployment, PoolOptions, RuntimeConfig};
use crate::error::{JobError, PoolError};
use crate::mesh::{MeshConfig, MeshUplink};
use crate::model::{HandlerFactory, ModelSpec};
use crate::pool::{JobTicket, PoolHandle, PoolStatus, spawn_pool};
use crate::router::{BroadcastHub, PortEventRouter, listen_channel};
use crate::utils::{CancelToken, Name, StateCell};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Process-wide directory of thread pools, one per hosted model.
///
/// Created once at process start. Registration stores a model spec plus the
/// recipe for its pool; the pool itself is spawned eagerly (`preload`) or on
/// first submit through the lazy [`PoolRef`] façade.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RuntimeConfig,
    cancel: CancelToken,
    hub: Arc<BroadcastHub>,
    uplink: Option<Arc<MeshUplink>>,
    mesh_observer: Arc<Broker>,
    entries: RwLock<AHashMap<Name, Arc<PoolEntry>>>,
    specs: RwLock<AHashMap<Name, ModelSpec>>,
}

struct PoolEntry {
    name: Name,
    options: PoolOptions,
    factory: Arc<dyn HandlerFactory>,
    broker: Arc<Broker>,
    status: Arc<StateCell<PoolStatus>>,
    cancel: CancelToken,
    live: Mutex<EntryState>,
}

enum EntryState {
    Lazy,
    Live {
        handle: PoolHandle,
        join: Option<JoinHandle<()>>,
        #[allow(dead_code)]
        router: PortEventRouter,
    },
    Destroyed,
}

/// Thin façade over one registry entry, exposing only `submit` and
/// `status`. The real pool is created on the first `submit`, which keeps a
/// mostly-cold process from fanning out worker threads at startup.
#[derive(Clone)]
pub struct PoolRef {
    inner: Arc<RegistryInner>,
    entry: Arc<PoolEntry>,
}

impl PoolRef {
    /// Submit a job, creating the pool on first use.
    pub fn submit(&self, job_name: impl Into<Name>, data: Value) -> JobTicket {
        match self.inner.ensure_live(&self.entry) {
            Ok(handle) => handle.submit(job_name, data),
            Err(_) => JobTicket::failed(JobError::PoolDestroyed),
        }
    }

    /// Latest status snapshot; meaningful even before the pool exists.
    pub fn status(&self) -> Arc<PoolStatus> {
        self.entry.status.load()
    }

    pub fn name(&self) -> &Name {
        &self.entry.name
    }
}

impl PoolRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        let cancel = CancelToken::new_root();
        let mesh_observer = Broker::new_arc();

        let uplink = if config.webswitch_enabled {
            Some(MeshUplink::start(
                MeshConfig::new(config.webswitch_server.clone(), config.webswitch_port),
                mesh_observer.clone(),
                cancel.new_child(),
            ))
        } else {
            None
        };

        Self {
            inner: Arc::new(RegistryInner {
                config,
                cancel,
                hub: BroadcastHub::new_arc(),
                uplink,
                mesh_observer,
                entries: RwLock::new(AHashMap::new()),
                specs: RwLock::new(AHashMap::new()),
            }),
        }
    }

    /// Registry driven entirely by environment configuration.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    /// Host a model: store its spec and the recipe for its pool.
    pub fn register(
        &self,
        mut spec: ModelSpec,
        options: PoolOptions,
        factory: Arc<dyn HandlerFactory>,
    ) -> PoolRef {
        let key = Name::upper(&spec.model_name);
        // channels and entries share the upper-cased key
        spec.model_name = key.clone();
        self.inner.specs.write().insert(key.clone(), spec);

        let entry = self
            .inner
            .entries
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                let status = StateCell::new_arc(PoolStatus::initial(key.clone(), &options));
                Arc::new(PoolEntry {
                    name: key.clone(),
                    options,
                    factory,
                    broker: Broker::new_arc(),
                    status,
                    cancel: self.inner.cancel.new_child(),
                    live: Mutex::new(EntryState::Lazy),
                })
            })
            .clone();

        let pool = PoolRef {
            inner: self.inner.clone(),
            entry,
        };

        if pool.entry.options.preload
            && let Err(err) = self.inner.ensure_live(&pool.entry)
        {
            tracing::error!("[{}] preload failed: {}", pool.entry.name, err);
        }

        pool
    }

    /// Register every model of a deployment manifest behind one shared
    /// factory.
    pub fn register_deployment(
        &self,
        deployment: Deployment,
        factory: Arc<dyn HandlerFactory>,
    ) -> Vec<PoolRef> {
        deployment
            .models
            .into_iter()
            .map(|entry| self.register(entry.spec, entry.options, factory.clone()))
            .collect()
    }

    /// Record the spec of a model hosted elsewhere, so routers can classify
    /// its ports.
    pub fn register_remote(&self, mut spec: ModelSpec) {
        let key = Name::upper(&spec.model_name);
        spec.model_name = key.clone();
        self.inner.specs.write().insert(key, spec);
    }

    /// Forget a model. Its pool, if any, is destroyed by the next
    /// `reload_all`.
    pub fn deregister(&self, name: impl AsRef<str>) {
        self.inner.specs.write().remove(Name::upper(name).as_str());
    }

    /// Look up a pool façade by model name (case-insensitive).
    pub fn get(&self, name: impl AsRef<str>) -> Option<PoolRef> {
        let entry = self.inner.entries.read().get(Name::upper(name).as_str())?.clone();
        Some(PoolRef {
            inner: self.inner.clone(),
            entry,
        })
    }

    /// Live pool handle, if the pool has been spawned.
    pub fn pool_handle(&self, name: impl AsRef<str>) -> Option<PoolHandle> {
        let entry = self.inner.entries.read().get(Name::upper(name).as_str())?.clone();
        match &*entry.live.lock() {
            EntryState::Live { handle, .. } => Some(handle.clone()),
            _ => None,
        }
    }

    /// Attach `cb` to one pool's broker, or to every pool when the pattern
    /// is `"*"`. Works on lazy entries; the broker outlives pool restarts.
    pub fn listen(
        &self,
        pattern: &str,
        event: impl Into<Name>,
        cb: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let event = event.into();
        let cb = Arc::new(cb);

        for entry in self.inner.entries.read().values() {
            if pattern != "*" && !entry.name.as_str().eq_ignore_ascii_case(pattern) {
                continue;
            }
            let cb = cb.clone();
            entry.broker.on(event.clone(), move |data| cb(data));
        }
    }

    /// Hot-reload one pool. A pool that was never spawned has nothing to
    /// swap.
    pub fn reload(&self, name: impl AsRef<str>) -> Result<(), PoolError> {
        match self.pool_handle(name) {
            Some(handle) => handle.reload(),
            None => Ok(()),
        }
    }

    /// Reload every live pool in parallel, then destroy pools whose model
    /// is no longer known.
    pub fn reload_all(&self) -> Vec<(Name, Result<(), PoolError>)> {
        let handles: Vec<(Name, PoolHandle)> = self
            .inner
            .entries
            .read()
            .values()
            .filter_map(|entry| match &*entry.live.lock() {
                EntryState::Live { handle, .. } => Some((entry.name.clone(), handle.clone())),
                _ => None,
            })
            .collect();

        // kick every reload off before waiting on any of them
        let pending: Vec<_> = handles
            .into_iter()
            .map(|(name, handle)| (name, handle.reload_async()))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for (name, started) in pending {
            let res = match started {
                Ok(ack_rx) => match ack_rx.wait(None) {
                    Ok(res) => res,
                    Err(_) => Err(PoolError::Destroyed),
                },
                Err(err) => Err(err),
            };
            if let Err(err) = &res {
                tracing::error!("[{}] reload failed: {}", name, err);
            }
            results.push((name, res));
        }

        self.remove_undeployed_pools();
        results
    }

    /// Destroy every pool whose model spec is gone.
    fn remove_undeployed_pools(&self) {
        let undeployed: Vec<Name> = {
            let specs = self.inner.specs.read();
            self.inner
                .entries
                .read()
                .keys()
                .filter(|name| !specs.contains_key(name.as_str()))
                .cloned()
                .collect()
        };

        for name in undeployed {
            tracing::info!("[{}] model no longer deployed; destroying pool", name);
            if let Err(err) = self.destroy(&name) {
                tracing::error!("[{}] destroy failed: {}", name, err);
            }
        }
    }

    /// Tear one pool down: close, drain, stop threads, delete the entry.
    /// Racing submitters observe `pool-destroyed`.
    pub fn destroy(&self, name: impl AsRef<str>) -> Result<(), PoolError> {
        let key = Name::upper(name);
        let entry = self
            .inner
            .entries
            .write()
            .remove(key.as_str())
            .ok_or(PoolError::Destroyed)?;
        self.inner.specs.write().remove(key.as_str());

        let mut live = entry.live.lock();
        let state = std::mem::replace(&mut *live, EntryState::Destroyed);

        if let EntryState::Live { handle, join, .. } = state {
            let _ = handle.close();
            if let Err(err) = handle.drain() {
                tracing::warn!("[{}] drain during destroy: {}", entry.name, err);
            }
            if let Err(err) = handle.stop_threads() {
                tracing::warn!("[{}] stop during destroy: {}", entry.name, err);
            }
            let _ = handle.destroy();
            entry.cancel.cancel();
            if let Some(join) = join {
                let _ = join.join();
            }
        }

        Ok(())
    }

    /// Status snapshots of every registered pool.
    pub fn status_all(&self) -> Vec<Arc<PoolStatus>> {
        self.inner
            .entries
            .read()
            .values()
            .map(|entry| entry.status.load())
            .collect()
    }

    /// Mesh uplink, when `WEBSWITCH_ENABLED` selected it.
    pub fn uplink(&self) -> Option<&Arc<MeshUplink>> {
        self.inner.uplink.as_ref()
    }

    /// Broker receiving mesh-level events (`aegis-up`, recognizable
    /// incoming frames).
    pub fn mesh_observer(&self) -> &Arc<Broker> {
        &self.inner.mesh_observer
    }

    /// In-process channel hub shared by every pool.
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }

    /// Destroy every pool and cancel the registry's cancellation root.
    pub fn shutdown(&self) {
        let names: Vec<Name> = self.inner.entries.read().keys().cloned().collect();
        for name in names {
            let _ = self.destroy(&name);
        }
        self.inner.cancel.cancel();
    }
}

impl RegistryInner {
    /// One-shot `Lazy → Live` transition for a registry entry.
    fn ensure_live(&self, entry: &Arc<PoolEntry>) -> Result<PoolHandle, PoolError> {
        let mut live = entry.live.lock();
        match &*live {
            EntryState::Live { handle, .. } => Ok(handle.clone()),
            EntryState::Destroyed => Err(PoolError::Destroyed),
            EntryState::Lazy => {
                let (handle, join) = spawn_pool(
                    entry.name.clone(),
                    entry.options.clone(),
                    entry.factory.clone(),
                    entry.broker.clone(),
                    entry.status.clone(),
                    entry.cancel.clone(),
                )
                .map_err(|err| {
                    tracing::error!("[{}] failed to spawn pool: {}", entry.name, err);
                    PoolError::StartTimeout
                })?;

                let specs: Vec<ModelSpec> = self.specs.read().values().cloned().collect();
                let router = PortEventRouter::wire(
                    &entry.name,
                    &specs,
                    &entry.broker,
                    &self.hub,
                    &entry.cancel,
                );

                if let Some(uplink) = &self.uplink {
                    uplink.attach_pool(&entry.name, &entry.broker);
                }
                if self.config.distributed_cache_enabled {
                    let topic = Name::from(self.config.topic_broadcast.clone());
                    listen_channel(&self.hub, &topic, &entry.broker, &entry.cancel);
                }

                *live = EntryState::Live {
                    handle: handle.clone(),
                    join: Some(join),
                    router,
                };
                Ok(handle)
            }
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.inner.entries.read().len())
            .field("models", &self.inner.specs.read().len())
            .finish()
    }
}
