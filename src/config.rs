use anyhow::Context;
use config::Config;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

pub const DEFAULT_BROADCAST_TOPIC: &str = "broadcastChannel";
pub const DEFAULT_WEBSWITCH_SERVER: &str = "server.webswitch.dev";
pub const DEFAULT_WEBSWITCH_PORT: u16 = 8062;

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(false)
}

/// Process-wide runtime configuration.
///
/// Loaded once at startup; per-pool knobs live in [`PoolOptions`] and are
/// supplied at model registration time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Inter-process event-bus topic for the distributed-cache bridge.
    pub topic_broadcast: String,

    /// Bridge the broadcast topic channel into each pool broker.
    pub distributed_cache_enabled: bool,

    /// Select the mesh uplink over the local event bus.
    pub webswitch_enabled: bool,

    /// Mesh uplink hostname.
    pub webswitch_server: String,

    /// Mesh uplink port.
    pub webswitch_port: u16,

    /// Defaults applied to pools registered without explicit options.
    #[serde(default)]
    pub pool_defaults: PoolOptions,
}

impl RuntimeConfig {
    /// Load configuration from environment variables (after a best-effort
    /// `.env` load). Recognized: TOPIC_BROADCAST, DISTRIBUTED_CACHE_ENABLED,
    /// WEBSWITCH_ENABLED, WEBSWITCH_SERVER, WEBSWITCH_PORT.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let topic_broadcast = std::env::var("TOPIC_BROADCAST")
            .unwrap_or_else(|_| DEFAULT_BROADCAST_TOPIC.to_string());
        let webswitch_server = std::env::var("WEBSWITCH_SERVER")
            .unwrap_or_else(|_| DEFAULT_WEBSWITCH_SERVER.to_string());
        let webswitch_port = std::env::var("WEBSWITCH_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WEBSWITCH_PORT);

        Self {
            topic_broadcast,
            distributed_cache_enabled: env_flag("DISTRIBUTED_CACHE_ENABLED"),
            webswitch_enabled: env_flag("WEBSWITCH_ENABLED"),
            webswitch_server,
            webswitch_port,
            pool_defaults: PoolOptions::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            topic_broadcast: DEFAULT_BROADCAST_TOPIC.to_string(),
            distributed_cache_enabled: false,
            webswitch_enabled: false,
            webswitch_server: DEFAULT_WEBSWITCH_SERVER.to_string(),
            webswitch_port: DEFAULT_WEBSWITCH_PORT,
            pool_defaults: PoolOptions::default(),
        }
    }
}

fn default_min() -> usize {
    1
}
fn default_max() -> usize {
    2
}
fn default_tolerance() -> u8 {
    25
}
fn default_queue_while_closed() -> bool {
    true
}

/// Per-pool scheduling knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolOptions {
    /// Threads kept alive after `startThreads`.
    #[serde(default = "default_min")]
    pub min: usize,

    /// Elastic growth ceiling.
    #[serde(default = "default_max")]
    pub max: usize,

    /// Queue-rate percentage above which the pool grows.
    #[serde(default = "default_tolerance")]
    pub queue_tolerance: u8,

    /// Create the pool (and its `min` threads) at registration instead of
    /// on first submit.
    #[serde(default)]
    pub preload: bool,

    /// Queue submissions arriving while the pool is closed; `false` rejects
    /// them with `pool-closed`.
    #[serde(default = "default_queue_while_closed")]
    pub queue_while_closed: bool,

    /// Path of the compute module loaded into each worker, if any.
    #[serde(default)]
    pub file: Option<String>,

    /// Opaque data handed to the handler factory per worker.
    #[serde(default)]
    pub worker_data: Value,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            queue_tolerance: default_tolerance(),
            preload: false,
            queue_while_closed: default_queue_while_closed(),
            file: None,
            worker_data: Value::Null,
        }
    }
}

/// One model's deployment entry: its port spec plus the pool knobs it
/// runs under.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDeployment {
    #[serde(flatten)]
    pub spec: crate::model::ModelSpec,
    #[serde(default)]
    pub options: PoolOptions,
}

/// Manifest listing every model a process hosts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Deployment {
    #[serde(default)]
    pub models: Vec<ModelDeployment>,
}

impl Deployment {
    /// Load a manifest file, layering `MODELRT_*` environment overrides on
    /// top (nested keys separated by `__`, e.g. `MODELRT_MODELS` paths).
    pub fn load(path: impl AsRef<str>) -> anyhow::Result<Self> {
        let cfg = Config::builder()
            .add_source(config::File::from(PathBuf::from(path.as_ref())))
            .add_source(config::Environment::with_prefix("MODELRT").separator("__"))
            .build()
            .with_context(|| format!("failed to read deployment manifest {}", path.as_ref()))?;

        cfg.try_deserialize()
            .with_context(|| format!("malformed deployment manifest {}", path.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pool_options_defaults() {
        let opts: PoolOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.min, 1);
        assert_eq!(opts.max, 2);
        assert_eq!(opts.queue_tolerance, 25);
        assert!(!opts.preload);
        assert!(opts.queue_while_closed);
    }

    #[test]
    fn deployment_entry_flattens_spec_beside_options() {
        let entry: ModelDeployment = serde_json::from_value(json!({
            "model_name": "order",
            "ports": [
                {"service": "notifyBilling", "kind": "outbound", "produces_event": "orderCreated"}
            ],
            "options": {"min": 2, "preload": true}
        }))
        .unwrap();

        assert_eq!(entry.spec.model_name.as_str(), "order");
        assert_eq!(entry.spec.ports.len(), 1);
        assert_eq!(entry.options.min, 2);
        assert!(entry.options.preload);
        // untouched knobs keep their defaults
        assert_eq!(entry.options.queue_tolerance, 25);
    }
}
