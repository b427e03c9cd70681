use crate::broker::{Broker, events};
use crate::io::inbox::{Inbox, InboxTx, Poll, inbox};
use crate::utils::{CancelToken, HealthFlag, Name};
use crate::warn_throttled;
use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

/// Interval between publish retries while the socket is not ready.
pub const PUBLISH_RETRY: Duration = Duration::from_secs(1);

/// TCP connect timeout towards the mesh server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll granularity of the uplink read loop.
const READ_POLL: Duration = Duration::from_millis(50);

/// Opening frame expected by the mesh server.
const HANDSHAKE: &str = "webswitch";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub host: String,
    pub port: u16,
}

impl MeshConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

type UplinkCallback = Box<dyn Fn(&Value) + Send + Sync>;

/// Fallback publisher/subscriber towards the external service mesh.
///
/// Keeps at most one WebSocket connection on a dedicated thread. Publishing
/// never blocks the caller and is never durable: frames queue to the uplink
/// thread, which retries at a fixed interval until the socket is ready.
/// Mesh errors are logged and swallowed; the retry loop carries on.
pub struct MeshUplink {
    outbound_tx: InboxTx<Value>,
    observer: Arc<Broker>,
    callback: Arc<Mutex<Option<UplinkCallback>>>,
    address: Arc<Mutex<Option<SocketAddr>>>,
    health: HealthFlag,
}

impl MeshUplink {
    /// Start the uplink thread. The connection itself is established lazily
    /// on the first publish.
    pub fn start(cfg: MeshConfig, observer: Arc<Broker>, cancel: CancelToken) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = inbox::<Value>();
        let callback: Arc<Mutex<Option<UplinkCallback>>> = Arc::new(Mutex::new(None));
        let address = Arc::new(Mutex::new(None));
        let health = HealthFlag::new(false);

        let uplink = Arc::new(Self {
            outbound_tx,
            observer: observer.clone(),
            callback: callback.clone(),
            address: address.clone(),
            health: health.clone(),
        });

        let worker = UplinkWorker {
            cfg,
            observer,
            callback,
            address,
            health,
            cancel,
            outbound_rx,
            socket: None,
            pending: None,
        };

        if let Err(err) = thread::Builder::new()
            .name("mesh-uplink".into())
            .spawn(move || worker.run())
        {
            tracing::error!("[MeshUplink] failed to spawn uplink thread: {}", err);
        }

        uplink
    }

    /// Queue an event for the mesh. Non-blocking; no durable buffering.
    pub fn publish_event(&self, event: Value) {
        if self.outbound_tx.post(event).is_err() {
            tracing::error!("[MeshUplink] uplink thread is gone; frame dropped");
        }
    }

    /// Install the single uplink callback for incoming frames.
    pub fn on_message(&self, cb: impl Fn(&Value) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Box::new(cb));
    }

    /// Forget the cached server address; the next connect resolves again.
    pub fn reset_address(&self) {
        *self.address.lock() = None;
    }

    /// Whether the socket finished its handshake and is currently usable.
    pub fn is_up(&self) -> bool {
        self.health.is_up()
    }

    /// Observer broker receiving `aegis-up` and recognizable incoming
    /// events.
    pub fn observer(&self) -> &Arc<Broker> {
        &self.observer
    }

    /// Wire a pool broker's unhandled events into this uplink.
    pub fn attach_pool(self: &Arc<Self>, pool: &Name, broker: &Arc<Broker>) {
        let uplink = self.clone();
        let pool = pool.clone();
        broker.on(events::TO_MAIN, move |event| {
            tracing::debug!("[{}] forwarding unhandled event to mesh", pool);
            uplink.publish_event(event.clone());
            Ok(())
        });
    }
}

struct UplinkWorker {
    cfg: MeshConfig,
    observer: Arc<Broker>,
    callback: Arc<Mutex<Option<UplinkCallback>>>,
    address: Arc<Mutex<Option<SocketAddr>>>,
    health: HealthFlag,
    cancel: CancelToken,
    outbound_rx: Inbox<Value>,
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
    pending: Option<Value>,
}

impl UplinkWorker {
    fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                if let Some(mut ws) = self.socket.take() {
                    let _ = ws.close(None);
                }
                self.health.down();
                return;
            }

            let frame = match self.pending.take() {
                Some(frame) => Some(frame),
                None => match self.outbound_rx.poll() {
                    Poll::Item(frame) => Some(frame),
                    _ => None,
                },
            };

            let mut worked = false;

            if let Some(frame) = frame {
                worked = true;
                if let Err(err) = self.try_publish(&frame) {
                    warn_throttled!(
                        Duration::from_secs(5),
                        "[MeshUplink] publish failed: {err}; retrying"
                    );
                    self.pending = Some(frame);
                    self.cancel.sleep_cancellable(PUBLISH_RETRY);
                }
            }

            if self.poll_incoming() {
                worked = true;
            }

            if !worked && self.socket.is_none() {
                // idle and disconnected; reconnection stays lazy
                self.cancel.sleep_cancellable(READ_POLL);
            }
        }
    }

    fn try_publish(&mut self, frame: &Value) -> anyhow::Result<()> {
        self.ensure_connected()?;

        if let Some(ws) = self.socket.as_mut()
            && let Err(err) = ws.send(Message::Text(frame.to_string()))
        {
            self.drop_socket();
            return Err(anyhow!(err));
        }
        Ok(())
    }

    /// Drain whatever the server pushed. Returns true when a frame arrived.
    fn poll_incoming(&mut self) -> bool {
        let Some(ws) = self.socket.as_mut() else {
            return false;
        };

        match ws.read() {
            Ok(Message::Text(text)) => {
                self.handle_incoming(&text);
                true
            }
            Ok(_) => false,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                false
            }
            Err(err) => {
                tracing::warn!("[MeshUplink] connection lost: {}", err);
                self.drop_socket();
                false
            }
        }
    }

    fn handle_incoming(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("[MeshUplink] unparsable frame: {}", err);
                return;
            }
        };

        if let Some(cb) = self.callback.lock().as_ref() {
            cb(&frame);
        }

        if let Some(name) = frame.get(events::EVENT_NAME_FIELD).and_then(Value::as_str) {
            self.observer.notify(name, &frame);
        }
    }

    fn ensure_connected(&mut self) -> anyhow::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("mesh connect to {addr} failed"))?;

        let url = Url::parse(&format!("ws://{}:{}", self.cfg.host, self.cfg.port))
            .with_context(|| format!("invalid mesh endpoint {}:{}", self.cfg.host, self.cfg.port))?;
        let (mut ws, _response) = tungstenite::client(url.as_str(), MaybeTlsStream::Plain(stream))
            .map_err(|err| anyhow!("mesh websocket handshake failed: {err}"))?;

        // announce ourselves; the server expects the literal handshake frame
        ws.send(Message::Text(format!("\"{HANDSHAKE}\"")))
            .map_err(|err| anyhow!("mesh handshake frame failed: {err}"))?;

        if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
            let _ = stream.set_read_timeout(Some(READ_POLL));
        }

        tracing::info!("[MeshUplink] connected to {}", addr);
        self.health.up();
        self.observer.notify(
            events::UPLINK_UP,
            &json!({ (events::EVENT_NAME_FIELD): events::UPLINK_UP }),
        );
        self.socket = Some(ws);
        Ok(())
    }

    /// Resolve the configured hostname once and cache the address until
    /// `reset_address`.
    fn resolve(&self) -> anyhow::Result<SocketAddr> {
        let mut cached = self.address.lock();
        if let Some(addr) = *cached {
            return Ok(addr);
        }

        let addr = (self.cfg.host.as_str(), self.cfg.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve mesh host {}", self.cfg.host))?
            .next()
            .ok_or_else(|| anyhow!("mesh host {} resolved to nothing", self.cfg.host))?;

        *cached = Some(addr);
        Ok(addr)
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.health.down();
    }
}
