pub use channel::{BroadcastChannel, BroadcastHub};

mod channel;

use crate::broker::{Broker, events};
use crate::model::{ModelSpec, PortKind, PortSpec};
use crate::utils::{CancelToken, Name};
use ahash::AHashSet;
use serde_json::Value;
use std::sync::Arc;
use std::thread;

/// Wiring summary, kept for logs and introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    pub local_ports: usize,
    pub remote_ports: usize,
    pub publish_ports: usize,
    pub subscribe_ports: usize,
    pub unhandled_ports: usize,
    pub skipped_ports: usize,
    pub channels: usize,
}

/// Per-pool broadcast wiring between local producers and local or remote
/// consumers.
///
/// At pool start the router walks every registered model spec, classifies
/// each port relative to this pool, and wires broadcast channels
/// accordingly. Intra-pool pairs need no wiring beyond the broker itself;
/// inter-pool pairs cross a serialize/parse deep-copy boundary; events no
/// one consumes fall through to the mesh uplink via `to_main`.
pub struct PortEventRouter {
    pool: Name,
    stats: RouterStats,
}

impl PortEventRouter {
    /// Classify every registered port and wire the broadcast channels for
    /// one pool. Mis-configured ports are reported once and skipped.
    pub fn wire(
        pool: &Name,
        specs: &[ModelSpec],
        broker: &Arc<Broker>,
        hub: &Arc<BroadcastHub>,
        cancel: &CancelToken,
    ) -> Self {
        let mut stats = RouterStats::default();

        let is_local =
            |spec: &ModelSpec| spec.model_name.matches(pool.as_str());

        // what this pool produces and consumes
        let mut local_produced: AHashSet<&str> = AHashSet::new();
        let mut local_consumed: AHashSet<&str> = AHashSet::new();
        // what anyone anywhere consumes, for the mesh fallback decision
        let mut consumed_anywhere: AHashSet<&str> = AHashSet::new();

        for spec in specs {
            for port in &spec.ports {
                if let Some(event) = port.consumes_event.as_ref() {
                    consumed_anywhere.insert(event.as_str());
                }
                if is_local(spec) {
                    if let Some(event) = port.produces_event.as_ref() {
                        local_produced.insert(event.as_str());
                    }
                    if let Some(event) = port.consumes_event.as_ref() {
                        local_consumed.insert(event.as_str());
                    }
                }
            }
        }

        let mut publish_wired: AHashSet<(Name, Name)> = AHashSet::new();
        let mut subscribed_channels: AHashSet<Name> = AHashSet::new();

        for spec in specs {
            let local = is_local(spec);
            for port in &spec.ports {
                if !Self::well_formed(pool, spec, port) {
                    stats.skipped_ports += 1;
                    continue;
                }

                if local {
                    stats.local_ports += 1;
                    if let Some(produces) = port.produces_event.as_ref()
                        && !consumed_anywhere.contains(produces.as_str())
                    {
                        // nobody consumes this event; hand it to the uplink
                        stats.unhandled_ports += 1;
                        let broker = broker.clone();
                        broker.clone().on(produces.clone(), move |event| {
                            broker.notify(events::TO_MAIN, event);
                            Ok(())
                        });
                    }
                    continue;
                }

                stats.remote_ports += 1;

                // remote port consuming something we produce: publish side
                if let Some(consumes) = port.consumes_event.as_ref()
                    && local_produced.contains(consumes.as_str())
                    && publish_wired.insert((spec.model_name.clone(), consumes.clone()))
                {
                    stats.publish_ports += 1;
                    let channel = hub.channel(&spec.model_name);
                    broker.on(consumes.clone(), move |event| {
                        // explicit round trip: no shared references cross
                        // the pool boundary
                        channel.post(deep_copy(event)?);
                        Ok(())
                    });
                }

                // remote port producing something we consume: subscribe side
                if let Some(produces) = port.produces_event.as_ref()
                    && local_consumed.contains(produces.as_str())
                    && subscribed_channels.insert(spec.model_name.clone())
                {
                    stats.subscribe_ports += 1;
                    listen_channel(hub, &spec.model_name, broker, cancel);
                }
            }
        }

        // the pool's own channel is always open so siblings can deliver here
        if subscribed_channels.insert(pool.clone()) {
            listen_channel(hub, pool, broker, cancel);
        }
        let publish_models: AHashSet<&Name> =
            publish_wired.iter().map(|(model, _)| model).collect();
        stats.channels = subscribed_channels.len()
            + publish_models
                .iter()
                .filter(|model| !subscribed_channels.contains(model.as_str()))
                .count();

        tracing::info!(
            "[{}] router wired: {} local, {} remote ({} publish, {} subscribe), {} unhandled, {} skipped",
            pool,
            stats.local_ports,
            stats.remote_ports,
            stats.publish_ports,
            stats.subscribe_ports,
            stats.unhandled_ports,
            stats.skipped_ports,
        );

        Self {
            pool: pool.clone(),
            stats,
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn pool(&self) -> &Name {
        &self.pool
    }

    fn well_formed(pool: &Name, spec: &ModelSpec, port: &PortSpec) -> bool {
        let ok = match port.kind {
            PortKind::Inbound => port.consumes_event.is_some(),
            PortKind::Outbound => port.produces_event.is_some(),
        };
        if !ok {
            tracing::warn!(
                "[{}] skipping port '{}' of model '{}': no event for its direction",
                pool,
                port.service,
                spec.model_name,
            );
        }
        ok
    }
}

/// Forward every frame of a named channel into a pool broker on a
/// dedicated, cancellable listener thread.
pub(crate) fn listen_channel(
    hub: &Arc<BroadcastHub>,
    name: &Name,
    broker: &Arc<Broker>,
    cancel: &CancelToken,
) {
    let mut rx = hub.channel(name).subscribe();
    let broker = broker.clone();
    let cancel = cancel.new_child();
    let thread_name = format!("chan-{}", name.as_str().to_lowercase());

    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
        while let Some(frame) = rx.next(&cancel) {
            handle_channel_event(&broker, frame);
        }
    });

    if let Err(err) = spawned {
        tracing::error!("[{}] failed to spawn channel listener: {}", name, err);
    }
}

/// Deliver one broadcast frame into a pool broker. Frames lacking an
/// `eventName` are re-published under the sentinel event.
pub(crate) fn handle_channel_event(broker: &Broker, frame: Value) {
    match frame
        .get(events::EVENT_NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
    {
        Some(name) => broker.notify(&name, &frame),
        None => broker.notify(events::MISSING_EVENT_NAME, &frame),
    }
}

/// Serialize-then-parse clone. Guarantees no shared mutable references
/// between pools and drops anything that cannot cross a JSON boundary.
pub(crate) fn deep_copy(event: &Value) -> anyhow::Result<Value> {
    let raw = serde_json::to_string(event)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelSpec, PortSpec};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn wait_until(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn order_and_billing() -> Vec<ModelSpec> {
        vec![
            ModelSpec::new("ORDER").with_port(PortSpec::outbound("notifyBilling", "orderCreated")),
            ModelSpec::new("BILLING")
                .with_port(PortSpec::inbound("onOrderCreated", "orderCreated")),
        ]
    }

    #[test]
    fn classifies_publish_and_subscribe_sides() {
        let specs = order_and_billing();
        let hub = BroadcastHub::new_arc();
        let cancel = CancelToken::new_root();

        let order_broker = Broker::new_arc();
        let order = PortEventRouter::wire(
            &Name::new("ORDER"),
            &specs,
            &order_broker,
            &hub,
            &cancel,
        );
        assert_eq!(order.stats().local_ports, 1);
        assert_eq!(order.stats().publish_ports, 1);
        assert_eq!(order.stats().subscribe_ports, 0);
        assert_eq!(order.stats().unhandled_ports, 0);

        let billing_broker = Broker::new_arc();
        let billing = PortEventRouter::wire(
            &Name::new("BILLING"),
            &specs,
            &billing_broker,
            &hub,
            &cancel,
        );
        assert_eq!(billing.stats().remote_ports, 1);
        assert_eq!(billing.stats().publish_ports, 0);
        // BILLING consumes orderCreated which ORDER produces
        assert_eq!(billing.stats().subscribe_ports, 1);

        cancel.cancel();
    }

    #[test]
    fn event_crosses_pools_as_deep_copy() {
        let specs = order_and_billing();
        let hub = BroadcastHub::new_arc();
        let cancel = CancelToken::new_root();

        let order_broker = Broker::new_arc();
        let billing_broker = Broker::new_arc();
        let _order = PortEventRouter::wire(
            &Name::new("ORDER"),
            &specs,
            &order_broker,
            &hub,
            &cancel,
        );
        let _billing = PortEventRouter::wire(
            &Name::new("BILLING"),
            &specs,
            &billing_broker,
            &hub,
            &cancel,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            billing_broker.on("orderCreated", move |event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }

        let original = json!({"eventName": "orderCreated", "orderId": 42});
        order_broker.notify("orderCreated", &original);

        assert!(wait_until(|| !seen.lock().is_empty()));
        let mut received = seen.lock().first().cloned().unwrap();
        assert_eq!(received, original);

        // mutating the received copy cannot touch the producer's object
        received["orderId"] = json!(7);
        assert_eq!(original["orderId"], json!(42));

        cancel.cancel();
    }

    #[test]
    fn frame_without_event_name_hits_sentinel() {
        let broker = Broker::new();
        let seen = Arc::new(Mutex::new(0u32));
        {
            let seen = seen.clone();
            broker.on(events::MISSING_EVENT_NAME, move |_| {
                *seen.lock() += 1;
                Ok(())
            });
        }

        handle_channel_event(&broker, json!({"payload": 1}));
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn unconsumed_producer_falls_through_to_main() {
        let specs = vec![
            ModelSpec::new("ORDER").with_port(PortSpec::outbound("audit", "orphanEvent")),
        ];
        let hub = BroadcastHub::new_arc();
        let cancel = CancelToken::new_root();
        let broker = Broker::new_arc();

        let router =
            PortEventRouter::wire(&Name::new("ORDER"), &specs, &broker, &hub, &cancel);
        assert_eq!(router.stats().unhandled_ports, 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            broker.on(events::TO_MAIN, move |event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }

        broker.notify("orphanEvent", &json!({"eventName": "orphanEvent"}));
        assert_eq!(seen.lock().len(), 1);

        cancel.cancel();
    }

    #[test]
    fn malformed_port_is_skipped() {
        let mut spec = ModelSpec::new("ORDER");
        spec.ports.push(PortSpec {
            service: "broken".into(),
            kind: PortKind::Outbound,
            consumes_event: None,
            produces_event: None,
            callback: None,
            undo: None,
        });

        let hub = BroadcastHub::new_arc();
        let cancel = CancelToken::new_root();
        let broker = Broker::new_arc();
        let router =
            PortEventRouter::wire(&Name::new("ORDER"), &[spec], &broker, &hub, &cancel);
        assert_eq!(router.stats().skipped_ports, 1);
        assert_eq!(router.stats().local_ports, 0);

        cancel.cancel();
    }
}
