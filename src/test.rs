#[cfg(test)]
mod tests {
    use crate::broker::{Broker, events};
    use crate::config::{PoolOptions, RuntimeConfig};
    use crate::error::{JobError, PoolError};
    use crate::mesh::{MeshConfig, MeshUplink};
    use crate::model::{HandlerFactory, JobHandler, ModelSpec, PortSpec, WorkerContext};
    use crate::pool::{PoolHandle, PoolState, PoolStatus, ThreadState, epoch_micros, spawn_pool};
    use crate::registry::PoolRegistry;
    use crate::utils::{CancelToken, Name, StateCell};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(check: impl Fn() -> bool, secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn echo_handler() -> Box<dyn JobHandler> {
        Box::new(|_job: &str, data: Value| -> anyhow::Result<Value> {
            let mut reply = data.as_object().cloned().unwrap_or_default();
            reply.insert("ok".into(), json!(true));
            Ok(Value::Object(reply))
        })
    }

    fn echo_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|_ctx: &WorkerContext| -> anyhow::Result<Box<dyn JobHandler>> {
            Ok(echo_handler())
        })
    }

    fn sleepy_factory(block: Duration) -> Arc<dyn HandlerFactory> {
        Arc::new(
            move |_ctx: &WorkerContext| -> anyhow::Result<Box<dyn JobHandler>> {
                Ok(Box::new(move |_job: &str, data: Value| -> anyhow::Result<Value> {
                    thread::sleep(block);
                    let mut reply = data.as_object().cloned().unwrap_or_default();
                    reply.insert("ok".into(), json!(true));
                    Ok(Value::Object(reply))
                }))
            },
        )
    }

    fn spawn_test_pool(
        name: &str,
        opts: PoolOptions,
        factory: Arc<dyn HandlerFactory>,
    ) -> (PoolHandle, CancelToken) {
        let name = Name::new(name);
        let broker = Broker::new_arc();
        let status = StateCell::new_arc(PoolStatus::initial(name.clone(), &opts));
        let cancel = CancelToken::new_root();
        let (handle, _join) = spawn_pool(name, opts, factory, broker, status, cancel.clone())
            .expect("pool spawn failed");
        (handle, cancel)
    }

    fn opts(min: usize, max: usize, tolerance: u8) -> PoolOptions {
        PoolOptions {
            min,
            max,
            queue_tolerance: tolerance,
            ..PoolOptions::default()
        }
    }

    fn assert_pool_invariants(status: &PoolStatus) {
        assert!(status.free_threads <= status.total_threads);
        assert!(status.total_threads <= status.max);
        assert!(status.queue_rate <= 100);
        assert!(status.jobs_queued <= status.jobs_requested);
    }

    // ---- dispatch ----

    #[test]
    fn simple_dispatch_returns_worker_reply() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), echo_factory());

        let result = pool.submit("addItem", json!({"id": 1})).wait();
        assert_eq!(result.unwrap(), json!({"ok": true, "id": 1}));

        assert!(wait_for(
            || {
                let s = pool.status();
                s.jobs_completed == 1 && s.free_threads == 1
            },
            5
        ));

        let status = pool.status();
        assert_pool_invariants(&status);
        assert_eq!(status.jobs_requested, 1);
        assert_eq!(status.jobs_queued, 0);
        assert_eq!(status.total_threads, 1);

        cancel.cancel();
    }

    #[test]
    fn overload_grows_pool_to_max() {
        let (pool, cancel) =
            spawn_test_pool("ORDER", opts(1, 2, 25), sleepy_factory(Duration::from_millis(50)));

        let tickets: Vec<_> = (0..4)
            .map(|i| pool.submit("addItem", json!({"id": i})))
            .collect();

        for (i, ticket) in tickets.into_iter().enumerate() {
            let reply = ticket.wait().unwrap();
            assert_eq!(reply["id"], json!(i));
        }

        assert!(wait_for(|| pool.status().jobs_completed == 4, 5));
        let status = pool.status();
        assert_pool_invariants(&status);
        // the second submission pushed the queue rate over tolerance
        assert_eq!(status.total_threads, 2);
        assert!(status.jobs_queued >= 1);

        cancel.cancel();
    }

    #[test]
    fn rate_at_tolerance_does_not_grow() {
        // tolerance 100 can never be exceeded, so the pool must stay at one
        // thread no matter how hard it queues
        let (pool, cancel) =
            spawn_test_pool("ORDER", opts(1, 2, 100), sleepy_factory(Duration::from_millis(20)));

        let tickets: Vec<_> = (0..5)
            .map(|i| pool.submit("addItem", json!({"id": i})))
            .collect();
        for ticket in tickets {
            ticket.wait().unwrap();
        }

        let status = pool.status();
        assert_pool_invariants(&status);
        assert_eq!(status.total_threads, 1);

        cancel.cancel();
    }

    #[test]
    fn job_failure_leaves_pool_healthy() {
        let factory: Arc<dyn HandlerFactory> = Arc::new(
            |_ctx: &WorkerContext| -> anyhow::Result<Box<dyn JobHandler>> {
                Ok(Box::new(|job: &str, data: Value| -> anyhow::Result<Value> {
                    match job {
                        "explode" => anyhow::bail!("deliberate failure"),
                        "panic" => panic!("deliberate panic"),
                        _ => Ok(data),
                    }
                }))
            },
        );
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), factory);

        match pool.submit("explode", json!({})).wait() {
            Err(JobError::Failed(msg)) => assert!(msg.contains("deliberate failure")),
            other => panic!("expected job failure, got {other:?}"),
        }

        match pool.submit("panic", json!({})).wait() {
            Err(JobError::Failed(_)) => {}
            other => panic!("expected panic to surface as failure, got {other:?}"),
        }

        // the worker survived both
        let reply = pool.submit("echo", json!({"still": "alive"})).wait();
        assert_eq!(reply.unwrap(), json!({"still": "alive"}));
        assert_eq!(pool.status().total_threads, 1);

        cancel.cancel();
    }

    // ---- lifecycle ----

    #[test]
    fn drain_requires_closed_pool() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), echo_factory());
        assert_eq!(pool.drain(), Err(PoolError::DrainingNotClosed));
        cancel.cancel();
    }

    #[test]
    fn stop_requires_drained_pool() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), echo_factory());
        pool.close().unwrap();
        assert_eq!(pool.stop_threads(), Err(PoolError::NotDrained));
        cancel.cancel();
    }

    #[test]
    fn start_rejects_while_threads_alive() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), echo_factory());
        assert_eq!(pool.start_threads(), Err(PoolError::ThreadsAlive));
        cancel.cancel();
    }

    #[test]
    fn close_and_open_are_idempotent() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(1, 2, 25), echo_factory());

        pool.close().unwrap();
        pool.close().unwrap();
        assert!(wait_for(|| pool.status().state == PoolState::Closed, 2));

        pool.open().unwrap();
        pool.open().unwrap();
        assert!(wait_for(|| pool.status().open, 2));

        cancel.cancel();
    }

    #[test]
    fn drain_resolves_after_inflight_jobs() {
        let (pool, cancel) =
            spawn_test_pool("ORDER", opts(1, 2, 25), sleepy_factory(Duration::from_millis(150)));

        let mut tickets: Vec<_> = (0..3)
            .map(|i| pool.submit("addItem", json!({"id": i})))
            .collect();

        pool.close().unwrap();
        pool.drain().unwrap();

        // every result was delivered before drain resolved
        for ticket in tickets.iter_mut() {
            assert!(ticket.wait_timeout(Duration::from_millis(50)).is_some());
        }
        assert!(wait_for(
            || {
                let s = pool.status();
                s.jobs_completed == 3 && s.state == PoolState::Drained
            },
            2
        ));

        // a submit on the closed pool enqueues instead of running
        let _queued = pool.submit("addItem", json!({"id": 99}));
        assert!(wait_for(|| pool.status().waiting_jobs == 1, 2));

        cancel.cancel();
    }

    #[test]
    fn full_stop_start_cycle() {
        let (pool, cancel) = spawn_test_pool("ORDER", opts(2, 3, 25), echo_factory());

        pool.close().unwrap();
        pool.drain().unwrap();
        pool.stop_threads().unwrap();
        assert!(wait_for(
            || {
                let s = pool.status();
                s.total_threads == 0 && s.state == PoolState::Stopped
            },
            5
        ));

        // open with no threads must be refused
        assert_eq!(pool.open(), Err(PoolError::NoThreads));

        pool.start_threads().unwrap();
        assert!(wait_for(
            || {
                let s = pool.status();
                s.total_threads == 2 && s.state == PoolState::Drained
            },
            5
        ));

        pool.open().unwrap();
        let reply = pool.submit("echo", json!({"id": 5})).wait();
        assert_eq!(reply.unwrap(), json!({"ok": true, "id": 5}));

        cancel.cancel();
    }

    #[test]
    fn reload_preserves_inflight_job_and_renews_threads() {
        let (pool, cancel) =
            spawn_test_pool("ORDER", opts(1, 2, 25), sleepy_factory(Duration::from_millis(200)));

        let ticket = pool.submit("addItem", json!({"id": 7}));
        assert!(wait_for(|| pool.status().jobs_requested == 1, 2));

        thread::sleep(Duration::from_millis(2));
        let reload_started = epoch_micros();
        pool.reload().unwrap();

        // the in-flight job survived the swap
        assert_eq!(ticket.wait().unwrap(), json!({"ok": true, "id": 7}));

        assert!(wait_for(|| pool.status().reloads == 1, 5));
        let status = pool.status();
        assert_eq!(status.reloads, 1);
        assert_eq!(status.deploys, 1);
        assert!(status.open);
        assert_eq!(status.total_threads, 1);
        for info in &status.threads {
            assert!(info.created_at_us > reload_started);
        }

        // pool still serves traffic afterwards
        let reply = pool.submit("addItem", json!({"id": 8})).wait();
        assert_eq!(reply.unwrap(), json!({"ok": true, "id": 8}));

        cancel.cancel();
    }

    #[test]
    fn reject_mode_fails_fast_while_closed() {
        let options = PoolOptions {
            queue_while_closed: false,
            ..opts(1, 2, 25)
        };
        let (pool, cancel) = spawn_test_pool("ORDER", options, echo_factory());

        pool.close().unwrap();
        match pool.submit("addItem", json!({})).wait() {
            Err(JobError::PoolClosed) => {}
            other => panic!("expected pool-closed, got {other:?}"),
        }

        cancel.cancel();
    }

    #[test]
    fn admitted_but_unresolved_matches_ledger() {
        let (pool, cancel) =
            spawn_test_pool("ORDER", opts(1, 2, 25), sleepy_factory(Duration::from_millis(80)));

        let tickets: Vec<_> = (0..3)
            .map(|i| pool.submit("addItem", json!({"id": i})))
            .collect();

        assert!(wait_for(
            || {
                let s = pool.status();
                s.jobs_requested == 3
                    && s.threads.iter().all(|t| t.state != ThreadState::Starting)
            },
            2
        ));
        let status = pool.status();
        if status
            .threads
            .iter()
            .all(|t| t.state != ThreadState::Starting)
        {
            let unresolved = status.jobs_requested - status.jobs_completed;
            let ledger =
                (status.total_threads - status.free_threads) as u64 + status.waiting_jobs as u64;
            assert_eq!(unresolved, ledger);
        }
        assert_pool_invariants(&status);

        for ticket in tickets {
            ticket.wait().unwrap();
        }
        cancel.cancel();
    }

    #[test]
    fn no_jobs_running_fires_when_pool_quiesces() {
        let name = Name::new("ORDER");
        let options = opts(1, 2, 25);
        let broker = Broker::new_arc();
        let status = StateCell::new_arc(PoolStatus::initial(name.clone(), &options));
        let cancel = CancelToken::new_root();

        let fired = Arc::new(Mutex::new(0u32));
        {
            let fired = fired.clone();
            broker.on(events::NO_JOBS_RUNNING, move |_| {
                *fired.lock() += 1;
                Ok(())
            });
        }

        let (pool, _join) = spawn_pool(name, options, echo_factory(), broker, status, cancel.clone())
            .expect("pool spawn failed");

        pool.submit("echo", json!({})).wait().unwrap();
        assert!(wait_for(|| *fired.lock() >= 1, 2));

        cancel.cancel();
    }

    // ---- registry ----

    #[test]
    fn lazy_entry_spawns_pool_on_first_submit() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        let pool = registry.register(ModelSpec::new("Order"), opts(1, 2, 25), echo_factory());

        // façade answers status before any pool exists
        assert_eq!(pool.status().total_threads, 0);
        assert!(registry.pool_handle("order").is_none());

        let reply = pool.submit("addItem", json!({"id": 1})).wait();
        assert_eq!(reply.unwrap(), json!({"ok": true, "id": 1}));
        assert!(registry.pool_handle("ORDER").is_some());
        assert!(pool.status().total_threads >= 1);

        registry.shutdown();
    }

    #[test]
    fn preload_spawns_pool_at_registration() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        let options = PoolOptions {
            preload: true,
            ..opts(2, 3, 25)
        };
        let pool = registry.register(ModelSpec::new("Order"), options, echo_factory());

        assert!(registry.pool_handle("order").is_some());
        assert!(wait_for(|| pool.status().total_threads == 2, 5));

        registry.shutdown();
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        registry.register(ModelSpec::new("Order"), opts(1, 2, 25), echo_factory());

        assert!(registry.get("order").is_some());
        assert!(registry.get("ORDER").is_some());
        assert!(registry.get("billing").is_none());

        registry.shutdown();
    }

    #[test]
    fn destroyed_pool_surfaces_to_submitters() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        let pool = registry.register(ModelSpec::new("Order"), opts(1, 2, 25), echo_factory());
        pool.submit("warmup", json!({})).wait().unwrap();

        registry.destroy("ORDER").unwrap();
        assert!(registry.get("ORDER").is_none());

        // the stale façade keeps answering, with the destroy error
        match pool.submit("addItem", json!({})).wait() {
            Err(JobError::PoolDestroyed) => {}
            other => panic!("expected pool-destroyed, got {other:?}"),
        }

        registry.shutdown();
    }

    #[test]
    fn reload_all_bumps_counters_and_sweeps_undeployed() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        let order = registry.register(ModelSpec::new("Order"), opts(1, 2, 25), echo_factory());
        let billing = registry.register(ModelSpec::new("Billing"), opts(1, 2, 25), echo_factory());

        order.submit("warmup", json!({})).wait().unwrap();
        billing.submit("warmup", json!({})).wait().unwrap();

        registry.deregister("Billing");
        let results = registry.reload_all();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, res)| res.is_ok()));

        assert!(wait_for(
            || registry.get("ORDER").is_some_and(|p| p.status().reloads == 1),
            2
        ));
        // billing's model is gone, so reload-all destroyed its pool
        assert!(registry.get("BILLING").is_none());

        registry.shutdown();
    }

    #[test]
    fn listen_star_attaches_to_every_pool() {
        let registry = PoolRegistry::new(RuntimeConfig::default());
        let order = registry.register(ModelSpec::new("Order"), opts(1, 2, 25), echo_factory());
        let billing = registry.register(ModelSpec::new("Billing"), opts(1, 2, 25), echo_factory());

        let fired = Arc::new(Mutex::new(0u32));
        {
            let fired = fired.clone();
            registry.listen("*", events::NO_JOBS_RUNNING, move |_| {
                *fired.lock() += 1;
                Ok(())
            });
        }

        order.submit("a", json!({})).wait().unwrap();
        billing.submit("b", json!({})).wait().unwrap();
        assert!(wait_for(|| *fired.lock() >= 2, 5));

        registry.shutdown();
    }

    #[test]
    fn port_event_crosses_sibling_pools() {
        let registry = PoolRegistry::new(RuntimeConfig::default());

        let order_spec =
            ModelSpec::new("Order").with_port(PortSpec::outbound("notifyBilling", "orderCreated"));
        let billing_spec = ModelSpec::new("Billing")
            .with_port(PortSpec::inbound("onOrderCreated", "orderCreated"));

        let order = registry.register(order_spec, opts(1, 2, 25), echo_factory());
        let billing = registry.register(billing_spec, opts(1, 2, 25), echo_factory());

        // spawn both pools so their routers are wired
        order.submit("warmup", json!({})).wait().unwrap();
        billing.submit("warmup", json!({})).wait().unwrap();

        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        {
            let seen = seen.clone();
            registry.listen("billing", "orderCreated", move |event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }

        let original = json!({"eventName": "orderCreated", "orderId": 42});
        registry
            .pool_handle("ORDER")
            .unwrap()
            .broker()
            .notify("orderCreated", &original);

        assert!(wait_for(|| !seen.lock().is_empty(), 5));
        let received = seen.lock().first().cloned().unwrap();
        assert_eq!(received, original);

        registry.shutdown();
    }

    // ---- mesh ----

    fn local_mesh_server() -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let frames = Arc::new(Mutex::new(Vec::new()));

        let sink = frames.clone();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let mut ws = match tungstenite::accept(stream) {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Ok(msg) = ws.read() {
                    if let tungstenite::Message::Text(text) = msg {
                        sink.lock().push(text);
                    }
                }
            }
        });

        (port, frames)
    }

    #[test]
    fn uplink_handshakes_and_publishes() {
        let (port, frames) = local_mesh_server();
        let observer = Broker::new_arc();
        let cancel = CancelToken::new_root();

        let up = Arc::new(Mutex::new(false));
        {
            let up = up.clone();
            observer.on(events::UPLINK_UP, move |_| {
                *up.lock() = true;
                Ok(())
            });
        }

        let uplink = MeshUplink::start(
            MeshConfig::new("127.0.0.1", port),
            observer,
            cancel.clone(),
        );
        uplink.publish_event(json!({"eventName": "orphanEvent", "id": 1}));

        assert!(wait_for(
            || {
                let frames = frames.lock();
                frames.iter().any(|f| f.contains("webswitch"))
                    && frames.iter().any(|f| f.contains("orphanEvent"))
            },
            5
        ));
        assert!(*up.lock());
        assert!(uplink.is_up());

        cancel.cancel();
    }

    #[test]
    fn unconsumed_event_falls_back_to_mesh() {
        let (port, frames) = local_mesh_server();

        let config = RuntimeConfig {
            webswitch_enabled: true,
            webswitch_server: "127.0.0.1".into(),
            webswitch_port: port,
            ..RuntimeConfig::default()
        };
        let registry = PoolRegistry::new(config);

        let spec = ModelSpec::new("Order").with_port(PortSpec::outbound("audit", "orphanEvent"));
        let pool = registry.register(spec, opts(1, 2, 25), echo_factory());
        pool.submit("warmup", json!({})).wait().unwrap();

        registry
            .pool_handle("ORDER")
            .unwrap()
            .broker()
            .notify("orphanEvent", &json!({"eventName": "orphanEvent", "id": 9}));

        // one publish interval is enough for the lazy connect plus the frame
        assert!(wait_for(
            || {
                frames
                    .lock()
                    .iter()
                    .any(|f| f.contains("\"eventName\":\"orphanEvent\""))
            },
            5
        ));

        registry.shutdown();
    }
}
