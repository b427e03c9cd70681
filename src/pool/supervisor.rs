use crate::broker::{Broker, events};
use crate::config::PoolOptions;
use crate::error::{JobError, PoolError};
use crate::io::inbox::{Inbox, InboxTx, Poll, inbox};
use crate::io::oneshot::OneshotTx;
use crate::io::ring::JobRing;
use crate::model::{HandlerFactory, WorkerContext};
use crate::pool::handle::{AckTx, PoolHandle, PoolInput};
use crate::pool::metrics::{PoolCounters, PoolState, PoolStatus, ThreadInfo};
use crate::pool::thread::{ThreadHandle, ThreadState};
use crate::pool::{
    DRAIN_TIMEOUT, READY_TIMEOUT, SHUTDOWN_GRACE, STOP_REMOVE_DELAY, SWEEP_INTERVAL, epoch_micros,
};
use crate::utils::{CancelToken, HealthFlag, Name, StateCell};
use crate::worker::{JobResult, WorkerEvent, WorkerId, WorkerMsg, spawn_worker};
use ahash::{AHashMap, AHashSet};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::hint::spin_loop;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Depth of a worker's job lane. The supervisor posts at most one job at a
/// time per thread, plus the final shutdown message.
const JOB_RING_CAPACITY: usize = 4;

/// Max control inputs handled per loop iteration.
const MAX_CONTROL_DRAIN: usize = 64;

enum Flow {
    Continue,
    Exit,
}

struct PendingJob {
    name: Name,
    data: Value,
    completion: OneshotTx<JobResult>,
}

/// Spawn a pool supervisor thread and hand back its public façade.
///
/// The supervisor owns every piece of pool state; the rest of the process
/// reaches it only through the control inbox and the status cell.
pub fn spawn_pool(
    name: Name,
    opts: PoolOptions,
    factory: Arc<dyn HandlerFactory>,
    broker: Arc<Broker>,
    status: Arc<StateCell<PoolStatus>>,
    cancel: CancelToken,
) -> std::io::Result<(PoolHandle, thread::JoinHandle<()>)> {
    let (control_tx, control_rx) = inbox::<PoolInput>();
    let (worker_tx, worker_rx) = inbox::<WorkerEvent>();

    let handle = PoolHandle::new(name.clone(), control_tx, status.clone(), broker.clone());

    let supervisor = PoolSupervisor {
        name: name.clone(),
        opts,
        factory,
        broker,
        status,
        cancel,
        control_rx,
        worker_tx,
        worker_rx,
        state: PoolState::Open,
        threads: AHashMap::new(),
        free: Vec::new(),
        waiting: VecDeque::new(),
        in_flight: AHashMap::new(),
        counters: PoolCounters::default(),
        drain_waiters: Vec::new(),
        drain_deadline: None,
        deferred: VecDeque::new(),
        next_sweep: Instant::now() + SWEEP_INTERVAL,
        dirty: true,
    };

    let join = thread::Builder::new()
        .name(format!("pool-{}", name.as_str().to_lowercase()))
        .spawn(move || supervisor.run())?;

    Ok((handle, join))
}

struct PoolSupervisor {
    name: Name,
    opts: PoolOptions,
    factory: Arc<dyn HandlerFactory>,
    broker: Arc<Broker>,
    status: Arc<StateCell<PoolStatus>>,
    cancel: CancelToken,

    control_rx: Inbox<PoolInput>,
    worker_tx: InboxTx<WorkerEvent>,
    worker_rx: Inbox<WorkerEvent>,

    state: PoolState,
    threads: AHashMap<WorkerId, ThreadHandle>,
    free: Vec<WorkerId>,
    waiting: VecDeque<PendingJob>,
    in_flight: AHashMap<WorkerId, OneshotTx<JobResult>>,
    counters: PoolCounters,

    drain_waiters: Vec<AckTx>,
    drain_deadline: Option<Instant>,
    deferred: VecDeque<PoolInput>,
    next_sweep: Instant,
    dirty: bool,
}

impl PoolSupervisor {
    fn run(mut self) {
        if let Err(err) = self.start_threads_to_min() {
            tracing::error!("[{}] pool boot incomplete: {}", self.name, err);
        }
        self.emit(events::POOL_OPEN);
        self.publish_status();

        let mut idle: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.teardown(None);
                return;
            }

            let mut progressed = false;

            for _ in 0..MAX_CONTROL_DRAIN {
                match self.control_rx.poll() {
                    Poll::Item(input) => {
                        progressed = true;
                        if let Flow::Exit = self.handle_input(input) {
                            return;
                        }
                    }
                    Poll::Empty => break,
                    Poll::Closed => {
                        // every handle (and the registry entry) is gone
                        self.teardown(None);
                        return;
                    }
                }
            }

            while let Poll::Item(event) = self.worker_rx.poll() {
                progressed = true;
                self.handle_worker_event(event);
            }

            self.tick();

            if progressed {
                idle = 0;
            } else {
                idle = idle.saturating_add(1);
                if idle < 64 {
                    spin_loop();
                } else if idle < 256 {
                    thread::yield_now();
                } else {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    // ---- control plane ----

    fn handle_input(&mut self, input: PoolInput) -> Flow {
        match input {
            PoolInput::Submit {
                name,
                data,
                completion,
            } => {
                self.submit(name, data, completion);
                Flow::Continue
            }
            PoolInput::Close { ack } => {
                let res = self.do_close();
                ack.resolve(res);
                Flow::Continue
            }
            PoolInput::Open { ack } => {
                let res = self.do_open();
                ack.resolve(res);
                Flow::Continue
            }
            PoolInput::Drain { ack } => {
                self.begin_drain(ack);
                Flow::Continue
            }
            PoolInput::StopThreads { ack } => {
                let res = self.do_stop_threads();
                ack.resolve(res);
                Flow::Continue
            }
            PoolInput::StartThreads { ack } => {
                let res = self.do_start_threads();
                ack.resolve(res);
                Flow::Continue
            }
            PoolInput::Reload { ack } => {
                let res = self.do_reload();
                ack.resolve(res);
                // replay whatever arrived while the reload held the loop
                while let Some(next) = self.deferred.pop_front() {
                    if let Flow::Exit = self.handle_input(next) {
                        return Flow::Exit;
                    }
                }
                Flow::Continue
            }
            PoolInput::Destroy { ack } => {
                self.teardown(Some(ack));
                Flow::Exit
            }
        }
    }

    fn submit(&mut self, name: Name, data: Value, completion: OneshotTx<JobResult>) {
        self.counters.jobs_requested += 1;
        self.dirty = true;

        let job = PendingJob {
            name,
            data,
            completion,
        };

        if !self.state.is_open() {
            if self.opts.queue_while_closed {
                self.enqueue(job);
            } else {
                job.completion.resolve(Err(JobError::PoolClosed));
            }
            return;
        }

        match self.pop_free() {
            Some(id) => self.post_job(id, job),
            None => {
                // queue first so the growth check sees the rate this job
                // produced
                self.enqueue(job);
                self.maybe_grow();
            }
        }
    }

    fn enqueue(&mut self, job: PendingJob) {
        self.counters.jobs_queued += 1;
        self.waiting.push_back(job);
    }

    fn pop_free(&mut self) -> Option<WorkerId> {
        while let Some(id) = self.free.pop() {
            if self.threads.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn post_job(&mut self, id: WorkerId, job: PendingJob) {
        let Some(thread) = self.threads.get_mut(&id) else {
            self.waiting.push_front(job);
            return;
        };

        thread.state = ThreadState::Busy;
        let msg = WorkerMsg::Job {
            name: job.name,
            data: job.data,
        };

        match thread.job_tx.post(msg) {
            Ok(()) => {
                self.in_flight.insert(id, job.completion);
            }
            Err(msg) => {
                tracing::error!("[{}] worker {} rejected a job; removing it", self.name, id);
                if let WorkerMsg::Job { name, data } = msg {
                    self.waiting.push_front(PendingJob {
                        name,
                        data,
                        completion: job.completion,
                    });
                }
                self.fail_thread(id);
            }
        }
    }

    fn maybe_grow(&mut self) {
        let total = self.threads.len();
        let starve = total == 0;
        if total < self.opts.max
            && (starve || self.counters.queue_rate() > self.opts.queue_tolerance)
            && let Err(err) = self.start_thread()
        {
            tracing::error!("[{}] failed to grow pool: {}", self.name, err);
            // a starved pool has nothing else to run this job; fail it fast
            if starve && let Some(job) = self.waiting.pop_back() {
                self.counters.jobs_failed += 1;
                job.completion.resolve(Err(JobError::StartTimeout));
            }
        }
    }

    // ---- worker plane ----

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready(id) => {
                if let Some(thread) = self.threads.get_mut(&id)
                    && thread.state == ThreadState::Starting
                {
                    thread.state = ThreadState::Idle;
                    self.free.push(id);
                }
                self.handoff();
                self.dirty = true;
            }
            WorkerEvent::Reply(id, result) => {
                self.counters.jobs_completed += 1;
                if result.is_err() {
                    self.counters.jobs_failed += 1;
                }
                if let Some(completion) = self.in_flight.remove(&id) {
                    completion.resolve(result);
                }

                // hand the same thread the next queued job, else free it
                if let Some(job) = self.waiting.pop_front() {
                    self.post_job(id, job);
                } else if let Some(thread) = self.threads.get_mut(&id)
                    && thread.state == ThreadState::Busy
                {
                    thread.state = ThreadState::Idle;
                    self.free.push(id);
                }

                if self.no_jobs_running() {
                    self.emit(events::NO_JOBS_RUNNING);
                }
                self.check_drain();
                self.dirty = true;
            }
            WorkerEvent::Exited(id) => {
                if let Some(mut thread) = self.threads.remove(&id) {
                    tracing::error!("[{}] worker {} exited unexpectedly", self.name, id);
                    self.free.retain(|x| *x != id);
                    if let Some(completion) = self.in_flight.remove(&id) {
                        self.counters.jobs_failed += 1;
                        completion.resolve(Err(JobError::WorkerExited));
                    }
                    thread.state = ThreadState::Terminated;
                    if let Some(join) = thread.join.take() {
                        let _ = join.join();
                    }
                    self.check_drain();
                    self.dirty = true;
                }
                // unknown ids are late acks from leaked workers
            }
        }
    }

    // ---- lifecycle ----

    fn do_close(&mut self) -> Result<(), PoolError> {
        if self.state.is_open() {
            self.state = PoolState::Closed;
            self.emit(events::POOL_CLOSE);
            self.dirty = true;
        }
        Ok(())
    }

    fn do_open(&mut self) -> Result<(), PoolError> {
        if self.state.is_open() {
            return Ok(());
        }
        if self.threads.is_empty() {
            return Err(PoolError::NoThreads);
        }
        self.state = PoolState::Open;
        self.emit(events::POOL_OPEN);
        self.handoff();
        self.dirty = true;
        Ok(())
    }

    fn begin_drain(&mut self, ack: AckTx) {
        if self.state.is_open() {
            ack.resolve(Err(PoolError::DrainingNotClosed));
            return;
        }
        if self.no_jobs_running() {
            self.finish_drain();
            ack.resolve(Ok(()));
            return;
        }
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + DRAIN_TIMEOUT);
        }
        self.drain_waiters.push(ack);
    }

    fn finish_drain(&mut self) {
        if self.state == PoolState::Closed {
            self.state = PoolState::Drained;
        }
        self.drain_deadline = None;
        self.emit(events::POOL_DRAIN);
        self.dirty = true;
    }

    fn check_drain(&mut self) {
        if self.drain_waiters.is_empty() {
            return;
        }

        if self.no_jobs_running() {
            self.finish_drain();
            for ack in self.drain_waiters.drain(..) {
                ack.resolve(Ok(()));
            }
            return;
        }

        if let Some(deadline) = self.drain_deadline
            && Instant::now() >= deadline
        {
            tracing::warn!(
                "[{}] drain timed out with {} jobs still running; treating them as leaks",
                self.name,
                self.in_flight.len()
            );
            if self.state == PoolState::Closed {
                self.state = PoolState::Drained;
                self.emit(events::POOL_DRAIN);
            }
            self.drain_deadline = None;
            for ack in self.drain_waiters.drain(..) {
                ack.resolve(Err(PoolError::DrainTimeout));
            }
            self.dirty = true;
        }
    }

    fn do_stop_threads(&mut self) -> Result<(), PoolError> {
        if self.state != PoolState::Drained {
            return Err(PoolError::NotDrained);
        }

        // pull threads off the free stack before terminating any of them
        self.free.clear();
        for thread in self.threads.values_mut() {
            thread.state = ThreadState::Draining;
        }
        thread::sleep(STOP_REMOVE_DELAY);

        for thread in self.threads.values_mut() {
            let _ = thread.job_tx.post(WorkerMsg::Shutdown);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut pending: AHashSet<WorkerId> = self.threads.keys().copied().collect();

        while !pending.is_empty() {
            match self.worker_rx.next_before(&self.cancel, deadline) {
                Ok(WorkerEvent::Exited(id)) => {
                    pending.remove(&id);
                    if let Some(mut thread) = self.threads.remove(&id) {
                        thread.state = ThreadState::Terminated;
                        if let Some(join) = thread.join.take() {
                            let _ = join.join();
                        }
                    }
                }
                Ok(WorkerEvent::Reply(id, result)) => {
                    // a drain-timeout leak finishing late; resolve it
                    self.counters.jobs_completed += 1;
                    if result.is_err() {
                        self.counters.jobs_failed += 1;
                    }
                    if let Some(completion) = self.in_flight.remove(&id) {
                        completion.resolve(result);
                    }
                }
                Ok(WorkerEvent::Ready(_)) => {}
                Err(_) => break,
            }
        }

        for id in pending {
            if let Some(thread) = self.threads.remove(&id) {
                tracing::warn!(
                    "[{}] worker {} did not ack shutdown within grace; terminating",
                    self.name,
                    id
                );
                thread.cancel.cancel();
                // the join handle is dropped; the thread is detached
            }
        }

        for (_, completion) in self.in_flight.drain() {
            self.counters.jobs_failed += 1;
            completion.resolve(Err(JobError::WorkerExited));
        }

        self.state = PoolState::Stopped;
        self.dirty = true;
        Ok(())
    }

    fn do_start_threads(&mut self) -> Result<(), PoolError> {
        if !self.threads.is_empty() {
            return Err(PoolError::ThreadsAlive);
        }
        let res = self.start_threads_to_min();
        if res.is_ok() && self.state == PoolState::Stopped {
            // threads exist again, pool stays closed until open()
            self.state = PoolState::Drained;
        }
        self.dirty = true;
        res
    }

    fn do_reload(&mut self) -> Result<(), PoolError> {
        tracing::info!("[{}] reload requested", self.name);
        let _ = self.do_close();

        if let Err(err) = self.drain_blocking() {
            tracing::warn!("[{}] reload drain: {}; continuing", self.name, err);
        }
        self.do_stop_threads()?;
        self.do_start_threads()?;
        let _ = self.do_open();

        self.counters.reloads += 1;
        self.counters.deploys += 1;
        self.dirty = true;
        tracing::info!("[{}] reload complete", self.name);
        Ok(())
    }

    /// Drain while holding the supervisor loop: worker events keep flowing
    /// and submissions keep their queue-while-closed semantics, but other
    /// lifecycle inputs are deferred until the reload finishes.
    fn drain_blocking(&mut self) -> Result<(), PoolError> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        loop {
            while let Poll::Item(event) = self.worker_rx.poll() {
                self.handle_worker_event(event);
            }

            loop {
                match self.control_rx.poll() {
                    Poll::Item(PoolInput::Submit {
                        name,
                        data,
                        completion,
                    }) => self.submit(name, data, completion),
                    Poll::Item(other) => self.deferred.push_back(other),
                    _ => break,
                }
            }

            if self.no_jobs_running() {
                self.finish_drain();
                return Ok(());
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "[{}] reload drain timed out with {} jobs still running",
                    self.name,
                    self.in_flight.len()
                );
                if self.state == PoolState::Closed {
                    self.state = PoolState::Drained;
                    self.emit(events::POOL_DRAIN);
                }
                return Err(PoolError::DrainTimeout);
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    fn teardown(&mut self, ack: Option<AckTx>) {
        for job in self.waiting.drain(..) {
            job.completion.resolve(Err(JobError::PoolDestroyed));
        }
        for (_, completion) in self.in_flight.drain() {
            completion.resolve(Err(JobError::PoolDestroyed));
        }
        for thread in self.threads.values_mut() {
            let _ = thread.job_tx.post(WorkerMsg::Shutdown);
            thread.cancel.cancel();
        }
        self.free.clear();
        self.state = PoolState::Stopped;
        self.threads.clear();
        self.publish_status();

        for waiter in self.drain_waiters.drain(..) {
            waiter.resolve(Err(PoolError::Destroyed));
        }
        if let Some(ack) = ack {
            ack.resolve(Ok(()));
        }
        tracing::info!("[{}] pool destroyed", self.name);
    }

    // ---- threads ----

    fn start_thread(&mut self) -> anyhow::Result<WorkerId> {
        let id = WorkerId::new();
        let (job_tx, job_rx) = JobRing::new(JOB_RING_CAPACITY);
        let health = HealthFlag::new(false);
        let cancel = self.cancel.new_child();
        let ctx = WorkerContext {
            model_name: self.name.clone(),
            worker_data: self.opts.worker_data.clone(),
            file: self.opts.file.clone(),
        };

        let join = spawn_worker(
            id,
            format!("{}-worker-{}", self.name.as_str().to_lowercase(), id),
            self.factory.clone(),
            ctx,
            job_rx,
            self.worker_tx.clone(),
            cancel.clone(),
            health.clone(),
        )?;

        self.threads.insert(
            id,
            ThreadHandle {
                id,
                created_at_us: epoch_micros(),
                state: ThreadState::Starting,
                job_tx,
                join: Some(join),
                health,
                cancel,
            },
        );
        self.dirty = true;
        Ok(id)
    }

    /// Spawn up to `min` workers and block on their ready handshakes.
    fn start_threads_to_min(&mut self) -> Result<(), PoolError> {
        let target = self.opts.min.max(1);

        while self.threads.len() < target {
            if let Err(err) = self.start_thread() {
                tracing::error!("[{}] failed to spawn worker: {}", self.name, err);
                break;
            }
        }

        let deadline = Instant::now() + READY_TIMEOUT;
        while self
            .threads
            .values()
            .any(|t| t.state == ThreadState::Starting)
        {
            match self.worker_rx.next_before(&self.cancel, deadline) {
                Ok(event) => self.handle_worker_event(event),
                Err(_) => break,
            }
        }

        let ready = self
            .threads
            .values()
            .filter(|t| t.state != ThreadState::Starting)
            .count();
        if ready < target {
            return Err(PoolError::StartTimeout);
        }
        Ok(())
    }

    fn fail_thread(&mut self, id: WorkerId) {
        if let Some(thread) = self.threads.remove(&id) {
            self.free.retain(|x| *x != id);
            thread.cancel.cancel();
            if let Some(completion) = self.in_flight.remove(&id) {
                self.counters.jobs_failed += 1;
                completion.resolve(Err(JobError::WorkerExited));
            }
        }
        self.dirty = true;
    }

    // ---- periodic duties ----

    fn tick(&mut self) {
        let now = Instant::now();
        if now >= self.next_sweep {
            self.next_sweep = now + SWEEP_INTERVAL;
            self.handoff();
        }
        self.check_drain();
        if self.dirty {
            self.publish_status();
            self.dirty = false;
        }
    }

    /// Pair free threads with waiting jobs. Recovers from the race where a
    /// worker replied before the supervisor registered a continuation;
    /// consumes at most `min(|free|, |waiting|)` pairs, so it is idempotent.
    fn handoff(&mut self) {
        while !self.waiting.is_empty() {
            let Some(id) = self.pop_free() else {
                break;
            };
            match self.waiting.pop_front() {
                Some(job) => {
                    self.post_job(id, job);
                    self.dirty = true;
                }
                None => {
                    self.free.push(id);
                    break;
                }
            }
        }
    }

    fn no_jobs_running(&self) -> bool {
        self.threads.len() == self.free.len()
    }

    fn emit(&self, event: &str) {
        let payload = json!({
            (events::EVENT_NAME_FIELD): event,
            "modelName": self.name.as_str(),
        });
        self.broker.notify(event, &payload);
    }

    fn publish_status(&mut self) {
        let mut threads: Vec<ThreadInfo> = self
            .threads
            .values()
            .map(|t| ThreadInfo {
                id: t.id.to_string(),
                created_at_us: t.created_at_us,
                state: t.state,
                healthy: t.health.is_up(),
            })
            .collect();
        threads.sort_by(|a, b| a.created_at_us.cmp(&b.created_at_us));

        self.status.publish(PoolStatus {
            name: self.name.clone(),
            state: self.state,
            open: self.state.is_open(),
            total_threads: self.threads.len(),
            free_threads: self.free.len(),
            waiting_jobs: self.waiting.len(),
            jobs_requested: self.counters.jobs_requested,
            jobs_queued: self.counters.jobs_queued,
            jobs_completed: self.counters.jobs_completed,
            jobs_failed: self.counters.jobs_failed,
            queue_rate: self.counters.queue_rate(),
            queue_tolerance: self.opts.queue_tolerance,
            min: self.opts.min,
            max: self.opts.max,
            reloads: self.counters.reloads,
            deploys: self.counters.deploys,
            threads,
        });
    }
}
