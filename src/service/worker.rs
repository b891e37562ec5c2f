//! # Connection Worker
//!
//! One OS thread running many connection tasks cooperatively.
//!
//! A worker owns a current-thread tokio runtime (the readiness multiplexer) and
//! a private registry of running connections. Other threads talk to it through
//! two queues: callbacks ([`ConnectionWorker::execute`]) and connection
//! admissions ([`ConnectionManager::add_connection`]). Both wake the loop.
//!
//! ## Loop
//! - run queued callbacks
//! - admit queued connections: spawn the task plus an optional deadline watchdog
//! - when idle, sleep on the runtime for at most `max_sleep`
//!
//! ## Shutdown
//! New admissions are refused from the moment shutdown begins; anything queued
//! before that is still admitted. Every connection is asked to close, then the
//! worker keeps servicing callbacks for up to `shutdown_grace`. Stragglers are
//! cancelled, given a short grace to tear down, and finally dropped. The
//! registry is empty when `run` returns.
//!
//! Cancellation is cooperative: a connection body observes it at its own
//! suspension points through [`Connection::cancelled`] and [`Connection::closing`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::WorkerConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::service::pool::ConnectionManager;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::CANCEL_GRACE;

/// A connection body queued from any thread and run on the worker thread
pub type ConnectionBody =
    Box<dyn FnOnce(Connection) -> LocalBoxFuture<'static, Result<()>> + Send + 'static>;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Box an async closure as a [`ConnectionBody`]
pub fn connection_body<F, Fut>(body: F) -> ConnectionBody
where
    F: FnOnce(Connection) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Box::new(move |connection| body(connection).boxed_local())
}

#[derive(Debug)]
struct ConnectionState {
    id: u64,
    cancel: CancellationToken,
    close_requested: AtomicBool,
    close_notify: Notify,
    deadline: Mutex<Option<Instant>>,
}

/// Per-task handle: cancellation flag, graceful close request and deadline
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionState>,
}

impl Connection {
    pub fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(ConnectionState {
                id,
                cancel: CancellationToken::new(),
                close_requested: AtomicBool::new(false),
                close_notify: Notify::new(),
                deadline: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Force-cancel. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the connection is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Ask the body to wind down on its own.
    pub fn request_close(&self) {
        if !self.inner.close_requested.swap(true, Ordering::AcqRel) {
            self.inner.close_notify.notify_waiters();
        }
    }

    pub fn close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    /// Resolves once a close was requested or the connection was cancelled
    pub async fn closing(&self) {
        loop {
            let notified = self.inner.close_notify.notified();
            if self.close_requested() || self.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancelled() => return,
            }
        }
    }

    fn lock_deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        self.inner
            .deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.lock_deadline()
    }

    pub fn set_deadline(&self, deadline: Instant) {
        *self.lock_deadline() = Some(deadline);
    }

    /// Push the deadline to `now + duration`
    pub fn extend_deadline(&self, duration: Duration) {
        self.set_deadline(Instant::now() + duration);
    }

    /// Drop the deadline. The watchdog idles until a new one is set.
    pub fn disarm(&self) {
        *self.lock_deadline() = None;
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline().is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Registry entry: the running task, its watchdog and its handle
struct ConnectionHandle {
    connection: Connection,
    task: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

struct Admission {
    timeout: Option<Duration>,
    body: ConnectionBody,
}

struct Shared {
    name: String,
    config: WorkerConfig,
    callbacks: Mutex<VecDeque<Callback>>,
    admissions: Mutex<VecDeque<Admission>>,
    wakeup: Notify,
    count: AtomicUsize,
    next_id: AtomicU64,
    running: AtomicBool,
    stopping: AtomicBool,
    finished: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a worker; cheap to clone and usable from any thread
#[derive(Clone)]
pub struct ConnectionWorker {
    shared: Arc<Shared>,
}

impl ConnectionWorker {
    pub fn new(name: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                callbacks: Mutex::new(VecDeque::new()),
                admissions: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                count: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Registered connections. Advisory when read from another thread.
    pub fn connection_count(&self) -> usize {
        self.shared.count.load(Ordering::Relaxed)
    }

    /// Whether shutdown has begun; admissions are refused from here on
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Whether `run` has returned
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Wake the loop early. Harmless before `run` and after it returned.
    pub fn wake(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Run `callback` on the worker thread.
    ///
    /// Callbacks are still serviced during shutdown; once `run` has returned
    /// they are refused.
    pub fn execute<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            // Checked under the queue lock so nothing lands after the final drain
            let mut callbacks = lock(&self.shared.callbacks);
            if self.is_finished() {
                return Err(ProtocolError::Custom(constants::ERR_WORKER_GONE.into()));
            }
            callbacks.push_back(Box::new(callback));
        }
        self.wake();
        Ok(())
    }

    /// Drive the worker on the calling thread until `stop` is cancelled.
    pub fn run(&self, stop: CancellationToken) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::Custom("Worker is already running".into()));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, self.event_loop(stop));
        Ok(())
    }

    #[instrument(skip(self, stop), fields(worker = %self.shared.name))]
    async fn event_loop(&self, stop: CancellationToken) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();
        let mut registry: HashMap<u64, ConnectionHandle> = HashMap::new();
        info!("Connection worker started");

        while !stop.is_cancelled() {
            let mut busy = self.drain_callbacks();
            for admission in self.take_admissions() {
                self.admit(admission, &mut registry, &done_tx);
                busy = true;
            }
            while let Ok(id) = done_rx.try_recv() {
                self.remove(&mut registry, id);
            }

            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.shared.wakeup.notified() => {}
                _ = stop.cancelled() => {}
                Some(id) = done_rx.recv() => self.remove(&mut registry, id),
                _ = tokio::time::sleep(self.shared.config.max_sleep) => {}
            }
        }

        self.shutdown(&mut registry, &done_tx, &mut done_rx).await;
    }

    fn drain_callbacks(&self) -> bool {
        let mut ran = false;
        loop {
            let Some(callback) = lock(&self.shared.callbacks).pop_front() else {
                return ran;
            };
            ran = true;
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!("Worker callback panicked");
            }
        }
    }

    fn take_admissions(&self) -> Vec<Admission> {
        lock(&self.shared.admissions).drain(..).collect()
    }

    fn admit(
        &self,
        admission: Admission,
        registry: &mut HashMap<u64, ConnectionHandle>,
        done: &mpsc::UnboundedSender<u64>,
    ) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id);

        let watchdog = admission.timeout.map(|timeout| {
            connection.set_deadline(Instant::now() + timeout);
            tokio::task::spawn_local(watchdog(
                connection.clone(),
                self.shared.config.watchdog_interval,
            ))
        });

        let body = (admission.body)(connection.clone());
        let task = tokio::task::spawn_local(run_connection(connection.clone(), body, done.clone()));

        registry.insert(
            id,
            ConnectionHandle {
                connection,
                task,
                watchdog,
            },
        );
        self.shared.count.fetch_add(1, Ordering::Relaxed);
        global_metrics().connection_established();
        trace!(connection = id, "Connection admitted");
    }

    fn remove(&self, registry: &mut HashMap<u64, ConnectionHandle>, id: u64) {
        if let Some(handle) = registry.remove(&id) {
            if let Some(watchdog) = handle.watchdog {
                watchdog.abort();
            }
            self.shared.count.fetch_sub(1, Ordering::Relaxed);
            global_metrics().connection_closed();
        }
    }

    async fn shutdown(
        &self,
        registry: &mut HashMap<u64, ConnectionHandle>,
        done_tx: &mpsc::UnboundedSender<u64>,
        done_rx: &mut mpsc::UnboundedReceiver<u64>,
    ) {
        // Admissions accepted before the flag flipped still run, and close with the rest
        let late: Vec<Admission> = {
            let mut admissions = lock(&self.shared.admissions);
            self.shared.stopping.store(true, Ordering::Release);
            admissions.drain(..).collect()
        };
        for admission in late {
            self.admit(admission, registry, done_tx);
        }

        info!(connections = registry.len(), "Connection worker stopping");
        for handle in registry.values() {
            handle.connection.request_close();
        }

        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        while !registry.is_empty() {
            self.drain_callbacks();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = (deadline - now).min(self.shared.config.max_sleep);
            tokio::select! {
                Some(id) = done_rx.recv() => self.remove(registry, id),
                _ = self.shared.wakeup.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }

        if !registry.is_empty() {
            warn!(
                remaining = registry.len(),
                "Shutdown grace elapsed, cancelling connections"
            );
            for handle in registry.values() {
                handle.connection.cancel();
            }
            let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
            while !registry.is_empty() {
                tokio::select! {
                    Some(id) = done_rx.recv() => self.remove(registry, id),
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
            let stragglers: Vec<u64> = registry.keys().copied().collect();
            for id in stragglers {
                if let Some(handle) = registry.get(&id) {
                    handle.task.abort();
                }
                self.remove(registry, id);
            }
        }

        {
            let _callbacks = lock(&self.shared.callbacks);
            self.shared.finished.store(true, Ordering::Release);
        }
        self.drain_callbacks();
        info!("Connection worker stopped");
        global_metrics().log_metrics();
    }
}

impl ConnectionManager for ConnectionWorker {
    fn add_connection(&self, timeout: Option<Duration>, body: ConnectionBody) -> Result<()> {
        {
            let mut admissions = lock(&self.shared.admissions);
            if self.is_stopping() {
                return Err(ProtocolError::Custom(constants::ERR_WORKER_GONE.into()));
            }
            admissions.push_back(Admission { timeout, body });
        }
        self.wake();
        Ok(())
    }

    fn connection_count(&self) -> usize {
        ConnectionWorker::connection_count(self)
    }
}

/// Cancel `connection` once its deadline passes. Lives as long as the task;
/// while disarmed it keeps polling so a later deadline is still enforced.
async fn watchdog(connection: Connection, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = connection.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match connection.deadline() {
            None => {}
            Some(deadline) if Instant::now() >= deadline => {
                global_metrics().connection_timed_out();
                info!(connection = connection.id(), "Connection deadline passed");
                connection.cancel();
                return;
            }
            Some(_) => {}
        }
    }
}

async fn run_connection(
    connection: Connection,
    body: LocalBoxFuture<'static, Result<()>>,
    done: mpsc::UnboundedSender<u64>,
) {
    let mut body = AssertUnwindSafe(body).catch_unwind();
    let outcome = tokio::select! {
        outcome = &mut body => outcome,
        _ = connection.cancelled() => {
            match tokio::time::timeout(CANCEL_GRACE, &mut body).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(ProtocolError::Cancelled)),
            }
        }
    };

    let id = connection.id();
    match outcome {
        Ok(Ok(())) => debug!(connection = id, "Connection finished"),
        Ok(Err(e)) if e.is_authentication_failure() => {
            info!(connection = id, error=%e, "Connection closed: authentication failed")
        }
        Ok(Err(e)) if e.is_protocol_violation() => {
            warn!(connection = id, error=%e, "Connection closed: protocol violation")
        }
        Ok(Err(e)) if e.is_expected_disconnect() => {
            info!(connection = id, error=%e, "Connection closed")
        }
        Ok(Err(e)) => warn!(connection = id, error=%e, "Connection failed"),
        Err(_) => warn!(connection = id, "Connection task panicked"),
    }
    // The worker may already be gone during forced shutdown
    let _ = done.send(id);
}

/// A worker running on its own named thread
pub struct WorkerThread {
    worker: ConnectionWorker,
    stop: CancellationToken,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl WorkerThread {
    pub fn spawn(name: impl Into<String>, config: WorkerConfig) -> Result<Self> {
        let name = name.into();
        let worker = ConnectionWorker::new(name.clone(), config);
        let stop = CancellationToken::new();
        let thread = {
            let worker = worker.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker.run(stop))?
        };
        Ok(Self {
            worker,
            stop,
            thread: Some(thread),
        })
    }

    pub fn worker(&self) -> &ConnectionWorker {
        &self.worker
    }

    /// Signal the loop to stop without waiting
    pub fn stop(&self) {
        self.stop.cancel();
        self.worker.wake();
    }

    /// Stop and wait for the thread to finish
    pub fn join(mut self) -> Result<()> {
        self.stop();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ProtocolError::Custom("Worker thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join_inner() {
            warn!(error=%e, "Worker thread did not stop cleanly");
        }
    }
}
