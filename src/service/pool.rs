//! Fixed pool of connection workers.
//!
//! Distribution across workers is round-robin. The pool itself is just another
//! [`ConnectionManager`], so listeners and clients do not care whether they talk
//! to one worker or many.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::{ProtocolError, Result};
use crate::service::worker::{ConnectionBody, ConnectionWorker, WorkerThread};

/// Anything that can run connection bodies
pub trait ConnectionManager: Send + Sync {
    /// Queue `body` as a new connection task, cancelled once `timeout` passes
    /// without the deadline being extended.
    fn add_connection(&self, timeout: Option<Duration>, body: ConnectionBody) -> Result<()>;

    /// Advisory number of running connections
    fn connection_count(&self) -> usize;
}

pub struct ConnectionPool {
    workers: Vec<WorkerThread>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Start `config.threads` workers
    pub fn new(name: &str, config: WorkerConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let workers = (0..config.threads)
            .map(|i| WorkerThread::spawn(format!("{name}-{i}"), config.clone()))
            .collect::<Result<Vec<_>>>()?;
        info!(workers = workers.len(), "Connection pool started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, index: usize) -> Option<&ConnectionWorker> {
        self.workers.get(index).map(WorkerThread::worker)
    }

    /// The worker that receives the next connection
    pub fn next_worker(&self) -> &ConnectionWorker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].worker()
    }

    /// Signal every worker to stop without waiting.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Stop every worker and wait for their threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();
        let mut first_error = None;
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                warn!(error=%e, "Worker did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        info!("Connection pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl ConnectionManager for ConnectionPool {
    fn add_connection(&self, timeout: Option<Duration>, body: ConnectionBody) -> Result<()> {
        self.next_worker().add_connection(timeout, body)
    }

    fn connection_count(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.worker().connection_count())
            .sum()
    }
}
