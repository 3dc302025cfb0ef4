//! Deferred propagation through the outbox queue.
//!
//! In outbox mode record writes only enqueue their trigger fields. An
//! [`OutboxWorker`] claims batches of tasks and propagates each one on its
//! own; [`OutboxRunner`] drives a worker on a background task until told to
//! stop.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cellflow_storage::{OutboxStore, TaskStatus};

use crate::engine::Engine;
use crate::error::EngineError;

/// Claims and processes up to `limit` tasks as `worker_id`. When `shutdown`
/// flips to true mid-batch, the unprocessed tasks are released back to
/// pending. Returns the number of tasks processed (completed or failed).
pub(crate) fn process_batch(
    engine: &mut Engine,
    worker_id: &str,
    limit: usize,
    shutdown: Option<&watch::Receiver<bool>>,
) -> Result<usize, EngineError> {
    let tasks = engine.store_mut().claim_batch(worker_id, limit)?;
    if tasks.is_empty() {
        return Ok(0);
    }
    let max_attempts = engine.config().outbox_max_attempts;
    let mut handled = 0;
    let mut failed = 0;
    let mut pending = tasks.into_iter();
    while let Some(task) = pending.next() {
        if shutdown.is_some_and(|rx| *rx.borrow()) {
            engine.store_mut().release(task.id)?;
            for rest in pending.by_ref() {
                engine.store_mut().release(rest.id)?;
            }
            info!(worker = worker_id, "shutdown requested, released unprocessed tasks");
            break;
        }
        match engine.propagate_task(&task) {
            Ok(changes) => {
                engine.store_mut().complete(task.id)?;
                debug!(task = task.id, changed = changes.len(), "task completed");
            }
            Err(err) => {
                failed += 1;
                let status = engine.store_mut().fail(task.id, &err.to_string(), max_attempts)?;
                if status == TaskStatus::Failed {
                    warn!(task = task.id, attempts = task.attempts + 1, error = %err, "task failed permanently");
                } else {
                    warn!(task = task.id, error = %err, "task failed, will retry");
                }
            }
        }
        handled += 1;
    }
    info!(worker = worker_id, handled, failed, "outbox batch processed");
    Ok(handled)
}

/// Processes outbox tasks with an engine of its own.
pub struct OutboxWorker {
    engine: Engine,
    shutdown: Option<watch::Receiver<bool>>,
}

impl OutboxWorker {
    pub fn new(engine: Engine) -> Self {
        OutboxWorker {
            engine,
            shutdown: None,
        }
    }

    /// Stops mid-batch once `shutdown` holds true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn into_engine(self) -> Engine {
        self.engine
    }

    /// Claims one batch and processes it. The schema is reloaded first
    /// since other connections may have changed it.
    pub fn run_once(&mut self, worker_id: &str, limit: usize) -> Result<usize, EngineError> {
        self.engine.reload_schema()?;
        process_batch(&mut self.engine, worker_id, limit, self.shutdown.as_ref())
    }

    /// Returns abandoned claims to pending.
    pub fn reclaim_stale(&mut self) -> Result<usize, EngineError> {
        let stale_after = self.engine.config().outbox_stale_after;
        Ok(self.engine.store_mut().reclaim_stale(stale_after)?)
    }
}

/// A worker polling the outbox on a background task.
pub struct OutboxRunner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<OutboxWorker, EngineError>>,
}

impl OutboxRunner {
    /// Starts polling. `worker_id` defaults to a random `worker-<uuid>`.
    pub fn spawn(worker: OutboxWorker, worker_id: Option<String>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let worker = worker.with_shutdown(rx.clone());
        let handle = tokio::spawn(poll(worker, worker_id, rx));
        OutboxRunner { shutdown, handle }
    }

    /// Signals shutdown and waits for the in-flight task to finish. Hands
    /// the worker back.
    pub async fn shutdown(self) -> Result<OutboxWorker, EngineError> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| EngineError::Worker(format!("outbox task panicked: {e}")))?
    }
}

async fn poll(
    mut worker: OutboxWorker,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<OutboxWorker, EngineError> {
    let poll_interval = worker.engine().config().outbox_poll_interval;
    let batch_size = worker.engine().config().outbox_batch_size;
    info!(worker = %worker_id, "outbox worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let id = worker_id.clone();
        let (returned, handled) = tokio::task::spawn_blocking(move || {
            let result = worker
                .reclaim_stale()
                .and_then(|_| worker.run_once(&id, batch_size));
            (worker, result)
        })
        .await
        .map_err(|e| EngineError::Worker(format!("outbox batch panicked: {e}")))?;
        worker = returned;

        match handled {
            Ok(0) => {}
            Ok(_) => continue,
            Err(err) => warn!(worker = %worker_id, error = %err, "outbox poll failed"),
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    info!(worker = %worker_id, "outbox worker stopped");
    Ok(worker)
}
