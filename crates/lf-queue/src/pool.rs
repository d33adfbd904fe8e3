//! Worker pool bound to one queue.
//!
//! Workers pull batches and hand them to the registered [`BatchConsumer`].
//! The pool grows with queue depth (`ceil(depth / min_msgs_per_worker)`,
//! capped at `worker_threads`); surplus workers retire after sitting idle
//! for `timeout_worker_shutdown`. One worker always stays.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::batch::{Batch, ElementState};
use crate::metrics;
use crate::queue::{Dequeued, MessageQueue};
use crate::{QueueError, Result};

/// Processes the batches a queue hands to its workers.
///
/// The consumer sets each element's terminal state; anything left pending
/// is committed by the worker afterwards, unless shutdown-immediate was
/// requested, in which case pending elements go back to the queue.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn consume(&self, batch: &mut Batch, worker: &WorkerContext);
}

/// Per-worker view passed to the consumer.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    queue_name: Arc<str>,
    queue_id: Option<u64>,
    worker_id: usize,
    shutdown_immediate: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Context not tied to a running queue.
    pub fn new(queue_name: impl Into<Arc<str>>, worker_id: usize, shutdown_immediate: Arc<AtomicBool>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_id: None,
            worker_id,
            shutdown_immediate,
        }
    }

    pub(crate) fn for_queue(queue: &MessageQueue, worker_id: usize) -> Self {
        Self {
            queue_id: Some(queue.id()),
            ..Self::new(queue.name(), worker_id, queue.shutdown_flag())
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// [`MessageQueue::id`] of the queue this worker serves.
    pub fn queue_id(&self) -> Option<u64> {
        self.queue_id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Checked between batch elements; once set, the current batch should be abandoned.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_immediate.load(Ordering::Acquire)
    }
}

pub(crate) struct WorkerPool {
    max_workers: usize,
    min_msgs_per_worker: usize,
    consumer: RwLock<Option<Arc<dyn BatchConsumer>>>,
    runtime: RwLock<Option<Handle>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicUsize,
    in_flight: AtomicUsize,
    next_id: AtomicUsize,
    stopping: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(max_workers: usize, min_msgs_per_worker: usize) -> Self {
        Self {
            max_workers,
            min_msgs_per_worker,
            consumer: RwLock::new(None),
            runtime: RwLock::new(None),
            handles: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.consumer.read().is_some()
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn batch_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn batch_done(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn start(
        &self,
        queue: &Arc<MessageQueue>,
        consumer: Arc<dyn BatchConsumer>,
        runtime: &Handle,
    ) -> Result<()> {
        if self.max_workers == 0 {
            return Err(QueueError::ResourceExhausted(format!(
                "queue {} has no worker threads configured",
                queue.name()
            )));
        }
        *self.consumer.write() = Some(consumer);
        *self.runtime.write() = Some(runtime.clone());
        self.advise(queue, queue.size());
        Ok(())
    }

    /// Spawns workers until the pool matches what `depth` calls for.
    pub(crate) fn advise(&self, queue: &Arc<MessageQueue>, depth: usize) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        let Some(consumer) = self.consumer.read().clone() else {
            return;
        };
        let desired = self.desired_workers(depth);
        while self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < desired).then_some(n + 1))
            .is_ok()
        {
            self.spawn(queue.clone(), consumer.clone());
        }
    }

    fn desired_workers(&self, depth: usize) -> usize {
        let wanted = if self.min_msgs_per_worker == 0 {
            self.max_workers
        } else {
            depth.div_ceil(self.min_msgs_per_worker)
        };
        wanted.clamp(1, self.max_workers.max(1))
    }

    fn spawn(&self, queue: Arc<MessageQueue>, consumer: Arc<dyn BatchConsumer>) {
        let Some(runtime) = self.runtime.read().clone() else {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let context = WorkerContext::for_queue(&queue, worker_id);
        metrics::set_active_workers(queue.name(), self.active_workers());

        let task = runtime.spawn(run_worker(queue, consumer, context));
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(task);
    }

    /// Gives up one worker slot if more than one worker is running.
    fn retire_idle(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 1).then_some(n - 1))
            .is_ok()
    }

    /// Waits for every worker to exit; stragglers are aborted at the deadline.
    pub(crate) async fn join(&self, timeout: Duration) -> bool {
        self.stopping.store(true, Ordering::Release);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let deadline = Instant::now() + timeout;
        let mut completed = true;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    completed = false;
                }
            }
        }
        self.active.store(0, Ordering::Release);
        completed
    }
}

async fn run_worker(queue: Arc<MessageQueue>, consumer: Arc<dyn BatchConsumer>, ctx: WorkerContext) {
    debug!(queue = %ctx.queue_name(), worker = ctx.worker_id(), "Worker started");
    let idle_timeout = queue.config().timeout_worker_shutdown();
    let slowdown = queue.config().dequeue_slowdown();

    loop {
        match queue.next_batch(Some(idle_timeout), true).await {
            Dequeued::Batch(mut batch) => {
                let committed = process_batch(&queue, consumer.as_ref(), &mut batch, &ctx).await;
                queue.pool().batch_done();
                queue.batch_finished(committed);

                if ctx.shutdown_requested() {
                    break;
                }
                if !slowdown.is_zero() {
                    tokio::time::sleep(slowdown).await;
                }
            }
            Dequeued::Idle => {
                if queue.pool().retire_idle() {
                    debug!(queue = %ctx.queue_name(), worker = ctx.worker_id(), "Idle worker retired");
                    return;
                }
            }
            Dequeued::Shutdown => break,
        }
    }

    queue.pool().active.fetch_sub(1, Ordering::AcqRel);
    debug!(queue = %ctx.queue_name(), worker = ctx.worker_id(), "Worker stopped");
}

/// Runs the consumer and settles every element. Returns the number committed.
async fn process_batch(
    queue: &MessageQueue,
    consumer: &dyn BatchConsumer,
    batch: &mut Batch,
    ctx: &WorkerContext,
) -> usize {
    let outcome = AssertUnwindSafe(consumer.consume(batch, ctx)).catch_unwind().await;
    if outcome.is_err() {
        error!(
            queue = %ctx.queue_name(),
            worker = ctx.worker_id(),
            size = batch.len(),
            "Batch consumer panicked, unprocessed messages dropped"
        );
        for index in 0..batch.len() {
            batch.mark_discard(index);
        }
    }

    if ctx.shutdown_requested() {
        let pending = batch.take_pending();
        if !pending.is_empty() {
            debug!(queue = %ctx.queue_name(), returned = pending.len(), "Returning unprocessed messages");
            queue.return_unprocessed(pending).await;
        }
    } else {
        batch.commit_pending();
    }
    batch.count(ElementState::Committed)
}
