//! Bounded multi-producer / multi-consumer message queue.
//!
//! Every enqueue walks the watermark ladder in order:
//! - below the low watermark: accepted immediately
//! - between low and high: optional slowdown delay for producers that may be delayed
//! - at or above high: blockable producers wait (bounded) for room, others get `TransientFull`
//! - at or above the discard mark: low-priority severities are shed
//! - at capacity: spill to the disk-assist store if configured, otherwise drop

use chrono::Local;
use lf_common::{Message, QueueConfig, Severity};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::disk::DiskStore;
use crate::metrics;
use crate::pool::{BatchConsumer, WorkerPool};
use crate::registry::QueueEnvironment;
use crate::window::DequeueWindow;
use crate::{QueueError, Result};

/// Result of a single enqueue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Held in memory.
    Enqueued,
    /// Written to the disk-assist store.
    Spilled,
    Discarded(DiscardReason),
    /// The queue is above its high watermark and the producer may not be blocked.
    /// The message is handed back untouched.
    TransientFull(Message),
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued | EnqueueOutcome::Spilled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Discard mark reached and the message severity is at or above the discard severity.
    Severity,
    QueueFull,
    DiskFull,
    Persistence,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Severity => "severity",
            DiscardReason::QueueFull => "queue_full",
            DiscardReason::DiskFull => "disk_full",
            DiscardReason::Persistence => "persistence",
        }
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub size: usize,
    pub disk_size: usize,
    pub enqueued: u64,
    pub spilled: u64,
    pub discarded: u64,
    pub transient_full: u64,
    pub dequeued: u64,
    pub committed: u64,
    pub returned: u64,
    pub active_workers: usize,
}

/// What happened to the queue's content during [`MessageQueue::destruct`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub already_stopped: bool,
    pub drained: bool,
    pub workers_completed: bool,
    pub persisted: usize,
    pub lost: usize,
}

pub(crate) enum Dequeued {
    Batch(Batch),
    Idle,
    Shutdown,
}

struct QueueState {
    memory: VecDeque<Message>,
    disk: Option<DiskStore>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    spilled: AtomicU64,
    discarded: AtomicU64,
    transient_full: AtomicU64,
    dequeued: AtomicU64,
    committed: AtomicU64,
    returned: AtomicU64,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

pub struct MessageQueue {
    id: u64,
    name: String,
    config: QueueConfig,
    store_path: Option<PathBuf>,
    window: Option<DequeueWindow>,
    state: Mutex<QueueState>,
    memory_depth: AtomicUsize,
    disk_depth: AtomicUsize,
    not_empty: Notify,
    space_available: Notify,
    accepting: AtomicBool,
    destructed: AtomicBool,
    shutdown_immediate: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    pool: WorkerPool,
    counters: Counters,
    self_ref: Weak<MessageQueue>,
}

impl MessageQueue {
    /// In-memory queue with a private environment.
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Result<Arc<Self>> {
        Self::construct(name, config, &QueueEnvironment::default())
    }

    /// Validates `config` and builds the queue. A disk-assist prefix is claimed
    /// in `env`'s registry; a taken prefix is renamed, never rejected.
    pub fn construct(
        name: impl Into<String>,
        config: QueueConfig,
        env: &QueueEnvironment,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        config.check().map_err(QueueError::InvalidConfig)?;

        let store_path = config.file_prefix.as_deref().map(|prefix| {
            let assigned = env.files.claim(prefix, Some(&name));
            env.store_path(&assigned)
        });
        let window = DequeueWindow::from_config(&config);
        let (stop_tx, _) = watch::channel(false);
        let pool = WorkerPool::new(config.worker_threads, config.min_msgs_per_worker);

        debug!(
            queue = %name,
            size = config.size,
            low = config.low_watermark(),
            high = config.high_watermark(),
            discard = config.discard_mark(),
            disk_assisted = store_path.is_some(),
            "Queue constructed"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            config,
            store_path,
            window,
            state: Mutex::new(QueueState {
                memory: VecDeque::new(),
                disk: None,
            }),
            memory_depth: AtomicUsize::new(0),
            disk_depth: AtomicUsize::new(0),
            not_empty: Notify::new(),
            space_available: Notify::new(),
            accepting: AtomicBool::new(true),
            destructed: AtomicBool::new(false),
            shutdown_immediate: Arc::new(AtomicBool::new(false)),
            stop_tx,
            pool,
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        }))
    }

    /// Process-unique identity; queue names may repeat.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Path of the disk-assist store, if this queue is disk assisted.
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Messages held in memory plus those in the disk-assist store.
    pub fn size(&self) -> usize {
        self.memory_size() + self.disk_size()
    }

    pub fn memory_size(&self) -> usize {
        self.memory_depth.load(Ordering::Acquire)
    }

    pub fn disk_size(&self) -> usize {
        self.disk_depth.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.pool.is_started()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_immediate.clone()
    }

    /// Opens the disk-assist store (if any) and starts the worker pool.
    ///
    /// Failing to open the store is not fatal: the queue runs memory-only.
    pub async fn start(self: &Arc<Self>, consumer: Arc<dyn BatchConsumer>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            QueueError::ResourceExhausted(format!("no async runtime for workers: {}", e))
        })?;
        if self.destructed.load(Ordering::Acquire) {
            return Err(QueueError::Stopped(self.name.clone()));
        }
        if self.pool.is_started() {
            warn!(queue = %self.name, "Queue already started");
            return Ok(());
        }

        if let Some(path) = &self.store_path {
            match DiskStore::open(path, &self.config).await {
                Ok(store) => {
                    self.disk_depth.store(store.len(), Ordering::Release);
                    self.state.lock().await.disk = Some(store);
                }
                Err(e) => {
                    error!(
                        queue = %self.name,
                        path = %path.display(),
                        error = %e,
                        "Cannot open disk-assist store, running memory-only"
                    );
                }
            }
        }

        self.pool.start(self, consumer, &handle)?;

        info!(
            queue = %self.name,
            workers = self.config.worker_threads,
            batch_size = self.config.dequeue_batch_size,
            recovered = self.disk_size(),
            "Queue started"
        );
        Ok(())
    }

    /// Submits one message through the watermark ladder.
    pub async fn enqueue(&self, message: Message) -> Result<EnqueueOutcome> {
        if !self.is_accepting() {
            return Err(QueueError::Stopped(self.name.clone()));
        }

        let flow = message.flow_control;
        let depth = self.memory_size();
        let low = self.config.low_watermark();
        let high = self.config.high_watermark();

        if depth >= low && depth < high && flow.may_block() {
            let slowdown = self.config.enqueue_slowdown();
            if !slowdown.is_zero() {
                tokio::time::sleep(slowdown).await;
            }
        }

        if depth >= high && flow.may_block() {
            let budget = flow.block_budget(self.config.timeout_enqueue());
            if !self.wait_below_high(budget).await {
                debug!(queue = %self.name, "Enqueue timed out above high watermark");
            }
        }

        let outcome = self.admit(message).await?;
        self.record(&outcome);
        Ok(outcome)
    }

    /// Enqueues every message of `messages` into this queue, in order.
    pub async fn multi_enqueue(&self, messages: Vec<Message>) -> Result<Vec<EnqueueOutcome>> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.enqueue(message).await?);
        }
        Ok(outcomes)
    }

    async fn admit(&self, message: Message) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        // destruct flips the flag before taking the lock for its final sweep
        if !self.is_accepting() {
            return Err(QueueError::Stopped(self.name.clone()));
        }
        let depth = state.memory.len();

        if self.sheds(depth, message.severity) {
            return Ok(EnqueueOutcome::Discarded(DiscardReason::Severity));
        }
        if depth >= self.config.high_watermark() && !message.flow_control.may_block() {
            return Ok(EnqueueOutcome::TransientFull(message));
        }

        let spill = state.disk.is_some() && (depth >= self.config.size || self.disk_size() > 0);
        if spill {
            return Ok(self.spill(&mut state, message).await);
        }
        if depth >= self.config.size {
            return Ok(EnqueueOutcome::Discarded(DiscardReason::QueueFull));
        }

        state.memory.push_back(message);
        let depth = state.memory.len();
        self.memory_depth.store(depth, Ordering::Release);
        drop(state);

        self.not_empty.notify_one();
        if let Some(queue) = self.self_ref.upgrade() {
            self.pool.advise(&queue, depth);
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    fn sheds(&self, depth: usize, severity: Severity) -> bool {
        match self.config.discard_severity {
            Some(threshold) => depth >= self.config.discard_mark() && severity >= threshold,
            None => false,
        }
    }

    async fn spill(&self, state: &mut QueueState, message: Message) -> EnqueueOutcome {
        let Some(store) = state.disk.as_mut() else {
            return EnqueueOutcome::Discarded(DiscardReason::QueueFull);
        };

        let result = store.append(&message).await;
        let disk_len = store.len();
        match result {
            Ok(true) => {
                self.disk_depth.store(disk_len, Ordering::Release);
                self.not_empty.notify_one();
                EnqueueOutcome::Spilled
            }
            Ok(false) => EnqueueOutcome::Discarded(DiscardReason::DiskFull),
            Err(e) => {
                error!(
                    queue = %self.name,
                    error = %e,
                    lost = disk_len,
                    "Disk-assist write failed, continuing memory-only"
                );
                state.disk = None;
                self.disk_depth.store(0, Ordering::Release);
                if state.memory.len() < self.config.size {
                    state.memory.push_back(message);
                    self.memory_depth.store(state.memory.len(), Ordering::Release);
                    self.not_empty.notify_one();
                    EnqueueOutcome::Enqueued
                } else {
                    EnqueueOutcome::Discarded(DiscardReason::Persistence)
                }
            }
        }
    }

    /// Waits until the in-memory depth drops below the high watermark.
    /// Returns false if `budget` ran out first.
    async fn wait_below_high(&self, budget: Duration) -> bool {
        let high = self.config.high_watermark();
        let deadline = Instant::now() + budget;
        loop {
            let notified = self.space_available.notified();
            if self.memory_size() < high {
                return true;
            }
            if !self.is_accepting() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.memory_size() < high;
            }
        }
    }

    fn record(&self, outcome: &EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Enqueued => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::record_enqueued(&self.name);
            }
            EnqueueOutcome::Spilled => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.counters.spilled.fetch_add(1, Ordering::Relaxed);
                metrics::record_spilled(&self.name);
            }
            EnqueueOutcome::Discarded(reason) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                metrics::record_discarded(&self.name, reason.as_str());
                debug!(queue = %self.name, reason = reason.as_str(), "Message discarded");
            }
            EnqueueOutcome::TransientFull(_) => {
                self.counters.transient_full.fetch_add(1, Ordering::Relaxed);
                metrics::record_transient_full(&self.name);
            }
        }
    }

    /// Waits until at least one message is available and returns up to
    /// `dequeue_batch_size` of them. `None` once the workers are told to stop.
    pub async fn dequeue_batch(&self) -> Option<Batch> {
        match self.next_batch(None, false).await {
            Dequeued::Batch(batch) => Some(batch),
            Dequeued::Idle | Dequeued::Shutdown => None,
        }
    }

    /// Worker dequeue: a batch taken with `in_flight` must be settled with
    /// `WorkerPool::batch_done`.
    pub(crate) async fn next_batch(&self, idle_timeout: Option<Duration>, in_flight: bool) -> Dequeued {
        let mut stop_rx = self.stop_tx.subscribe();
        let idle_deadline = idle_timeout.map(|idle| Instant::now() + idle);

        loop {
            if *stop_rx.borrow_and_update() {
                return Dequeued::Shutdown;
            }

            if let Some(window) = &self.window {
                let wait = window.time_until_open(&Local::now());
                if !wait.is_zero() {
                    debug!(queue = %self.name, wait_secs = wait.as_secs(), "Outside dequeue window");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                }
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.take_batch(in_flight).await {
                return Dequeued::Batch(batch);
            }

            let idle = async {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = stop_rx.changed() => {}
                _ = idle => return Dequeued::Idle,
            }
        }
    }

    /// Takes the next batch. With `in_flight`, the batch is counted against
    /// the worker pool before the depth drops, so a drain check never sees an
    /// empty queue while a taken batch is still unaccounted for.
    async fn take_batch(&self, in_flight: bool) -> Option<Batch> {
        let max = self.config.dequeue_batch_size;
        let mut state = self.state.lock().await;

        let take = state.memory.len().min(max);
        let mut messages: Vec<Message> = state.memory.drain(..take).collect();

        if messages.is_empty() {
            if let Some(store) = state.disk.as_mut().filter(|s| !s.is_empty()) {
                match store.read_batch(max).await {
                    Ok(read) => messages = read,
                    Err(e) => {
                        error!(
                            queue = %self.name,
                            error = %e,
                            lost = store.len(),
                            "Disk-assist read failed, continuing memory-only"
                        );
                        state.disk = None;
                    }
                }
            }
        }

        if in_flight && !messages.is_empty() {
            self.pool.batch_started();
        }
        self.memory_depth.store(state.memory.len(), Ordering::Release);
        self.disk_depth
            .store(state.disk.as_ref().map_or(0, |s| s.len()), Ordering::Release);
        drop(state);

        if messages.is_empty() {
            return None;
        }
        self.counters.dequeued.fetch_add(messages.len() as u64, Ordering::Relaxed);
        metrics::set_queue_depth(&self.name, self.size());
        self.space_available.notify_waiters();
        Some(Batch::new(messages))
    }

    /// Puts messages a worker did not get to back at the head of the queue.
    pub async fn return_unprocessed(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        let mut state = self.state.lock().await;
        for message in messages.into_iter().rev() {
            state.memory.push_front(message);
        }
        self.memory_depth.store(state.memory.len(), Ordering::Release);
        drop(state);

        self.counters.returned.fetch_add(count as u64, Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    pub(crate) fn batch_finished(&self, committed: usize) {
        self.counters.committed.fetch_add(committed as u64, Ordering::Relaxed);
        self.space_available.notify_waiters();
    }

    /// Flushes the disk-assist read position now.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.disk.as_mut() {
            Some(store) => store.checkpoint().await,
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            size: self.memory_size(),
            disk_size: self.disk_size(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            spilled: self.counters.spilled.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            transient_full: self.counters.transient_full.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            active_workers: self.pool.active_workers(),
        }
    }

    /// Stops the queue and releases its resources. Calling it again is a no-op.
    ///
    /// With `drain`, workers get `timeout_shutdown` to empty the queue; after that
    /// they are asked to abandon their batches and get `timeout_action_completion`
    /// to return. Whatever is left is persisted (`save_on_shutdown` with disk
    /// assist) or reported as lost.
    pub async fn destruct(&self, drain: bool) -> Result<ShutdownReport> {
        if self.destructed.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, "Queue already destructed");
            return Ok(ShutdownReport {
                already_stopped: true,
                ..Default::default()
            });
        }
        self.accepting.store(false, Ordering::Release);
        self.space_available.notify_waiters();
        info!(queue = %self.name, size = self.size(), drain, "Shutting down queue");

        let mut report = ShutdownReport::default();
        if drain && self.pool.is_started() {
            report.drained = self.wait_until_drained(self.config.timeout_shutdown()).await;
            if !report.drained {
                warn!(
                    queue = %self.name,
                    remaining = self.size(),
                    "Queue not drained within shutdown timeout, requesting immediate shutdown"
                );
            }
        }

        self.shutdown_immediate.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
        report.workers_completed = self.pool.join(self.config.timeout_action_completion()).await;
        if !report.workers_completed {
            warn!(queue = %self.name, "Workers did not finish in time and were cancelled");
        }

        let mut state = self.state.lock().await;
        let remaining: Vec<Message> = state.memory.drain(..).collect();
        let count = remaining.len();
        if count > 0 {
            match state.disk.as_mut() {
                Some(store) if self.config.save_on_shutdown => match store.prepend(remaining).await {
                    Ok(saved) => {
                        report.persisted = saved;
                        info!(queue = %self.name, saved, "Saved queue content to disk");
                    }
                    Err(e) => {
                        report.lost = count;
                        error!(queue = %self.name, error = %e, lost = count, "Failed to save queue content");
                    }
                },
                _ => {
                    report.lost = count;
                    warn!(queue = %self.name, lost = count, "Messages left in queue at shutdown were dropped");
                }
            }
        }
        if let Some(store) = state.disk.take() {
            let kept = store.len() + report.persisted;
            if let Err(e) = store.close().await {
                warn!(queue = %self.name, error = %e, "Failed to close disk-assist store");
            } else if kept > 0 {
                info!(queue = %self.name, kept, "Disk-assist content kept for next start");
            }
        }
        self.memory_depth.store(0, Ordering::Release);
        self.disk_depth.store(0, Ordering::Release);
        drop(state);

        metrics::set_queue_depth(&self.name, 0);
        info!(queue = %self.name, ?report, "Queue shut down");
        Ok(report)
    }

    async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.size() == 0 && self.pool.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.size() == 0 && self.pool.in_flight() == 0;
            }
        }
    }
}
