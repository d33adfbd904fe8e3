//! MessageQueue Tests
//!
//! Tests for:
//! - FIFO ordering per producer
//! - Watermark ladder (slowdown, block, transient-full, severity discard, capacity)
//! - Batch sizing and the dequeue window
//! - Destruct idempotence and post-stop behavior
//! - Disk assistance, checkpoints, save-on-shutdown and recovery

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{Local, Timelike};
use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::time::Instant;
use tokio_test::assert_ok;

use lf_common::{FlowControl, Message, QueueConfig, Severity};
use lf_queue::{
    Batch, BatchConsumer, DiscardReason, EnqueueOutcome, MessageQueue, QueueEnvironment,
    QueueError, WorkerContext,
};

fn payloads(batch: &Batch) -> Vec<String> {
    batch.elements().iter().map(|e| e.message.payload().into_owned()).collect()
}

async fn drain_all(queue: &MessageQueue) -> Vec<String> {
    let mut out = Vec::new();
    while queue.size() > 0 {
        let batch = tokio::time::timeout(Duration::from_secs(1), queue.dequeue_batch())
            .await
            .expect("dequeue timed out")
            .expect("queue stopped");
        out.extend(payloads(&batch));
    }
    out
}

fn blocking(payload: impl Into<String>) -> Message {
    Message::new(payload.into()).with_flow_control(FlowControl::FullDelay)
}

#[tokio::test]
async fn test_single_producer_fifo() {
    let queue = MessageQueue::new("fifo", QueueConfig::in_memory(1000)).unwrap();
    for i in 0..100 {
        let outcome = queue.enqueue(Message::new(format!("m{}", i))).await.unwrap();
        assert!(outcome.is_accepted());
    }

    let expected: Vec<String> = (0..100).map(|i| format!("m{}", i)).collect();
    assert_eq!(drain_all(&queue).await, expected);
}

#[tokio::test]
async fn test_batch_size_limit() {
    let config = QueueConfig {
        dequeue_batch_size: 4,
        ..QueueConfig::in_memory(100)
    };
    let queue = MessageQueue::new("batches", config).unwrap();
    for i in 0..10 {
        queue.enqueue(Message::new(format!("m{}", i))).await.unwrap();
    }

    let mut sizes = Vec::new();
    while queue.size() > 0 {
        sizes.push(queue.dequeue_batch().await.unwrap().len());
    }
    assert_eq!(sizes, vec![4, 4, 2]);
    assert_eq!(queue.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_producers_keep_relative_order() {
    let queue = MessageQueue::new("interleaved", QueueConfig::in_memory(1000)).unwrap();

    let mut producers = Vec::new();
    for producer in ["a", "b"] {
        let queue = queue.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..10 {
                queue.enqueue(Message::new(format!("{}-{}", producer, i))).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let all = drain_all(&queue).await;
    assert_eq!(all.len(), 20);
    for producer in ["a", "b"] {
        let seen: Vec<_> = all.iter().filter(|p| p.starts_with(producer)).cloned().collect();
        let expected: Vec<_> = (0..10).map(|i| format!("{}-{}", producer, i)).collect();
        assert_eq!(seen, expected);
    }
}

#[tokio::test]
async fn test_severity_discard_caps_queue_at_discard_mark() {
    let config = QueueConfig {
        low_watermark: Some(40),
        high_watermark: Some(80),
        discard_mark: Some(90),
        discard_severity: Some(Severity::Error),
        timeout_enqueue_ms: 2,
        ..QueueConfig::in_memory(100)
    };
    let queue = MessageQueue::new("discard", config).unwrap();

    let mut outcomes = Vec::new();
    for i in 0..95 {
        let msg = blocking(format!("m{}", i)).with_severity(Severity::Error);
        outcomes.push(queue.enqueue(msg).await.unwrap());
    }

    assert!(outcomes[..90].iter().all(|o| o.is_accepted()));
    assert!(outcomes[90..]
        .iter()
        .all(|o| matches!(o, EnqueueOutcome::Discarded(DiscardReason::Severity))));
    assert_eq!(queue.size(), 90);
    assert_eq!(queue.stats().discarded, 5);
}

#[tokio::test]
async fn test_more_important_severity_passes_discard_mark() {
    let config = QueueConfig {
        discard_mark: Some(2),
        discard_severity: Some(Severity::Warning),
        ..QueueConfig::in_memory(10)
    };
    let queue = MessageQueue::new("shed", config).unwrap();
    for _ in 0..2 {
        queue.enqueue(Message::new("fill")).await.unwrap();
    }

    let info = queue.enqueue(Message::new("info").with_severity(Severity::Info)).await.unwrap();
    assert!(matches!(info, EnqueueOutcome::Discarded(DiscardReason::Severity)));

    let crit = queue.enqueue(Message::new("crit").with_severity(Severity::Critical)).await.unwrap();
    assert!(crit.is_accepted());
}

#[tokio::test]
async fn test_enqueue_slowdown_between_low_and_high() {
    let config = QueueConfig {
        low_watermark: Some(2),
        high_watermark: Some(4),
        enqueue_slowdown_us: 100_000,
        timeout_enqueue_ms: 0,
        ..QueueConfig::in_memory(10)
    };
    let slowdown = Duration::from_millis(100);
    let queue = MessageQueue::new("slowdown", config.clone()).unwrap();

    let mut delayed = Vec::new();
    for i in 0..6 {
        let started = Instant::now();
        assert!(queue.enqueue(blocking(format!("m{}", i))).await.unwrap().is_accepted());
        delayed.push(started.elapsed() >= slowdown);
    }
    // depth before each enqueue: 0, 1 below low; 2, 3 in [low, high); 4, 5 at or above high
    assert_eq!(delayed, vec![false, false, true, true, false, false]);

    // producers that may not be delayed skip the slowdown
    let queue = MessageQueue::new("no-slowdown", config).unwrap();
    for i in 0..2 {
        queue.enqueue(Message::new(format!("m{}", i))).await.unwrap();
    }
    let started = Instant::now();
    assert!(queue.enqueue(Message::new("quick")).await.unwrap().is_accepted());
    assert!(started.elapsed() < slowdown);
}

#[tokio::test]
async fn test_messages_held_outside_dequeue_window() {
    // a one-hour window starting two hours from now is closed for the whole test
    let hour = Local::now().hour() as u8;
    let config = QueueConfig {
        dequeue_time_begin: Some((hour + 2) % 24),
        dequeue_time_end: Some((hour + 3) % 24),
        ..QueueConfig::in_memory(10)
    };
    let queue = MessageQueue::new("window", config).unwrap();
    for i in 0..3 {
        assert!(queue.enqueue(Message::new(format!("m{}", i))).await.unwrap().is_accepted());
    }

    let held = tokio::time::timeout(Duration::from_millis(100), queue.dequeue_batch()).await;
    assert!(held.is_err());
    assert_eq!(queue.size(), 3);
    assert_eq!(queue.stats().dequeued, 0);

    let report = queue.destruct(false).await.unwrap();
    assert_eq!(report.lost, 3);
}

#[tokio::test]
async fn test_non_blocking_producer_gets_transient_full() {
    let config = QueueConfig {
        high_watermark: Some(3),
        low_watermark: Some(1),
        ..QueueConfig::in_memory(10)
    };
    let queue = MessageQueue::new("nodelay", config).unwrap();
    for i in 0..3 {
        assert!(queue.enqueue(Message::new(format!("m{}", i))).await.unwrap().is_accepted());
    }

    match queue.enqueue(Message::new("late")).await.unwrap() {
        EnqueueOutcome::TransientFull(msg) => assert_eq!(msg.payload(), "late"),
        other => panic!("expected TransientFull, got {:?}", other),
    }
    assert_eq!(queue.size(), 3);
}

#[tokio::test]
async fn test_full_queue_without_disk_drops() {
    let config = QueueConfig {
        timeout_enqueue_ms: 0,
        ..QueueConfig::in_memory(5)
    };
    let queue = MessageQueue::new("full", config).unwrap();
    for i in 0..5 {
        queue.enqueue(blocking(format!("m{}", i))).await.unwrap();
    }

    let outcome = queue.enqueue(blocking("overflow")).await.unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Discarded(DiscardReason::QueueFull)));
    assert_eq!(queue.size(), 5);
}

#[tokio::test]
async fn test_blocked_producer_resumes_when_space_frees() {
    let config = QueueConfig {
        high_watermark: Some(2),
        low_watermark: Some(1),
        timeout_enqueue_ms: 5_000,
        dequeue_batch_size: 2,
        ..QueueConfig::in_memory(10)
    };
    let queue = MessageQueue::new("block", config).unwrap();
    queue.enqueue(blocking("m0")).await.unwrap();
    queue.enqueue(blocking("m1")).await.unwrap();

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let outcome = queue.enqueue(blocking("m2")).await.unwrap();
            (outcome, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    let batch = queue.dequeue_batch().await.unwrap();
    assert_eq!(payloads(&batch), vec!["m0", "m1"]);

    let (outcome, waited) = producer.await.unwrap();
    assert!(outcome.is_accepted());
    assert!(waited < Duration::from_secs(5));
    assert_eq!(payloads(&queue.dequeue_batch().await.unwrap()), vec!["m2"]);
}

#[tokio::test]
async fn test_invalid_watermarks_rejected() {
    let config = QueueConfig {
        low_watermark: Some(50),
        high_watermark: Some(20),
        ..QueueConfig::in_memory(100)
    };
    let result = MessageQueue::new("bad", config);
    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_destruct_is_idempotent() {
    let queue = MessageQueue::new("twice", QueueConfig::in_memory(10)).unwrap();
    queue.enqueue(Message::new("left behind")).await.unwrap();

    let first = queue.destruct(true).await.unwrap();
    assert!(!first.already_stopped);
    assert_eq!(first.lost, 1);

    let second = queue.destruct(true).await.unwrap();
    assert!(second.already_stopped);

    let result = queue.enqueue(Message::new("late")).await;
    assert!(matches!(result, Err(QueueError::Stopped(_))));
}

#[tokio::test]
async fn test_dequeue_wakes_on_shutdown() {
    let queue = MessageQueue::new("idle", QueueConfig::in_memory(10)).unwrap();
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue_batch().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.destruct(false).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_disk_assist_spills_and_keeps_order() {
    let dir = tempdir().unwrap();
    let env = QueueEnvironment::new(dir.path());
    let config = QueueConfig {
        file_prefix: Some("spill".to_string()),
        timeout_enqueue_ms: 0,
        dequeue_batch_size: 10,
        ..QueueConfig::in_memory(3)
    };
    let queue = MessageQueue::construct("disk", config, &env).unwrap();
    let recorder = Arc::new(Recorder::default());
    queue.start(recorder.clone()).await.unwrap();
    // let the worker settle before filling
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut spilled = 0;
    for i in 0..8 {
        if let EnqueueOutcome::Spilled = queue.enqueue(blocking(format!("m{}", i))).await.unwrap() {
            spilled += 1;
        }
    }
    recorder.wait_for(8).await;

    let expected: Vec<String> = (0..8).map(|i| format!("m{}", i)).collect();
    assert_eq!(recorder.seen(), expected);
    assert!(spilled <= 5);
    queue.destruct(true).await.unwrap();
}

#[tokio::test]
async fn test_save_on_shutdown_and_recover() {
    let dir = tempdir().unwrap();
    let config = QueueConfig {
        file_prefix: Some("mainq".to_string()),
        save_on_shutdown: true,
        worker_threads: 1,
        dequeue_batch_size: 2,
        ..QueueConfig::in_memory(10)
    };

    {
        let env = QueueEnvironment::new(dir.path());
        let queue = MessageQueue::construct("main", config.clone(), &env).unwrap();
        queue.start(Arc::new(Stalling)).await.unwrap();
        for i in 0..5 {
            queue.enqueue(blocking(format!("m{}", i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = queue.destruct(false).await.unwrap();
        assert_eq!(report.persisted, 5);
        assert_eq!(report.lost, 0);
    }

    let env = QueueEnvironment::new(dir.path());
    let queue = MessageQueue::construct("main", config, &env).unwrap();
    let recorder = Arc::new(Recorder::default());
    queue.start(recorder.clone()).await.unwrap();
    recorder.wait_for(5).await;

    let expected: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
    assert_eq!(recorder.seen(), expected);
    queue.destruct(true).await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_forgets_consumed_disk_messages() {
    let dir = tempdir().unwrap();
    let config = QueueConfig {
        file_prefix: Some("ckpt".to_string()),
        timeout_enqueue_ms: 0,
        dequeue_batch_size: 10,
        worker_threads: 1,
        persist_update_count: 0,
        ..QueueConfig::in_memory(2)
    };
    let env = QueueEnvironment::new(dir.path());
    let queue = MessageQueue::construct("ckpt", config.clone(), &env).unwrap();
    let gate = Arc::new(Gate::default());
    assert_ok!(queue.start(gate.clone()).await);

    for i in 0..8 {
        queue.enqueue(blocking(format!("m{}", i))).await.unwrap();
    }
    assert!(queue.stats().spilled > 0);
    gate.open.store(true, Ordering::SeqCst);
    gate.recorder.wait_for(8).await;

    assert_ok!(queue.checkpoint().await);

    // a second store on the same file finds nothing left to replay
    let env = QueueEnvironment::new(dir.path());
    let reopened = MessageQueue::construct("ckpt", config, &env).unwrap();
    assert_eq!(reopened.store_path(), queue.store_path());
    let recorder = Arc::new(Recorder::default());
    assert_ok!(reopened.start(recorder.clone()).await);
    assert_eq!(reopened.disk_size(), 0);

    reopened.destruct(false).await.unwrap();
    queue.destruct(false).await.unwrap();
}

#[tokio::test]
async fn test_colliding_file_prefix_is_renamed() {
    let dir = tempdir().unwrap();
    let env = QueueEnvironment::new(dir.path());
    let config = QueueConfig {
        file_prefix: Some("shared".to_string()),
        ..QueueConfig::in_memory(10)
    };
    let first = MessageQueue::construct("one", config.clone(), &env).unwrap();
    let second = MessageQueue::construct("two", config, &env).unwrap();

    assert_eq!(first.store_path().unwrap(), dir.path().join("shared.qdb"));
    assert_eq!(second.store_path().unwrap(), dir.path().join("1-shared-two.qdb"));
}

/// Records payloads in the order batches arrive.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages not delivered in time");
    }
}

#[async_trait]
impl BatchConsumer for Recorder {
    async fn consume(&self, batch: &mut Batch, _worker: &WorkerContext) {
        self.seen.lock().extend(payloads(batch));
    }
}

/// Records batches, but only once opened.
#[derive(Default)]
struct Gate {
    open: AtomicBool,
    recorder: Recorder,
}

#[async_trait]
impl BatchConsumer for Gate {
    async fn consume(&self, batch: &mut Batch, worker: &WorkerContext) {
        while !self.open.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.recorder.consume(batch, worker).await;
    }
}

/// Holds its batch until shutdown-immediate is requested, then gives up.
struct Stalling;

#[async_trait]
impl BatchConsumer for Stalling {
    async fn consume(&self, _batch: &mut Batch, worker: &WorkerContext) {
        while !worker.shutdown_requested() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
