//! LogFlow message queue
//!
//! Provides:
//! - `MessageQueue`: bounded FIFO with a watermark ladder (slowdown, block, discard, spill)
//! - Disk assistance through a SQLite spill store with checkpointing
//! - `WorkerPool` workers that pull batches and feed a `BatchConsumer`
//! - Queue file-name registry shared by all queues of a process

pub mod batch;
pub mod disk;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod window;

pub use batch::{Batch, BatchElement, ElementState};
pub use disk::DiskStore;
pub use error::QueueError;
pub use pool::{BatchConsumer, WorkerContext};
pub use queue::{DiscardReason, EnqueueOutcome, MessageQueue, QueueStats, ShutdownReport};
pub use registry::{QueueEnvironment, QueueFileRegistry};
pub use window::DequeueWindow;

pub type Result<T> = std::result::Result<T, QueueError>;
