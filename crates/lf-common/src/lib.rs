use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// Syslog severity.
///
/// Ordering follows the numeric syslog code, so `Debug > Error`: a "higher"
/// severity is a less important message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Severity::Emergency),
            1 => Some(Severity::Alert),
            2 => Some(Severity::Critical),
            3 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            5 => Some(Severity::Notice),
            6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Emergency => "emerg",
            Severity::Alert => "alert",
            Severity::Critical => "crit",
            Severity::Error => "err",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// Whether backpressure may block the producer of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// Never block; used for sources that cannot be paused (e.g. datagram inputs).
    #[default]
    NoDelay,
    /// Block briefly, capped at [`LIGHT_DELAY_CEILING`].
    LightDelay,
    /// Block up to the queue's full enqueue timeout.
    FullDelay,
}

/// Upper bound of a light-delay block.
pub const LIGHT_DELAY_CEILING: Duration = Duration::from_secs(1);

impl FlowControl {
    pub fn may_block(self) -> bool {
        !matches!(self, FlowControl::NoDelay)
    }

    /// How long a producer of this class may be held, given the queue's enqueue timeout.
    pub fn block_budget(self, timeout_enqueue: Duration) -> Duration {
        match self {
            FlowControl::NoDelay => Duration::ZERO,
            FlowControl::LightDelay => timeout_enqueue.min(LIGHT_DELAY_CEILING),
            FlowControl::FullDelay => timeout_enqueue,
        }
    }
}

/// Processing flags carried by a message until the preprocessor clears them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFlags {
    pub needs_acl_check: bool,
    pub needs_parsing: bool,
    pub internal: bool,
}

/// A single log record flowing through the pipeline.
///
/// Source identity fields are interned `Arc<str>` values shared between
/// all messages from the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<Arc<str>>,
    #[serde(default)]
    pub source_ip: Option<Arc<str>>,
    /// Network peer, present for messages that arrived over a socket.
    #[serde(default)]
    pub peer_addr: Option<IpAddr>,
    /// Routing key. Absent means the default ruleset.
    #[serde(default)]
    pub ruleset: Option<Arc<str>>,
    pub flags: MsgFlags,
    pub flow_control: FlowControl,
    pub severity: Severity,
    pub facility: u8,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl Message {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            raw: raw.into(),
            received_at: now,
            generated_at: now,
            hostname: None,
            source_ip: None,
            peer_addr: None,
            ruleset: None,
            flags: MsgFlags::default(),
            flow_control: FlowControl::default(),
            severity: Severity::Notice,
            facility: 1,
            tag: None,
            text: None,
        }
    }

    pub fn with_ruleset(mut self, ruleset: impl Into<Arc<str>>) -> Self {
        self.ruleset = Some(ruleset.into());
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<Arc<str>>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Marks the message as received from `addr`; sender authorization is still pending.
    pub fn from_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self.flags.needs_acl_check = true;
        self
    }

    pub fn needing_parse(mut self) -> Self {
        self.flags.needs_parsing = true;
        self
    }

    pub fn ruleset_name(&self) -> Option<&str> {
        self.ruleset.as_deref()
    }

    pub fn payload(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Tunables of one message queue.
///
/// Watermarks left unset derive from `size` (low 70%, high 90%, discard 98%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of in-memory messages.
    pub size: usize,
    pub high_watermark: Option<usize>,
    pub low_watermark: Option<usize>,
    pub discard_mark: Option<usize>,
    /// Messages at or above this severity code are shed once the discard mark is reached.
    pub discard_severity: Option<Severity>,
    pub dequeue_batch_size: usize,
    pub worker_threads: usize,
    pub min_msgs_per_worker: usize,
    pub timeout_enqueue_ms: u64,
    pub timeout_shutdown_ms: u64,
    pub timeout_action_completion_ms: u64,
    pub timeout_worker_shutdown_ms: u64,
    pub enqueue_slowdown_us: u64,
    pub dequeue_slowdown_us: u64,
    /// Enables disk assistance. The store lives at `{work_directory}/{file_prefix}.qdb`.
    pub file_prefix: Option<String>,
    /// Bytes; 0 means unbounded.
    pub max_disk_space: u64,
    /// Disk dequeues between checkpoints; 0 checkpoints only on demand and at close.
    pub persist_update_count: u64,
    pub sync_queue_files: bool,
    pub save_on_shutdown: bool,
    pub dequeue_time_begin: Option<u8>,
    pub dequeue_time_end: Option<u8>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size: 100_000,
            high_watermark: None,
            low_watermark: None,
            discard_mark: None,
            discard_severity: None,
            dequeue_batch_size: 32,
            worker_threads: 2,
            min_msgs_per_worker: 1_000,
            timeout_enqueue_ms: 2_000,
            timeout_shutdown_ms: 1_500,
            timeout_action_completion_ms: 1_000,
            timeout_worker_shutdown_ms: 60_000,
            enqueue_slowdown_us: 0,
            dequeue_slowdown_us: 0,
            file_prefix: None,
            max_disk_space: 0,
            persist_update_count: 0,
            sync_queue_files: false,
            save_on_shutdown: false,
            dequeue_time_begin: None,
            dequeue_time_end: None,
        }
    }
}

impl QueueConfig {
    /// Small in-memory queue, convenient for tests and embedded use.
    pub fn in_memory(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark.unwrap_or(self.size * 9 / 10)
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark.unwrap_or(self.size * 7 / 10)
    }

    pub fn discard_mark(&self) -> usize {
        self.discard_mark.unwrap_or(self.size * 98 / 100)
    }

    pub fn timeout_enqueue(&self) -> Duration {
        Duration::from_millis(self.timeout_enqueue_ms)
    }

    pub fn timeout_shutdown(&self) -> Duration {
        Duration::from_millis(self.timeout_shutdown_ms)
    }

    pub fn timeout_action_completion(&self) -> Duration {
        Duration::from_millis(self.timeout_action_completion_ms)
    }

    pub fn timeout_worker_shutdown(&self) -> Duration {
        Duration::from_millis(self.timeout_worker_shutdown_ms)
    }

    pub fn enqueue_slowdown(&self) -> Duration {
        Duration::from_micros(self.enqueue_slowdown_us)
    }

    pub fn dequeue_slowdown(&self) -> Duration {
        Duration::from_micros(self.dequeue_slowdown_us)
    }

    /// Checks sizing and watermark ordering (`low <= high <= size`, `discard <= size`).
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.size == 0 {
            return Err("queue size must be greater than zero".to_string());
        }
        if self.dequeue_batch_size == 0 {
            return Err("dequeue batch size must be greater than zero".to_string());
        }
        if self.worker_threads == 0 {
            return Err("at least one worker thread is required".to_string());
        }
        let (low, high, discard) = (self.low_watermark(), self.high_watermark(), self.discard_mark());
        if low > high {
            return Err(format!("low watermark {} exceeds high watermark {}", low, high));
        }
        if high > self.size {
            return Err(format!("high watermark {} exceeds queue size {}", high, self.size));
        }
        if discard > self.size {
            return Err(format!("discard mark {} exceeds queue size {}", discard, self.size));
        }
        for hour in [self.dequeue_time_begin, self.dequeue_time_end].into_iter().flatten() {
            if hour > 24 {
                return Err(format!("dequeue window hour {} is out of range", hour));
            }
        }
        Ok(())
    }

    /// Drops explicit watermarks so they derive from `size` again.
    pub fn with_derived_watermarks(mut self) -> Self {
        self.high_watermark = None;
        self.low_watermark = None;
        self.discard_mark = None;
        self
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Linux-kernel style limit: at most `burst` admissions per `interval_ms` window.
///
/// An interval of 0 disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub burst: u32,
    pub interval_ms: u64,
}

impl RateLimitPolicy {
    /// Fixed policy of the limiter that gates the daemon's own messages.
    pub const INTERNAL: RateLimitPolicy = RateLimitPolicy { burst: 5, interval_ms: 500 };

    pub fn new(burst: u32, interval_ms: u64) -> Self {
        Self { burst, interval_ms }
    }

    pub fn unlimited() -> Self {
        Self { burst: 0, interval_ms: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval_ms == 0 || self.burst == 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_matches_syslog_codes() {
        assert!(Severity::Debug > Severity::Error);
        assert!(Severity::Emergency < Severity::Warning);
        assert_eq!(Severity::from_code(3), Some(Severity::Error));
        assert_eq!(Severity::from_code(8), None);
        assert_eq!(Severity::Warning.code(), 4);
    }

    #[test]
    fn test_block_budget() {
        let timeout = Duration::from_secs(5);
        assert_eq!(FlowControl::NoDelay.block_budget(timeout), Duration::ZERO);
        assert_eq!(FlowControl::LightDelay.block_budget(timeout), LIGHT_DELAY_CEILING);
        assert_eq!(FlowControl::FullDelay.block_budget(timeout), timeout);
        assert!(!FlowControl::NoDelay.may_block());
    }

    #[test]
    fn test_derived_watermarks() {
        let config = QueueConfig::in_memory(1000);
        assert_eq!(config.low_watermark(), 700);
        assert_eq!(config.high_watermark(), 900);
        assert_eq!(config.discard_mark(), 980);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_watermark_ordering_rejected() {
        let config = QueueConfig {
            low_watermark: Some(90),
            high_watermark: Some(50),
            ..QueueConfig::in_memory(100)
        };
        assert!(config.check().is_err());
        assert!(config.with_derived_watermarks().check().is_ok());

        let config = QueueConfig {
            discard_mark: Some(150),
            ..QueueConfig::in_memory(100)
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_discard_above_high_is_valid() {
        let config = QueueConfig {
            low_watermark: Some(40),
            high_watermark: Some(80),
            discard_mark: Some(90),
            discard_severity: Some(Severity::Error),
            ..QueueConfig::in_memory(100)
        };
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_message_builder() {
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        let msg = Message::new("hello")
            .with_ruleset("remote")
            .from_peer(addr)
            .needing_parse();
        assert_eq!(msg.ruleset_name(), Some("remote"));
        assert!(msg.flags.needs_acl_check);
        assert!(msg.flags.needs_parsing);
        assert_eq!(msg.payload(), "hello");
    }

    #[test]
    fn test_queue_config_from_toml() {
        let config: QueueConfig = toml::from_str(
            r#"
            size = 500
            discard_severity = "warning"
            file_prefix = "mainq"
            "#,
        )
        .unwrap();
        assert_eq!(config.size, 500);
        assert_eq!(config.discard_severity, Some(Severity::Warning));
        assert_eq!(config.file_prefix.as_deref(), Some("mainq"));
        assert_eq!(config.dequeue_batch_size, 32);
    }
}
