//! LogFlow Configuration System
//!
//! TOML-based daemon configuration with environment variable overrides.
//! A loaded configuration is validated once; problems that older configs
//! commonly carry are repaired in place and reported, which marks the
//! configuration as unclean.

use lf_common::{QueueConfig, RateLimitPolicy};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub global: GlobalConfig,
    pub main_queue: QueueConfig,
    /// Policy of the default limiter applied to unclassified submissions.
    pub ratelimit: RateLimitPolicy,
    pub rulesets: Vec<RulesetConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding disk-assist queue files.
    pub work_directory: String,
    /// Exit with code 2 instead of running a repaired configuration.
    pub abort_on_unclean_config: bool,
    /// Emit start/HUP/exit status messages into the message stream.
    pub log_status_messages: bool,
    /// Echo internal messages of error severity or worse to stderr.
    pub internal_errors_to_stderr: bool,
    /// Overrides the resolved local host name.
    pub local_hostname: Option<String>,
    pub shutdown_grace_ms: u64,
    /// Internal messages held while no main queue exists.
    pub internal_buffer_capacity: usize,
    pub input_join_timeout_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            work_directory: "./spool".to_string(),
            abort_on_unclean_config: false,
            log_status_messages: true,
            internal_errors_to_stderr: false,
            local_hostname: None,
            shutdown_grace_ms: 50,
            internal_buffer_capacity: 1_000,
            input_join_timeout_ms: 5_000,
        }
    }
}

impl GlobalConfig {
    pub fn work_directory(&self) -> PathBuf {
        PathBuf::from(&self.work_directory)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn input_join_timeout(&self) -> Duration {
        Duration::from_millis(self.input_join_timeout_ms)
    }
}

/// A named routing target. Without its own queue, matching messages are
/// processed on the main queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RulesetConfig {
    pub name: String,
    pub queue: Option<QueueConfig>,
}

/// Problems found (and repaired) by [`DaemonConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    fn push(&mut self, issue: String) {
        warn!(issue = %issue, "Configuration repaired");
        self.issues.push(issue);
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    pub fn ruleset(&self, name: &str) -> Option<&RulesetConfig> {
        self.rulesets.iter().find(|r| r.name == name)
    }

    /// Repairs what can be repaired and reports every change made.
    ///
    /// Repairs: invalid watermark ordering falls back to derived watermarks,
    /// zero sizes and counts fall back to defaults or 1, out-of-range dequeue
    /// windows are cleared, unnamed and duplicate rulesets are dropped (the
    /// first definition of a name wins).
    pub fn validate(&mut self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.global.work_directory.trim().is_empty() {
            report.push("global: empty work_directory, using current directory".to_string());
            self.global.work_directory = ".".to_string();
        }
        if self.global.internal_buffer_capacity == 0 {
            let fallback = GlobalConfig::default().internal_buffer_capacity;
            report.push(format!("global: internal_buffer_capacity must be positive, using {}", fallback));
            self.global.internal_buffer_capacity = fallback;
        }

        repair_queue("main_queue", &mut self.main_queue, &mut report);

        let mut seen = HashSet::new();
        let mut rulesets = Vec::with_capacity(self.rulesets.len());
        for mut ruleset in std::mem::take(&mut self.rulesets) {
            if ruleset.name.trim().is_empty() {
                report.push("rulesets: ruleset without a name dropped".to_string());
                continue;
            }
            if !seen.insert(ruleset.name.clone()) {
                report.push(format!("rulesets: duplicate ruleset '{}' dropped", ruleset.name));
                continue;
            }
            if let Some(queue) = ruleset.queue.as_mut() {
                repair_queue(&format!("ruleset '{}' queue", ruleset.name), queue, &mut report);
            }
            rulesets.push(ruleset);
        }
        self.rulesets = rulesets;

        report
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# LogFlow Configuration
# LOGFLOW_* environment variables override these settings

[global]
work_directory = "./spool"
abort_on_unclean_config = false
log_status_messages = true
internal_errors_to_stderr = false
# local_hostname = "loghost"
shutdown_grace_ms = 50
internal_buffer_capacity = 1000
input_join_timeout_ms = 5000

[main_queue]
size = 100000
# high_watermark = 90000     # default: 90% of size
# low_watermark = 70000      # default: 70% of size
# discard_mark = 98000       # default: 98% of size
# discard_severity = "debug" # shed debug messages above the discard mark
dequeue_batch_size = 32
worker_threads = 2
min_msgs_per_worker = 1000
timeout_enqueue_ms = 2000
timeout_shutdown_ms = 1500
timeout_action_completion_ms = 1000
timeout_worker_shutdown_ms = 60000
enqueue_slowdown_us = 0
dequeue_slowdown_us = 0
# file_prefix = "mainq"      # enables disk assistance
max_disk_space = 0
persist_update_count = 0
sync_queue_files = false
save_on_shutdown = false
# dequeue_time_begin = 1
# dequeue_time_end = 5

[ratelimit]
burst = 0        # 0 disables the default limiter
interval_ms = 0

[[rulesets]]
name = "remote"

[rulesets.queue]
size = 10000
worker_threads = 1
"#
        .to_string()
    }
}

fn repair_queue(scope: &str, queue: &mut QueueConfig, report: &mut ValidationReport) {
    let defaults = QueueConfig::default();
    if queue.size == 0 {
        report.push(format!("{}: size must be positive, using {}", scope, defaults.size));
        queue.size = defaults.size;
    }
    if queue.dequeue_batch_size == 0 {
        report.push(format!("{}: dequeue_batch_size must be positive, using 1", scope));
        queue.dequeue_batch_size = 1;
    }
    if queue.worker_threads == 0 {
        report.push(format!("{}: worker_threads must be positive, using 1", scope));
        queue.worker_threads = 1;
    }
    let bad_hour = [queue.dequeue_time_begin, queue.dequeue_time_end]
        .into_iter()
        .flatten()
        .any(|hour| hour > 24);
    if bad_hour {
        report.push(format!("{}: dequeue window hour out of range, window disabled", scope));
        queue.dequeue_time_begin = None;
        queue.dequeue_time_end = None;
    }
    if let Err(reason) = queue.check() {
        report.push(format!("{}: {}, using derived watermarks", scope, reason));
        *queue = std::mem::take(queue).with_derived_watermarks();
    }
}

/// Shared view of the active configuration.
///
/// Readers hold an `Arc` snapshot; a reload swaps in a new snapshot and
/// never touches the one readers already have.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<DaemonConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<DaemonConfig> {
        self.current.read().clone()
    }

    /// Installs `config` and returns the previous snapshot.
    pub fn replace(&self, config: DaemonConfig) -> Arc<DaemonConfig> {
        std::mem::replace(&mut *self.current.write(), Arc::new(config))
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(DaemonConfig::default())
    }
}
