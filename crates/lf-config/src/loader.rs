//! Configuration loader with file and environment variable support

use crate::{ConfigError, DaemonConfig, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "logflow.toml",
    "config.toml",
    "./config/logflow.toml",
    "/etc/logflow/logflow.toml",
];

/// Configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    ///
    /// The result is not validated; callers run [`DaemonConfig::validate`].
    pub fn load(&self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::default();

        if let Some(path) = self.find_config_file()? {
            info!(?path, "Loading configuration from file");
            config = DaemonConfig::from_file(&path)?;
        }

        apply_env_overrides(&mut config, |key| env::var(key).ok())?;

        Ok(config)
    }

    /// Find the configuration file to use.
    ///
    /// An explicitly requested file that does not exist is an error; the
    /// standard search paths are optional.
    fn find_config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ReadError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {} not found", path.display()),
            )));
        }

        if let Ok(path) = env::var("LOGFLOW_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(CONFIG_PATHS.iter().map(PathBuf::from).find(|path| path.exists()))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}

/// Apply `LOGFLOW_*` overrides read through `lookup`.
pub(crate) fn apply_env_overrides(
    config: &mut DaemonConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    // Global
    if let Some(val) = lookup("LOGFLOW_WORK_DIRECTORY") {
        config.global.work_directory = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_ABORT_ON_UNCLEAN_CONFIG")? {
        config.global.abort_on_unclean_config = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_LOG_STATUS_MESSAGES")? {
        config.global.log_status_messages = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_INTERNAL_ERRORS_TO_STDERR")? {
        config.global.internal_errors_to_stderr = val;
    }
    if let Some(val) = lookup("LOGFLOW_LOCAL_HOSTNAME") {
        config.global.local_hostname = Some(val);
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_SHUTDOWN_GRACE_MS")? {
        config.global.shutdown_grace_ms = val;
    }

    // Main queue
    if let Some(val) = parse_var(&lookup, "LOGFLOW_MAIN_QUEUE_SIZE")? {
        config.main_queue.size = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_MAIN_QUEUE_WORKERS")? {
        config.main_queue.worker_threads = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_MAIN_QUEUE_BATCH_SIZE")? {
        config.main_queue.dequeue_batch_size = val;
    }
    if let Some(val) = lookup("LOGFLOW_MAIN_QUEUE_FILE_PREFIX") {
        config.main_queue.file_prefix = Some(val).filter(|p| !p.is_empty());
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_MAIN_QUEUE_SAVE_ON_SHUTDOWN")? {
        config.main_queue.save_on_shutdown = val;
    }

    // Default rate limiter
    if let Some(val) = parse_var(&lookup, "LOGFLOW_RATELIMIT_BURST")? {
        config.ratelimit.burst = val;
    }
    if let Some(val) = parse_var(&lookup, "LOGFLOW_RATELIMIT_INTERVAL_MS")? {
        config.ratelimit.interval_ms = val;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = DaemonConfig::default();
        let lookup = lookup_from(&[
            ("LOGFLOW_WORK_DIRECTORY", "/var/spool/logflow"),
            ("LOGFLOW_MAIN_QUEUE_SIZE", "2048"),
            ("LOGFLOW_MAIN_QUEUE_FILE_PREFIX", "mainq"),
            ("LOGFLOW_RATELIMIT_BURST", "200"),
            ("LOGFLOW_RATELIMIT_INTERVAL_MS", "5000"),
            ("LOGFLOW_ABORT_ON_UNCLEAN_CONFIG", "true"),
        ]);

        apply_env_overrides(&mut config, lookup).unwrap();

        assert_eq!(config.global.work_directory, "/var/spool/logflow");
        assert_eq!(config.main_queue.size, 2048);
        assert_eq!(config.main_queue.file_prefix.as_deref(), Some("mainq"));
        assert_eq!(config.ratelimit.burst, 200);
        assert_eq!(config.ratelimit.interval_ms, 5000);
        assert!(config.global.abort_on_unclean_config);
    }

    #[test]
    fn test_invalid_env_value_is_error() {
        let mut config = DaemonConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[("LOGFLOW_MAIN_QUEUE_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let loader = ConfigLoader::with_path("/nonexistent/logflow.toml");
        assert!(matches!(loader.load(), Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logflow.toml");
        std::fs::write(&path, "[global]\nshutdown_grace_ms = 10\n").unwrap();

        let config = ConfigLoader::with_path(&path).load().unwrap();
        assert_eq!(config.global.shutdown_grace_ms, 10);
    }
}
