use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Process-wide bookkeeping of disk-assist file prefixes.
///
/// A prefix that is already taken is renamed to `{n}-{prefix}-{queue}`
/// rather than rejected, so two queues never share a spill store.
#[derive(Debug, Default)]
pub struct QueueFileRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    names: Vec<String>,
    renames: u32,
}

impl QueueFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `prefix` for `queue_name` and returns the prefix actually assigned.
    pub fn claim(&self, prefix: &str, queue_name: Option<&str>) -> String {
        let mut state = self.inner.lock();
        let assigned = if state.names.iter().any(|n| n == prefix) {
            state.renames += 1;
            let renamed = format!("{}-{}-{}", state.renames, prefix, queue_name.unwrap_or("NONAME"));
            warn!(
                requested = prefix,
                assigned = %renamed,
                "Queue file name already in use, using a different name"
            );
            renamed
        } else {
            prefix.to_string()
        };
        state.names.push(assigned.clone());
        assigned
    }

    pub fn claimed(&self) -> Vec<String> {
        self.inner.lock().names.clone()
    }
}

/// Where disk-assisted queues keep their stores, shared by all queues of a process.
#[derive(Debug)]
pub struct QueueEnvironment {
    pub work_directory: PathBuf,
    pub files: QueueFileRegistry,
}

impl QueueEnvironment {
    pub fn new(work_directory: impl Into<PathBuf>) -> Self {
        Self {
            work_directory: work_directory.into(),
            files: QueueFileRegistry::new(),
        }
    }

    pub fn store_path(&self, prefix: &str) -> PathBuf {
        Path::new(&self.work_directory).join(format!("{}.qdb", prefix))
    }
}

impl Default for QueueEnvironment {
    fn default() -> Self {
        Self::new(".")
    }
}
