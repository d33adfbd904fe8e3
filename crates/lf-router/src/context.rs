//! Process-wide daemon state, passed explicitly to whoever needs it.

use lf_common::{Message, RateLimitPolicy, Severity};
use lf_config::ConfigHandle;
use lf_queue::{EnqueueOutcome, QueueEnvironment};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::globals::Globals;
use crate::identity::HostIdentity;
use crate::internal::{internal_message, InternalBuffer, PROGRAM_NAME};
use crate::ratelimit::{Admission, RateLimiter};
use crate::router::Router;

pub struct DaemonContext {
    config: ConfigHandle,
    globals: Arc<Globals>,
    router: Arc<Router>,
    queue_env: QueueEnvironment,
    host: RwLock<Arc<HostIdentity>>,
    default_limiter: Arc<RateLimiter>,
    internal_limiter: Arc<RateLimiter>,
    internal_buffer: InternalBuffer,
    /// Written at startup and teardown, read by every submitter. A stale
    /// read only routes a message through the internal buffer.
    have_main_queue: AtomicBool,
    inputs_closed: AtomicBool,
}

impl DaemonContext {
    pub fn new(
        config: ConfigHandle,
        globals: Arc<Globals>,
        router: Arc<Router>,
        host: HostIdentity,
    ) -> Self {
        let snapshot = config.current();
        let default_limiter = globals.ratelimiters.create(PROGRAM_NAME, None, snapshot.ratelimit);
        let internal_limiter = globals.ratelimiters.insert(RateLimiter::internal(PROGRAM_NAME));

        Self {
            queue_env: QueueEnvironment::new(snapshot.global.work_directory()),
            internal_buffer: InternalBuffer::new(snapshot.global.internal_buffer_capacity),
            config,
            globals,
            router,
            host: RwLock::new(Arc::new(host)),
            default_limiter,
            internal_limiter,
            have_main_queue: AtomicBool::new(false),
            inputs_closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn queue_env(&self) -> &QueueEnvironment {
        &self.queue_env
    }

    pub fn host(&self) -> Arc<HostIdentity> {
        self.host.read().clone()
    }

    pub fn set_host(&self, host: HostIdentity) {
        *self.host.write() = Arc::new(host);
    }

    pub fn default_limiter(&self) -> &Arc<RateLimiter> {
        &self.default_limiter
    }

    pub fn internal_limiter(&self) -> &Arc<RateLimiter> {
        &self.internal_limiter
    }

    /// Creates and registers an additional limiter, e.g. one per input.
    pub fn create_limiter(&self, owner: &str, sub_tag: Option<&str>, policy: RateLimitPolicy) -> Arc<RateLimiter> {
        self.globals.ratelimiters.create(owner, sub_tag, policy)
    }

    pub fn internal_buffer(&self) -> &InternalBuffer {
        &self.internal_buffer
    }

    pub fn has_main_queue(&self) -> bool {
        self.have_main_queue.load(Ordering::Acquire)
    }

    pub fn set_main_queue_available(&self, available: bool) {
        self.have_main_queue.store(available, Ordering::Release);
    }

    /// Once set, inputs may no longer submit.
    pub fn inputs_closed(&self) -> bool {
        self.inputs_closed.load(Ordering::Acquire)
    }

    pub fn close_inputs(&self) {
        self.inputs_closed.store(true, Ordering::Release);
    }

    /// Emits one of the daemon's own messages.
    ///
    /// The text is mirrored to the tracing log. With a main queue it goes
    /// through the internal limiter into the queue; without one it waits in
    /// the internal buffer.
    pub async fn log_internal(&self, severity: Severity, err_code: Option<i32>, text: &str) {
        match severity {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
                error!(code = ?err_code, "{}", text)
            }
            Severity::Warning => warn!(code = ?err_code, "{}", text),
            Severity::Notice | Severity::Info => info!(code = ?err_code, "{}", text),
            Severity::Debug => debug!(code = ?err_code, "{}", text),
        }
        if severity <= Severity::Error && self.config.current().global.internal_errors_to_stderr {
            eprintln!("{}: {}", PROGRAM_NAME, text);
        }

        let message = internal_message(severity, err_code, text, Some(self.host().hostname.clone()));
        if !self.has_main_queue() {
            self.internal_buffer.push(message);
            return;
        }
        if self.internal_limiter.admit(&message) == Admission::Suppressed {
            return;
        }
        self.enqueue_internal(message).await;
    }

    async fn enqueue_internal(&self, message: Message) {
        match self.router.submit(message.clone()).await {
            Ok(EnqueueOutcome::Enqueued | EnqueueOutcome::Spilled) => {}
            Ok(outcome) => debug!(?outcome, "Internal message not queued"),
            // main queue went away between the flag check and the submit
            Err(_) => {
                self.internal_buffer.push(message);
            }
        }
    }

    /// Moves buffered internal messages into the main queue through the
    /// default limiter. Returns how many were queued.
    pub async fn drain_internal_buffer(&self) -> usize {
        let mut buffered = self.internal_buffer.drain().into_iter();
        let mut queued = 0;
        while let Some(message) = buffered.next() {
            if self.default_limiter.admit(&message) == Admission::Suppressed {
                continue;
            }
            match self.router.submit(message).await {
                Ok(outcome) if outcome.is_accepted() => queued += 1,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Cannot drain internal buffer");
                    for rest in buffered {
                        self.internal_buffer.push(rest);
                    }
                    break;
                }
            }
        }
        if self.internal_buffer.dropped() > 0 {
            warn!(dropped = self.internal_buffer.dropped(), "Internal messages were dropped before the main queue existed");
        }
        queued
    }
}
