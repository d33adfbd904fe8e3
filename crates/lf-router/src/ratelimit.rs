//! Linux-kernel style rate limiting.
//!
//! Each limiter admits at most `burst` messages per `interval` window. A
//! fresh governor bucket is installed whenever a window closes, so unused
//! capacity never carries over. Suppressed messages are dropped by the
//! caller; when the next window opens a summary of how many were lost is
//! logged.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Bucket};
use lf_common::{Message, RateLimitPolicy, Severity};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

use crate::metrics;

/// Decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Suppressed,
}

struct Window {
    bucket: Bucket<NotKeyed, InMemoryState, DefaultClock>,
    quota: Quota,
    opened: Instant,
    suppressed: u64,
}

pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    severity_threshold: Option<Severity>,
    /// `None` when the policy is unlimited.
    window: Option<Mutex<Window>>,
    suppressed_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(owner: &str, sub_tag: Option<&str>, policy: RateLimitPolicy) -> Self {
        let name = match sub_tag {
            Some(sub) => format!("{}[{}]", owner, sub),
            None => owner.to_string(),
        };
        let window = window_quota(&policy).map(|quota| {
            Mutex::new(Window {
                bucket: Bucket::direct(quota),
                quota,
                opened: Instant::now(),
                suppressed: 0,
            })
        });
        Self {
            name,
            policy,
            severity_threshold: None,
            window,
            suppressed_total: AtomicU64::new(0),
        }
    }

    /// Limiter for the daemon's own messages, fixed at [`RateLimitPolicy::INTERNAL`].
    pub fn internal(owner: &str) -> Self {
        Self::new(owner, Some("internal"), RateLimitPolicy::INTERNAL)
    }

    /// Only messages at or above `severity` (i.e. as unimportant or less) are limited.
    pub fn with_severity_threshold(mut self, severity: Severity) -> Self {
        self.severity_threshold = Some(severity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn is_unlimited(&self) -> bool {
        self.window.is_none()
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total.load(Ordering::Relaxed)
    }

    pub fn admit(&self, message: &Message) -> Admission {
        let Some(window) = &self.window else {
            return Admission::Accepted;
        };
        if self.severity_threshold.is_some_and(|threshold| message.severity < threshold) {
            return Admission::Accepted;
        }

        let mut window = window.lock();
        let now = Instant::now();
        if now.duration_since(window.opened) >= self.policy.interval() {
            let lost = std::mem::take(&mut window.suppressed);
            if lost > 0 {
                warn!(limiter = %self.name, lost, "{} messages lost due to rate-limiting", lost);
            }
            window.bucket = Bucket::direct(window.quota);
            window.opened = now;
        }

        if window.bucket.check().is_ok() {
            Admission::Accepted
        } else {
            window.suppressed += 1;
            self.suppressed_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_suppressed(&self.name);
            Admission::Suppressed
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("severity_threshold", &self.severity_threshold)
            .finish()
    }
}

/// `burst` cells, one replenished per interval: a fresh bucket admits
/// exactly `burst` before the window closes.
fn window_quota(policy: &RateLimitPolicy) -> Option<Quota> {
    if policy.is_unlimited() {
        return None;
    }
    let burst = NonZeroU32::new(policy.burst)?;
    Quota::with_period(policy.interval()).map(|quota| quota.allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unlimited_policy_admits_everything() {
        let limiter = RateLimiter::new("imudp", None, RateLimitPolicy::unlimited());
        assert!(limiter.is_unlimited());
        for _ in 0..1000 {
            assert_eq!(limiter.admit(&Message::new("x")), Admission::Accepted);
        }
    }

    #[test]
    fn test_burst_then_suppress() {
        let limiter = RateLimiter::new("default", None, RateLimitPolicy::new(5, 500));
        let decisions: Vec<_> = (0..7).map(|_| limiter.admit(&Message::new("same"))).collect();

        assert_eq!(decisions.iter().filter(|d| **d == Admission::Accepted).count(), 5);
        assert_eq!(&decisions[5..], &[Admission::Suppressed, Admission::Suppressed]);
        assert_eq!(limiter.suppressed_total(), 2);
    }

    #[test]
    fn test_admission_resumes_after_interval() {
        let limiter = RateLimiter::new("default", None, RateLimitPolicy::new(2, 50));
        assert_eq!(limiter.admit(&Message::new("a")), Admission::Accepted);
        assert_eq!(limiter.admit(&Message::new("b")), Admission::Accepted);
        assert_eq!(limiter.admit(&Message::new("c")), Admission::Suppressed);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(limiter.admit(&Message::new("d")), Admission::Accepted);
        assert_eq!(limiter.admit(&Message::new("e")), Admission::Accepted);
        assert_eq!(limiter.admit(&Message::new("f")), Admission::Suppressed);
    }

    #[test]
    fn test_severity_threshold_exempts_important_messages() {
        let limiter = RateLimiter::new("default", None, RateLimitPolicy::new(1, 10_000))
            .with_severity_threshold(Severity::Info);

        assert_eq!(limiter.admit(&Message::new("a").with_severity(Severity::Info)), Admission::Accepted);
        assert_eq!(limiter.admit(&Message::new("b").with_severity(Severity::Debug)), Admission::Suppressed);
        assert_eq!(limiter.admit(&Message::new("c").with_severity(Severity::Error)), Admission::Accepted);
    }

    #[test]
    fn test_internal_limiter_name_and_policy() {
        let limiter = RateLimiter::internal("logflowd");
        assert_eq!(limiter.name(), "logflowd[internal]");
        assert_eq!(limiter.policy(), RateLimitPolicy::INTERNAL);
    }
}
