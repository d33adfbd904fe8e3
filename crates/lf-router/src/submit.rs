//! Submission API used by inputs.

use lf_common::{FlowControl, Message};
use lf_queue::{EnqueueOutcome, QueueError};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::context::DaemonContext;
use crate::ratelimit::{Admission, RateLimiter};
use crate::{Result, RouterError};

#[derive(Debug)]
pub enum SubmitOutcome {
    Queued(EnqueueOutcome),
    /// Dropped by the rate limiter before reaching any queue.
    RateLimited,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Queued(outcome) if outcome.is_accepted())
    }
}

#[derive(Clone)]
pub struct Submitter {
    context: Arc<DaemonContext>,
}

impl Submitter {
    pub fn new(context: Arc<DaemonContext>) -> Self {
        Self { context }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.context.inputs_closed() {
            return Err(RouterError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Submits through the default rate limiter.
    pub async fn submit(&self, message: Message) -> Result<SubmitOutcome> {
        let limiter = self.context.default_limiter().clone();
        self.submit_with_limiter(&limiter, message).await
    }

    pub async fn submit_with_limiter(&self, limiter: &RateLimiter, message: Message) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        if limiter.admit(&message) == Admission::Suppressed {
            return Ok(SubmitOutcome::RateLimited);
        }
        let outcome = self.context.router().submit(message).await?;
        Ok(SubmitOutcome::Queued(outcome))
    }

    /// Enqueues a group of messages into the queue chosen by the first one.
    /// No rate limiting is applied.
    pub async fn multi_submit(&self, messages: Vec<Message>) -> Result<Vec<EnqueueOutcome>> {
        self.ensure_open()?;
        self.context.router().multi_submit(messages).await
    }

    /// Wraps `raw` in a message that still needs parsing and submits it.
    ///
    /// A routing target that no longer exists (unknown ruleset, or a queue
    /// already torn down) makes this a silent no-op.
    pub async fn parse_and_submit(
        &self,
        raw: &[u8],
        peer: Option<IpAddr>,
        ruleset: Option<&str>,
        flow_control: FlowControl,
    ) -> Result<()> {
        self.ensure_open()?;
        let properties = &self.context.globals().properties;

        let mut message = Message::new(raw.to_vec())
            .needing_parse()
            .with_flow_control(flow_control);
        if let Some(addr) = peer {
            message = message.from_peer(addr);
        }
        if let Some(name) = ruleset {
            if !self.context.router().rulesets().contains(name) {
                debug!(ruleset = %name, "Ruleset no longer exists, message ignored");
                return Ok(());
            }
            message = message.with_ruleset(properties.intern(name));
        }

        match self.context.router().submit(message).await {
            Ok(_) => Ok(()),
            Err(RouterError::QueueUnavailable(_)) | Err(RouterError::Queue(QueueError::Stopped(_))) => {
                debug!("Target queue gone, message ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
