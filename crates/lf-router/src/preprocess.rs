//! Per-message preprocessing and the batch consumer built on it.
//!
//! For each pending element, in order: sender authorization (when the
//! message still needs its ACL check), then parsing (when it still needs
//! parsing). Either failure marks the element for discard. The shutdown
//! flag is checked between elements so a worker can abandon a batch.

use async_trait::async_trait;
use lf_common::Message;
use lf_queue::{Batch, BatchConsumer, ElementState, WorkerContext};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ParseError, ResolveError};
use crate::metrics;
use crate::router::Router;

/// Identity of a network peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub local_name: Arc<str>,
    pub fqdn: Arc<str>,
    pub ip: Arc<str>,
}

#[async_trait]
pub trait SenderAuthorizer: Send + Sync {
    async fn resolve_identity(&self, addr: IpAddr) -> Result<ResolvedIdentity, ResolveError>;

    fn is_allowed_sender(&self, protocol: &str, addr: IpAddr, resolved_name: &str) -> bool;
}

/// Turns a raw message into structured fields.
pub trait MessageParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, message: &mut Message) -> Result<(), ParseError>;
}

/// Counts for one preprocessing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub denied: usize,
    pub parse_failures: usize,
    pub unresolved: usize,
    /// The pass stopped early because shutdown was requested.
    pub abandoned: bool,
}

pub struct Preprocessor {
    authorizer: Arc<dyn SenderAuthorizer>,
    parser: Arc<dyn MessageParser>,
    protocol: &'static str,
}

impl Preprocessor {
    pub fn new(authorizer: Arc<dyn SenderAuthorizer>, parser: Arc<dyn MessageParser>) -> Self {
        Self {
            authorizer,
            parser,
            protocol: "UDP",
        }
    }

    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = protocol;
        self
    }

    pub async fn run(&self, batch: &mut Batch, worker: &WorkerContext) -> PreprocessSummary {
        let mut summary = PreprocessSummary::default();

        for index in 0..batch.len() {
            if worker.shutdown_requested() {
                summary.abandoned = true;
                break;
            }
            if batch.state(index) != ElementState::Pending {
                continue;
            }

            let message = batch.message_mut(index);
            if message.flags.needs_acl_check {
                match message.peer_addr {
                    Some(addr) => match self.authorizer.resolve_identity(addr).await {
                        Ok(identity) => {
                            if !self.authorizer.is_allowed_sender(self.protocol, addr, &identity.fqdn) {
                                debug!(peer = %addr, fqdn = %identity.fqdn, "Sender not permitted, message discarded");
                                metrics::record_preprocess_discard("denied");
                                batch.mark_discard(index);
                                summary.denied += 1;
                                continue;
                            }
                            message.hostname = Some(identity.local_name);
                            message.source_ip = Some(identity.ip);
                            message.flags.needs_acl_check = false;
                        }
                        Err(e) => {
                            // left as is: still routed, never parsed
                            debug!(peer = %addr, error = %e, "Cannot resolve sender, skipping preprocessing");
                            summary.unresolved += 1;
                            continue;
                        }
                    },
                    None => message.flags.needs_acl_check = false,
                }
            }

            let message = batch.message_mut(index);
            if message.flags.needs_parsing {
                match self.parser.parse(message) {
                    Ok(()) => message.flags.needs_parsing = false,
                    Err(e) => {
                        debug!(parser = %self.parser.name(), error = %e, "Message parse failed, discarded");
                        metrics::record_preprocess_discard("parse");
                        batch.mark_discard(index);
                        summary.parse_failures += 1;
                    }
                }
            }
        }
        summary
    }
}

/// Consumer bound to every queue of the daemon: preprocess, dispatch, commit.
pub struct BatchPipeline {
    preprocessor: Preprocessor,
    router: Arc<Router>,
}

impl BatchPipeline {
    pub fn new(preprocessor: Preprocessor, router: Arc<Router>) -> Self {
        Self { preprocessor, router }
    }
}

#[async_trait]
impl BatchConsumer for BatchPipeline {
    async fn consume(&self, batch: &mut Batch, worker: &WorkerContext) {
        let prepared = self.preprocessor.run(batch, worker).await;
        if prepared.abandoned {
            // pending elements go back to the queue
            return;
        }
        let summary = self.router.dispatch(batch, worker.queue_id()).await;
        batch.commit_pending();
        debug!(
            queue = %worker.queue_name(),
            worker = worker.worker_id(),
            processed = summary.processed,
            forwarded = summary.forwarded,
            denied = prepared.denied,
            parse_failures = prepared.parse_failures,
            "Batch dispatched"
        );
    }
}
