//! Routing of messages to queues and action lists.
//!
//! A message belongs to exactly one queue at a time. During dispatch a
//! message whose ruleset owns a different queue is handed over to that
//! queue (and committed in the current batch); every other message runs
//! through its ruleset's actions.

use indexmap::IndexMap;
use lf_common::Message;
use lf_queue::{Batch, EnqueueOutcome, MessageQueue};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::action::Action;
use crate::error::ActionError;
use crate::metrics;
use crate::ruleset::{Ruleset, RulesetRegistry};
use crate::{Result, RouterError};

/// What a call to [`Router::dispatch`] did with the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handed over to another queue.
    pub forwarded: usize,
    /// Could not be handed over and were discarded.
    pub dropped: usize,
    /// Run through an action list.
    pub processed: usize,
    pub action_failures: usize,
}

/// Outcome of [`Router::iterate_actions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSweep {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Router {
    rulesets: RulesetRegistry,
    main_queue: RwLock<Option<Arc<MessageQueue>>>,
}

impl Router {
    pub fn new(rulesets: RulesetRegistry) -> Self {
        Self {
            rulesets,
            main_queue: RwLock::new(None),
        }
    }

    pub fn rulesets(&self) -> &RulesetRegistry {
        &self.rulesets
    }

    pub fn main_queue(&self) -> Option<Arc<MessageQueue>> {
        self.main_queue.read().clone()
    }

    /// Installs (or with `None`, removes) the main queue; returns the previous one.
    pub fn set_main_queue(&self, queue: Option<Arc<MessageQueue>>) -> Option<Arc<MessageQueue>> {
        std::mem::replace(&mut *self.main_queue.write(), queue)
    }

    /// Queue a message should be enqueued into: its ruleset's queue, else the main queue.
    pub fn queue_for(&self, message: &Message) -> Result<Arc<MessageQueue>> {
        let ruleset = self.rulesets.resolve(message.ruleset_name());
        ruleset
            .queue()
            .or_else(|| self.main_queue())
            .ok_or_else(|| RouterError::QueueUnavailable(ruleset.name().to_string()))
    }

    pub async fn submit(&self, message: Message) -> Result<EnqueueOutcome> {
        let queue = self.queue_for(&message)?;
        Ok(queue.enqueue(message).await?)
    }

    /// Enqueues all `messages` into the queue selected by the first one.
    /// The batch is never split across queues.
    pub async fn multi_submit(&self, messages: Vec<Message>) -> Result<Vec<EnqueueOutcome>> {
        let Some(first) = messages.first() else {
            return Ok(Vec::new());
        };
        let queue = self.queue_for(first)?;
        Ok(queue.multi_enqueue(messages).await?)
    }

    /// Forwards or processes every pending element of `batch`.
    ///
    /// `from_queue` is the [`MessageQueue::id`] of the queue the batch was
    /// taken from. Elements whose ruleset queue is that queue run locally.
    /// Forwarded elements are marked committed (the target queue owns them
    /// now), elements that could not be forwarded are marked discard, and
    /// processed elements stay pending for the caller to commit. A failing
    /// action does not stop the remaining actions.
    pub async fn dispatch(&self, batch: &mut Batch, from_queue: Option<u64>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut forwards: IndexMap<String, (Arc<MessageQueue>, Vec<usize>)> = IndexMap::new();
        let mut local: IndexMap<String, (Arc<Ruleset>, Vec<usize>)> = IndexMap::new();

        for (index, element) in batch.elements().iter().enumerate() {
            if !element.is_pending() {
                continue;
            }
            let ruleset = self.rulesets.resolve(element.message.ruleset_name());
            match ruleset.queue().filter(|q| Some(q.id()) != from_queue) {
                Some(queue) => forwards
                    .entry(queue.name().to_string())
                    .or_insert_with(|| (queue.clone(), Vec::new()))
                    .1
                    .push(index),
                None => local
                    .entry(ruleset.name().to_string())
                    .or_insert_with(|| (ruleset.clone(), Vec::new()))
                    .1
                    .push(index),
            }
        }

        for (name, (ruleset, indices)) in &local {
            let messages: Vec<&Message> = indices.iter().map(|&i| batch.message(i)).collect();
            summary.processed += messages.len();
            if ruleset.actions().is_empty() {
                debug!(ruleset = %name, count = messages.len(), "Ruleset has no actions");
                continue;
            }
            for action in ruleset.actions() {
                if let Err(e) = action.process_batch(&messages).await {
                    summary.action_failures += 1;
                    metrics::record_action_failure(action.name(), "process");
                    warn!(
                        ruleset = %name,
                        action = %action.name(),
                        error = %e,
                        "Action failed to process batch"
                    );
                }
            }
        }

        for (name, (queue, indices)) in forwards {
            let messages: Vec<Message> = indices.iter().map(|&i| batch.message(i).clone()).collect();
            match queue.multi_enqueue(messages).await {
                Ok(outcomes) => {
                    let mut accepted = 0;
                    for (&index, outcome) in indices.iter().zip(outcomes.iter()) {
                        if outcome.is_accepted() {
                            batch.mark_committed(index);
                            accepted += 1;
                        } else {
                            batch.mark_discard(index);
                            summary.dropped += 1;
                        }
                    }
                    summary.forwarded += accepted;
                    metrics::record_forwarded(&name, accepted);
                }
                Err(e) => {
                    warn!(queue = %name, error = %e, count = indices.len(), "Cannot forward to ruleset queue");
                    for &index in &indices {
                        batch.mark_discard(index);
                    }
                    summary.dropped += indices.len();
                }
            }
        }

        summary
    }

    /// Calls `f` once for every distinct action across all rulesets.
    /// Failures are logged and counted; the sweep always visits every action.
    pub async fn iterate_actions<F, Fut>(&self, hook: &'static str, mut f: F) -> ActionSweep
    where
        F: FnMut(Arc<dyn Action>) -> Fut,
        Fut: Future<Output = std::result::Result<(), ActionError>>,
    {
        let mut sweep = ActionSweep::default();
        let mut seen = HashSet::new();

        for ruleset in self.rulesets.all() {
            for action in ruleset.actions() {
                if !seen.insert(Arc::as_ptr(action) as *const () as usize) {
                    continue;
                }
                match f(action.clone()).await {
                    Ok(()) => sweep.succeeded += 1,
                    Err(e) => {
                        sweep.failed += 1;
                        metrics::record_action_failure(action.name(), hook);
                        warn!(
                            ruleset = %ruleset.name(),
                            action = %action.name(),
                            hook,
                            error = %e,
                            "Action hook failed"
                        );
                    }
                }
            }
        }
        sweep
    }

    pub async fn destroy_all_actions(&self) -> ActionSweep {
        self.iterate_actions("destroy", |action| async move { action.destroy().await })
            .await
    }
}
