//! Named rulesets and their registry.

use indexmap::IndexMap;
use lf_queue::MessageQueue;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::action::Action;

/// Name of the ruleset used for messages without a routing key.
pub const DEFAULT_RULESET: &str = "default";

/// Ordered action list plus an optional dedicated queue.
pub struct Ruleset {
    name: Arc<str>,
    actions: Vec<Arc<dyn Action>>,
    queue: RwLock<Option<Arc<MessageQueue>>>,
}

impl Ruleset {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            queue: RwLock::new(None),
        }
    }

    pub fn with_action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    /// The ruleset's own queue; `None` means messages are processed on the main queue.
    pub fn queue(&self) -> Option<Arc<MessageQueue>> {
        self.queue.read().clone()
    }

    pub fn attach_queue(&self, queue: Arc<MessageQueue>) {
        *self.queue.write() = Some(queue);
    }

    pub fn detach_queue(&self) -> Option<Arc<MessageQueue>> {
        self.queue.write().take()
    }
}

impl std::fmt::Debug for Ruleset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ruleset")
            .field("name", &self.name)
            .field("actions", &self.actions.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("has_queue", &self.queue.read().is_some())
            .finish()
    }
}

/// All rulesets of the running configuration, in definition order.
/// The default ruleset always exists.
pub struct RulesetRegistry {
    rulesets: RwLock<IndexMap<Arc<str>, Arc<Ruleset>>>,
}

impl RulesetRegistry {
    pub fn new() -> Self {
        let mut rulesets = IndexMap::new();
        let default = Arc::new(Ruleset::new(DEFAULT_RULESET));
        rulesets.insert(default.name.clone(), default);
        Self {
            rulesets: RwLock::new(rulesets),
        }
    }

    /// Adds `ruleset`, replacing any ruleset of the same name.
    pub fn register(&self, ruleset: Ruleset) -> Arc<Ruleset> {
        let ruleset = Arc::new(ruleset);
        let previous = self.rulesets.write().insert(ruleset.name.clone(), ruleset.clone());
        // the default placeholder is expected to be replaced
        if let Some(previous) = previous.filter(|p| !p.actions().is_empty() || p.name() != DEFAULT_RULESET) {
            warn!(ruleset = %previous.name(), "Ruleset redefined, previous definition replaced");
        }
        ruleset
    }

    pub fn get(&self, name: &str) -> Option<Arc<Ruleset>> {
        self.rulesets.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rulesets.read().contains_key(name)
    }

    pub fn default_ruleset(&self) -> Arc<Ruleset> {
        match self.get(DEFAULT_RULESET) {
            Some(ruleset) => ruleset,
            None => self.register(Ruleset::new(DEFAULT_RULESET)),
        }
    }

    /// Ruleset for a routing key. Unknown keys fall back to the default ruleset.
    pub fn resolve(&self, name: Option<&str>) -> Arc<Ruleset> {
        match name {
            Some(name) => self.get(name).unwrap_or_else(|| {
                debug!(ruleset = %name, "Unknown ruleset, using default");
                self.default_ruleset()
            }),
            None => self.default_ruleset(),
        }
    }

    pub fn all(&self) -> Vec<Arc<Ruleset>> {
        self.rulesets.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.rulesets.read().keys().map(|k| k.to_string()).collect()
    }
}

impl Default for RulesetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
