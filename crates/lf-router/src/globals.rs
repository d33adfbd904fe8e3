//! Process-wide collaborators.
//!
//! Initialized in a fixed dependency order and released in reverse. A
//! failure during initialization is fatal to the daemon; whatever was
//! already set up is released before the error is returned.

use dashmap::DashMap;
use indexmap::IndexMap;
use lf_common::RateLimitPolicy;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use crate::builtin::PriParser;
use crate::error::InitError;
use crate::preprocess::MessageParser;
use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Properties,
    Modules,
    Parsers,
    RateLimiters,
}

impl Collaborator {
    pub const INIT_ORDER: [Collaborator; 4] = [
        Collaborator::Properties,
        Collaborator::Modules,
        Collaborator::Parsers,
        Collaborator::RateLimiters,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collaborator::Properties => "property table",
            Collaborator::Modules => "module registry",
            Collaborator::Parsers => "parser registry",
            Collaborator::RateLimiters => "rate limiter subsystem",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interned string properties (host names, IPs, ruleset names).
#[derive(Debug, Default)]
pub struct PropertyTable {
    values: DashMap<String, Arc<str>>,
}

impl PropertyTable {
    /// Returns the shared copy of `value`.
    pub fn intern(&self, value: &str) -> Arc<str> {
        if let Some(existing) = self.values.get(value) {
            return existing.clone();
        }
        self.values
            .entry(value.to_string())
            .or_insert_with(|| Arc::from(value))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn clear(&self) {
        self.values.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Input,
    Parser,
    Action,
    Library,
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<IndexMap<String, ModuleKind>>,
}

impl ModuleRegistry {
    /// Returns false if a module of that name is already registered.
    pub fn register(&self, name: &str, kind: ModuleKind) -> bool {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            return false;
        }
        modules.insert(name.to_string(), kind);
        true
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    fn clear(&self) {
        self.modules.write().clear();
    }
}

/// Parsers by name; the first registered one is the default.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: RwLock<IndexMap<String, Arc<dyn MessageParser>>>,
}

impl ParserRegistry {
    pub fn register(&self, parser: Arc<dyn MessageParser>) {
        self.parsers.write().insert(parser.name().to_string(), parser);
    }

    /// Registers `parser` ahead of every other one.
    pub fn register_default(&self, parser: Arc<dyn MessageParser>) {
        self.parsers.write().shift_insert(0, parser.name().to_string(), parser);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageParser>> {
        self.parsers.read().get(name).cloned()
    }

    pub fn default_parser(&self) -> Option<Arc<dyn MessageParser>> {
        self.parsers.read().values().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.parsers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.parsers.write().clear();
    }
}

/// Every rate limiter created by the daemon, by name.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn create(&self, owner: &str, sub_tag: Option<&str>, policy: RateLimitPolicy) -> Arc<RateLimiter> {
        self.insert(RateLimiter::new(owner, sub_tag, policy))
    }

    pub fn insert(&self, limiter: RateLimiter) -> Arc<RateLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters.insert(limiter.name().to_string(), limiter.clone());
        limiter
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|l| l.clone())
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn clear(&self) {
        self.limiters.clear();
    }
}

#[derive(Default)]
pub struct Globals {
    pub properties: PropertyTable,
    pub modules: ModuleRegistry,
    pub parsers: ParserRegistry,
    pub ratelimiters: RateLimiterRegistry,
    live: Mutex<Vec<Collaborator>>,
}

impl Globals {
    pub fn initialize() -> Result<Arc<Self>, InitError> {
        Self::initialize_with(|_, _| Ok(()))
    }

    /// Sets up each collaborator in [`Collaborator::INIT_ORDER`], calling
    /// `setup` after the built-in part of each step.
    pub fn initialize_with<F>(mut setup: F) -> Result<Arc<Self>, InitError>
    where
        F: FnMut(Collaborator, &Globals) -> Result<(), String>,
    {
        let globals = Globals::default();
        for collaborator in Collaborator::INIT_ORDER {
            globals.live.lock().push(collaborator);
            globals.install_builtins(collaborator);
            if let Err(reason) = setup(collaborator, &globals) {
                error!(collaborator = %collaborator, reason = %reason, "Global initialization failed");
                globals.release();
                return Err(InitError {
                    collaborator: collaborator.as_str(),
                    reason,
                });
            }
            debug!(collaborator = %collaborator, "Initialized");
        }
        Ok(Arc::new(globals))
    }

    fn install_builtins(&self, collaborator: Collaborator) {
        match collaborator {
            Collaborator::Modules => {
                self.modules.register("builtin:pri", ModuleKind::Parser);
                self.modules.register("builtin:console", ModuleKind::Action);
                self.modules.register("builtin:allow-all", ModuleKind::Library);
            }
            Collaborator::Parsers => self.parsers.register(Arc::new(PriParser)),
            Collaborator::Properties | Collaborator::RateLimiters => {}
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.live.lock().len() == Collaborator::INIT_ORDER.len()
    }

    /// Releases every live collaborator in reverse order and returns that order.
    /// A second call releases nothing.
    pub fn release(&self) -> Vec<Collaborator> {
        let live = std::mem::take(&mut *self.live.lock());
        let mut released = Vec::with_capacity(live.len());
        for collaborator in live.into_iter().rev() {
            match collaborator {
                Collaborator::Properties => self.properties.clear(),
                Collaborator::Modules => self.modules.clear(),
                Collaborator::Parsers => self.parsers.clear(),
                Collaborator::RateLimiters => self.ratelimiters.clear(),
            }
            debug!(collaborator = %collaborator, "Released");
            released.push(collaborator);
        }
        released
    }
}
