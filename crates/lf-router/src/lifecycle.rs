//! Daemon lifecycle controller.
//!
//! Sequences startup, HUP handling and shutdown:
//! - Initializing: global collaborators, host identity, rulesets and router
//! - Running: ruleset queues and the main queue started, buffered internal
//!   messages drained, inputs started, then the control loop
//! - ReloadPending: host identity re-resolved, config snapshot swapped,
//!   action and lookup-table reload hooks run; queues are untouched
//! - Terminating: inputs stopped and joined, exit message, grace delay,
//!   main queue then ruleset queues destroyed, actions destroyed, globals
//!   released in reverse order

use indexmap::IndexMap;
use lf_common::Severity;
use lf_config::{ConfigHandle, ConfigLoader, DaemonConfig};
use lf_queue::{MessageQueue, ShutdownReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::action::{Action, LookupTables};
use crate::builtin::AllowAllSenders;
use crate::context::DaemonContext;
use crate::error::InitError;
use crate::globals::{Collaborator, Globals};
use crate::identity::{HostIdentity, HostResolver, SystemHostResolver};
use crate::input::{Input, InputSet};
use crate::internal::origin_prefix;
use crate::preprocess::{BatchPipeline, MessageParser, Preprocessor, SenderAuthorizer};
use crate::router::{ActionSweep, Router};
use crate::ruleset::{Ruleset, RulesetRegistry, DEFAULT_RULESET};
use crate::submit::Submitter;
use crate::{Result, RouterError};

/// Upper bound of one idle wait of the control loop.
pub const CONTROL_LOOP_CEILING: Duration = Duration::from_secs(86_400);

pub const MAIN_QUEUE_NAME: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    ReloadPending,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Reload,
    /// Carries the signal number for the exit message.
    Terminate(i32),
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    Normal,
    /// Fatal initialization or unrecoverable runtime error.
    Fatal,
    /// Configuration needed repairs and `abort_on_unclean_config` is set.
    UncleanConfig,
}

impl DaemonExit {
    pub fn code(self) -> i32 {
        match self {
            DaemonExit::Normal => 0,
            DaemonExit::Fatal => 1,
            DaemonExit::UncleanConfig => 2,
        }
    }
}

/// Sends control signals to a running controller.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl ControlHandle {
    /// Returns false once the controller is gone.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn reload(&self) -> bool {
        self.send(ControlSignal::Reload)
    }

    pub fn terminate(&self, signal: i32) -> bool {
        self.send(ControlSignal::Terminate(signal))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HupReport {
    pub host: Option<Arc<HostIdentity>>,
    pub config_reloaded: bool,
    pub actions: ActionSweep,
    pub lookup_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    pub signal: i32,
    pub inputs_stopped: usize,
    pub main_queue: Option<ShutdownReport>,
    pub ruleset_queues: Vec<(String, ShutdownReport)>,
    pub actions: ActionSweep,
    pub released: Vec<Collaborator>,
}

type InitHook = Box<dyn FnMut(Collaborator, &Globals) -> std::result::Result<(), String> + Send + Sync>;

pub struct LifecycleController {
    state: LifecycleState,
    config: ConfigHandle,
    config_source: Option<ConfigLoader>,
    host_resolver: Arc<dyn HostResolver>,
    authorizer: Arc<dyn SenderAuthorizer>,
    parser: Option<Arc<dyn MessageParser>>,
    actions: Vec<(String, Arc<dyn Action>)>,
    lookup_tables: Vec<Arc<dyn LookupTables>>,
    inputs: InputSet,
    init_hook: Option<InitHook>,
    context: Option<Arc<DaemonContext>>,
    ruleset_queues: Vec<Arc<MessageQueue>>,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
    control_rx: mpsc::UnboundedReceiver<ControlSignal>,
}

impl LifecycleController {
    /// `config` is expected to be validated already.
    pub fn new(config: DaemonConfig) -> Self {
        let host_resolver = Arc::new(SystemHostResolver::new(config.global.local_hostname.clone()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            state: LifecycleState::Uninitialized,
            config: ConfigHandle::new(config),
            config_source: None,
            host_resolver,
            authorizer: Arc::new(AllowAllSenders),
            parser: None,
            actions: Vec::new(),
            lookup_tables: Vec::new(),
            inputs: InputSet::new(),
            init_hook: None,
            context: None,
            ruleset_queues: Vec::new(),
            control_tx,
            control_rx,
        }
    }

    /// Where HUP reloads the configuration from.
    pub fn with_config_source(mut self, loader: ConfigLoader) -> Self {
        self.config_source = Some(loader);
        self
    }

    pub fn with_host_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = resolver;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn SenderAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Registered ahead of the built-in parsers and used as the default.
    pub fn with_parser(mut self, parser: Arc<dyn MessageParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_action(mut self, ruleset: &str, action: Arc<dyn Action>) -> Self {
        self.actions.push((ruleset.to_string(), action));
        self
    }

    pub fn with_lookup_tables(mut self, tables: Arc<dyn LookupTables>) -> Self {
        self.lookup_tables.push(tables);
        self
    }

    pub fn with_input(mut self, input: Arc<dyn Input>) -> Self {
        self.inputs.add(input);
        self
    }

    /// Extra setup run after each global collaborator's built-in step.
    pub fn with_init_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(Collaborator, &Globals) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.init_hook = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn context(&self) -> Option<&Arc<DaemonContext>> {
        self.context.as_ref()
    }

    fn context_or_err(&self) -> Result<Arc<DaemonContext>> {
        self.context
            .clone()
            .ok_or_else(|| RouterError::QueueUnavailable("daemon not initialized".to_string()))
    }

    /// Sets up global collaborators, host identity, rulesets and the router.
    /// Any failure here is fatal.
    pub fn initialize(&mut self) -> std::result::Result<(), InitError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(InitError {
                collaborator: "lifecycle",
                reason: format!("cannot initialize from state {:?}", self.state),
            });
        }
        self.state = LifecycleState::Initializing;
        info!("Initializing daemon");

        let parser = self.parser.clone();
        let mut hook = self.init_hook.take();
        let globals = Globals::initialize_with(|collaborator, globals| {
            if collaborator == Collaborator::Parsers {
                if let Some(parser) = &parser {
                    globals.parsers.register_default(parser.clone());
                }
            }
            match hook.as_mut() {
                Some(hook) => hook(collaborator, globals),
                None => Ok(()),
            }
        })?;

        let host = match self.host_resolver.resolve() {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "Cannot resolve local host name, using localhost");
                HostIdentity::from_fqdn("localhost")
            }
        };
        info!(hostname = %host.hostname, fqdn = %host.fqdn, "Local host identity");

        let router = Arc::new(Router::new(self.build_rulesets()));
        self.context = Some(Arc::new(DaemonContext::new(
            self.config.clone(),
            globals,
            router,
            host,
        )));
        Ok(())
    }

    fn build_rulesets(&self) -> RulesetRegistry {
        let config = self.config.current();
        let mut definitions: IndexMap<String, Vec<Arc<dyn Action>>> = IndexMap::new();
        definitions.insert(DEFAULT_RULESET.to_string(), Vec::new());
        for ruleset in &config.rulesets {
            definitions.entry(ruleset.name.clone()).or_default();
        }
        for (name, action) in &self.actions {
            if !definitions.contains_key(name) {
                warn!(ruleset = %name, action = %action.name(), "Action bound to undeclared ruleset, ruleset created");
            }
            definitions.entry(name.clone()).or_default().push(action.clone());
        }

        let registry = RulesetRegistry::new();
        for (name, actions) in definitions {
            let ruleset = actions
                .into_iter()
                .fold(Ruleset::new(name.as_str()), |ruleset, action| ruleset.with_action(action));
            registry.register(ruleset);
        }
        registry
    }

    /// Starts the ruleset queues and the main queue, drains buffered
    /// internal messages, announces the start and starts the inputs.
    pub async fn start(&mut self) -> Result<()> {
        let ctx = self.context_or_err()?;
        if self.state != LifecycleState::Initializing {
            return Err(InitError {
                collaborator: "lifecycle",
                reason: format!("cannot start from state {:?}", self.state),
            }
            .into());
        }
        let config = self.config.current();

        let parser = ctx.globals().parsers.default_parser().ok_or_else(|| InitError {
            collaborator: Collaborator::Parsers.as_str(),
            reason: "no parser registered".to_string(),
        })?;
        let pipeline = Arc::new(BatchPipeline::new(
            Preprocessor::new(self.authorizer.clone(), parser),
            ctx.router().clone(),
        ));

        for ruleset_config in &config.rulesets {
            let Some(queue_config) = &ruleset_config.queue else {
                continue;
            };
            let Some(ruleset) = ctx.router().rulesets().get(&ruleset_config.name) else {
                continue;
            };
            let queue = MessageQueue::construct(ruleset_config.name.as_str(), queue_config.clone(), ctx.queue_env())?;
            queue.start(pipeline.clone()).await?;
            ruleset.attach_queue(queue.clone());
            self.ruleset_queues.push(queue);
        }

        let main_queue = MessageQueue::construct(MAIN_QUEUE_NAME, config.main_queue.clone(), ctx.queue_env())?;
        main_queue.start(pipeline).await?;
        ctx.router().set_main_queue(Some(main_queue));
        ctx.set_main_queue_available(true);

        let drained = ctx.drain_internal_buffer().await;
        if drained > 0 {
            debug!(drained, "Buffered internal messages queued");
        }

        if config.global.log_status_messages {
            ctx.log_internal(Severity::Info, None, &format!("{} start", origin_prefix()))
                .await;
        }

        self.inputs.start(&Submitter::new(ctx.clone()));
        self.state = LifecycleState::Running;
        info!(
            rulesets = ctx.router().rulesets().names().len(),
            ruleset_queues = self.ruleset_queues.len(),
            inputs = self.inputs.len(),
            "Daemon running"
        );
        Ok(())
    }

    /// Control loop. Returns after a termination signal has been handled.
    pub async fn run(&mut self) -> DaemonExit {
        loop {
            match tokio::time::timeout(CONTROL_LOOP_CEILING, self.control_rx.recv()).await {
                Ok(Some(ControlSignal::Reload)) => {
                    self.reload().await;
                }
                Ok(Some(ControlSignal::Terminate(signal))) => {
                    self.terminate(signal).await;
                    return DaemonExit::Normal;
                }
                Ok(None) => {
                    self.terminate(0).await;
                    return DaemonExit::Normal;
                }
                Err(_) => debug!("Control loop idle"),
            }
        }
    }

    /// HUP handling. In-flight work is not disturbed.
    pub async fn reload(&mut self) -> HupReport {
        let mut report = HupReport::default();
        let Ok(ctx) = self.context_or_err() else {
            warn!("Reload requested before initialization, ignored");
            return report;
        };
        self.state = LifecycleState::ReloadPending;
        info!("Reload requested");

        if self.config.current().global.log_status_messages {
            ctx.log_internal(
                Severity::Info,
                None,
                &format!("{} logflowd was HUPed", origin_prefix()),
            )
            .await;
        }

        match self.host_resolver.resolve() {
            Ok(host) => {
                ctx.set_host(host);
                report.host = Some(ctx.host());
            }
            Err(e) => warn!(error = %e, "Cannot re-resolve local host name, keeping previous"),
        }

        if let Some(loader) = &self.config_source {
            match loader.load() {
                Ok(mut config) => {
                    let validation = config.validate();
                    if !validation.is_clean() {
                        warn!(issues = validation.issues().len(), "Reloaded configuration was repaired");
                    }
                    self.config.replace(config);
                    report.config_reloaded = true;
                }
                Err(e) => {
                    ctx.log_internal(
                        Severity::Error,
                        None,
                        &format!("configuration reload failed, keeping current: {}", e),
                    )
                    .await;
                }
            }
        }

        report.actions = ctx
            .router()
            .iterate_actions("reload", |action| async move { action.reload().await })
            .await;

        for tables in &self.lookup_tables {
            if let Err(e) = tables.reload().await {
                report.lookup_failures += 1;
                warn!(tables = %tables.name(), error = %e, "Lookup table reload failed");
            }
        }

        self.state = LifecycleState::Running;
        info!(
            actions_reloaded = report.actions.succeeded,
            action_failures = report.actions.failed,
            lookup_failures = report.lookup_failures,
            "Reload complete"
        );
        report
    }

    /// Ordered shutdown. Each step runs only after the previous one finished.
    pub async fn terminate(&mut self, signal: i32) -> ShutdownSummary {
        let mut summary = ShutdownSummary {
            signal,
            ..Default::default()
        };
        if matches!(self.state, LifecycleState::Terminating | LifecycleState::Terminated) {
            return summary;
        }
        self.state = LifecycleState::Terminating;
        info!(signal, "Shutting down");

        let Some(ctx) = self.context.clone() else {
            self.state = LifecycleState::Terminated;
            return summary;
        };
        let config = self.config.current();

        ctx.close_inputs();
        summary.inputs_stopped = self.inputs.stop(config.global.input_join_timeout()).await;
        debug!(stopped = summary.inputs_stopped, "Inputs stopped");

        if config.global.log_status_messages {
            ctx.log_internal(
                Severity::Info,
                None,
                &format!("{} exiting on signal {}.", origin_prefix(), signal),
            )
            .await;
        }

        tokio::time::sleep(config.global.shutdown_grace()).await;

        if let Some(main_queue) = ctx.router().main_queue() {
            ctx.set_main_queue_available(false);
            summary.main_queue = destroy_queue(&main_queue).await;
            ctx.router().set_main_queue(None);
        }
        for queue in self.ruleset_queues.drain(..) {
            if let Some(report) = destroy_queue(&queue).await {
                summary.ruleset_queues.push((queue.name().to_string(), report));
            }
        }
        for ruleset in ctx.router().rulesets().all() {
            ruleset.detach_queue();
        }

        summary.actions = ctx.router().destroy_all_actions().await;
        summary.released = ctx.globals().release();

        self.state = LifecycleState::Terminated;
        info!(
            lost = summary.main_queue.as_ref().map_or(0, |r| r.lost),
            action_failures = summary.actions.failed,
            "Shutdown complete"
        );
        summary
    }
}

async fn destroy_queue(queue: &MessageQueue) -> Option<ShutdownReport> {
    match queue.destruct(true).await {
        Ok(report) => Some(report),
        Err(e) => {
            error!(queue = %queue.name(), error = %e, "Queue shutdown failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DaemonExit::Normal.code(), 0);
        assert_eq!(DaemonExit::Fatal.code(), 1);
        assert_eq!(DaemonExit::UncleanConfig.code(), 2);
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let mut controller = LifecycleController::new(DaemonConfig::default());
        controller.initialize().unwrap();
        assert_eq!(controller.state(), LifecycleState::Initializing);
        let err = controller.initialize().unwrap_err();
        assert_eq!(err.collaborator, "lifecycle");
    }

    #[test]
    fn test_failed_init_names_collaborator() {
        let mut controller = LifecycleController::new(DaemonConfig::default())
            .with_init_hook(|c, _| match c {
                Collaborator::Modules => Err("module path missing".to_string()),
                _ => Ok(()),
            });
        let err = controller.initialize().unwrap_err();
        assert_eq!(err.collaborator, "module registry");
        assert!(controller.context().is_none());
    }
}
