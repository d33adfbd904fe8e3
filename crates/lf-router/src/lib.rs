//! LogFlow Router and Daemon Runtime
//!
//! This crate wires queues, rulesets and actions into a running daemon:
//! - Router: selects the queue for a message and dispatches batches to actions
//! - Preprocessor / BatchPipeline: sender authorization, parsing, dispatch and commit
//! - RateLimiter: fixed-window burst limiting with lost-message summaries
//! - DaemonContext: process-wide state and the daemon's own messages
//! - Submitter / InputSet: the producer-facing side
//! - LifecycleController: startup, HUP reload and ordered shutdown
//! - Signals: SIGHUP/SIGTERM/SIGINT forwarding with a repeated-signal abort

pub mod action;
pub mod builtin;
pub mod context;
pub mod error;
pub mod globals;
pub mod identity;
pub mod input;
pub mod internal;
pub mod lifecycle;
pub mod metrics;
pub mod preprocess;
pub mod ratelimit;
pub mod router;
pub mod ruleset;
pub mod signals;
pub mod submit;

pub use action::{Action, LookupTables};
pub use builtin::{AllowAllSenders, ConsoleAction, PriParser};
pub use context::DaemonContext;
pub use error::{ActionError, InitError, ParseError, ResolveError, RouterError};
pub use globals::{Collaborator, Globals};
pub use identity::{HostIdentity, HostResolver, SystemHostResolver};
pub use input::{Input, InputSet};
pub use lifecycle::{
    ControlHandle, ControlSignal, DaemonExit, HupReport, LifecycleController, LifecycleState,
    ShutdownSummary,
};
pub use preprocess::{
    BatchPipeline, MessageParser, PreprocessSummary, Preprocessor, ResolvedIdentity,
    SenderAuthorizer,
};
pub use ratelimit::{Admission, RateLimiter};
pub use router::{ActionSweep, DispatchSummary, Router};
pub use ruleset::{Ruleset, RulesetRegistry, DEFAULT_RULESET};
pub use signals::{spawn_signal_listener, TerminationCounter};
pub use submit::{SubmitOutcome, Submitter};

pub type Result<T> = std::result::Result<T, RouterError>;
