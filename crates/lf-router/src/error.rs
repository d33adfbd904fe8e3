use lf_config::ConfigError;
use lf_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

/// Failure reported by an action or reload hook.
#[derive(Error, Debug, Clone)]
#[error("{action}: {reason}")]
pub struct ActionError {
    pub action: String,
    pub reason: String,
}

impl ActionError {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty message")]
    Empty,

    #[error("Malformed PRI header: {0}")]
    MalformedPri(String),

    #[error("Rejected by parser {parser}: {reason}")]
    Rejected { parser: String, reason: String },
}

#[derive(Error, Debug, Clone)]
#[error("Cannot resolve {subject}: {reason}")]
pub struct ResolveError {
    pub subject: String,
    pub reason: String,
}

impl ResolveError {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// A process-wide collaborator could not be set up.
#[derive(Error, Debug, Clone)]
#[error("Failed to initialize {collaborator}: {reason}")]
pub struct InitError {
    pub collaborator: &'static str,
    pub reason: String,
}
