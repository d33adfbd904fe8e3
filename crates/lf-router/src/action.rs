//! Output action and lookup-table seams.
//!
//! Actions are owned by the host; rulesets only keep references to invoke
//! their batch entry point and lifecycle hooks.

use async_trait::async_trait;
use lf_common::Message;

use crate::error::ActionError;

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Processes the messages of one batch that were routed to this action.
    async fn process_batch(&self, messages: &[&Message]) -> Result<(), ActionError>;

    /// Called on HUP. Reopen files, reconnect, and so on.
    async fn reload(&self) -> Result<(), ActionError> {
        Ok(())
    }

    /// Called once during shutdown after the queues are gone; flush anything buffered.
    async fn destroy(&self) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Lookup tables referenced by actions; reloaded on HUP.
#[async_trait]
pub trait LookupTables: Send + Sync {
    fn name(&self) -> &str;

    async fn reload(&self) -> Result<(), ActionError>;
}
