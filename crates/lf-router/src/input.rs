//! Input seam: producers that run until told to stop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::submit::Submitter;

#[async_trait]
pub trait Input: Send + Sync {
    fn name(&self) -> &str;

    /// Produces messages until `shutdown` fires, then returns.
    async fn run(&self, submitter: Submitter, shutdown: broadcast::Receiver<()>);
}

/// The running inputs of the daemon.
pub struct InputSet {
    inputs: Vec<Arc<dyn Input>>,
    handles: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl InputSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inputs: Vec::new(),
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn add(&mut self, input: Arc<dyn Input>) {
        self.inputs.push(input);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn start(&mut self, submitter: &Submitter) {
        for input in &self.inputs {
            let name = input.name().to_string();
            let input = input.clone();
            let submitter = submitter.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            info!(input = %name, "Starting input");
            let handle = tokio::spawn(async move { input.run(submitter, shutdown_rx).await });
            self.handles.push((name, handle));
        }
    }

    /// Signals every input and waits for them. Inputs still running at the
    /// deadline are aborted. Returns how many stopped on their own.
    pub async fn stop(&mut self, timeout: Duration) -> usize {
        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        let joins = self.handles.drain(..).map(|(name, mut handle)| async move {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(input = %name, error = %e, "Input ended abnormally");
                    false
                }
                Err(_) => {
                    warn!(input = %name, "Input did not stop in time, aborting");
                    handle.abort();
                    // wait for the cancellation so no enqueue can land afterwards
                    let _ = handle.await;
                    false
                }
            }
        });
        futures::future::join_all(joins)
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count()
    }
}

impl Default for InputSet {
    fn default() -> Self {
        Self::new()
    }
}
