//! OS signal listener feeding the lifecycle controller.
//!
//! SIGHUP requests a reload. SIGTERM and SIGINT request termination; the
//! process aborts outright on the fifth termination signal in case the
//! orderly shutdown hangs.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::ControlHandle;

pub const TERMINATION_SIGNAL_LIMIT: u32 = 5;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

/// Counts termination signals received by the process.
#[derive(Debug)]
pub struct TerminationCounter {
    seen: AtomicU32,
    limit: u32,
}

impl TerminationCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            seen: AtomicU32::new(0),
            limit,
        }
    }

    /// Records one signal. Returns true once the limit is reached.
    pub fn record(&self) -> bool {
        self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit
    }

    pub fn seen(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }
}

impl Default for TerminationCounter {
    fn default() -> Self {
        Self::new(TERMINATION_SIGNAL_LIMIT)
    }
}

/// Installs the signal handlers and forwards signals to `control` until the
/// controller goes away.
#[cfg(unix)]
pub fn spawn_signal_listener(control: ControlHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let counter = TerminationCounter::default();

    Ok(tokio::spawn(async move {
        loop {
            let termination = tokio::select! {
                _ = hangup.recv() => None,
                _ = terminate.recv() => Some(SIGTERM),
                _ = interrupt.recv() => Some(SIGINT),
            };
            let delivered = match termination {
                None => {
                    info!("Received SIGHUP");
                    control.reload()
                }
                Some(signo) => forward_termination(&control, &counter, signo),
            };
            if !delivered {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(control: ControlHandle) -> std::io::Result<JoinHandle<()>> {
    let counter = TerminationCounter::default();
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !forward_termination(&control, &counter, SIGINT) {
                break;
            }
        }
    }))
}

fn forward_termination(control: &ControlHandle, counter: &TerminationCounter, signo: i32) -> bool {
    if counter.record() {
        error!(signal = signo, seen = counter.seen(), "Too many termination signals, aborting");
        std::process::abort();
    }
    if counter.seen() == 1 {
        info!(signal = signo, "Received termination signal, shutting down");
    } else {
        warn!(signal = signo, seen = counter.seen(), "Shutdown already in progress");
    }
    control.terminate(signo)
}
