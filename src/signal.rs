//! Signal handling for coarse cancellation.
//!
//! SIGINT and SIGTERM only raise a flag. The sequencer checks it between
//! modules, so an interrupted run stops at a module boundary and a re-run
//! resumes from there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Global flag indicating whether a shutdown has been requested.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(test)]
pub fn reset_shutdown() {
    SHUTDOWN_REQUESTED.store(false, Ordering::Relaxed);
}

/// Listens for SIGINT and SIGTERM for the life of the runtime.
///
/// If handlers cannot be registered (restricted containers), the guard is
/// still created and interruption falls back to the default behaviour.
pub struct ShutdownGuard {
    _marker: (),
}

impl ShutdownGuard {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };
            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            let name = match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => "SIGINT",
                        _ = term.recv() => "SIGTERM",
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    "SIGINT"
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    "SIGTERM"
                }
                (None, None) => {
                    warn!("No signal handlers registered; interruption is not graceful");
                    return;
                }
            };
            info!(
                "Received {}, stopping after the current module (re-run to resume)",
                name
            );
            request_shutdown();
        });

        Self { _marker: () }
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle passed to the sequencer.
///
/// Cancelled either directly or by the process-wide signal flag.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signals: true,
        }
    }

    /// A token that ignores the process-wide flag, for parallel tests.
    #[cfg(test)]
    pub fn isolated() -> Self {
        Self {
            follow_signals: false,
            ..Self::new()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || (self.follow_signals && is_shutdown_requested())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
