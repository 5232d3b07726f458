//! Exactly-once shutdown.
//!
//! Any component may ask to stop: rejection handlers, a failing job, the
//! agent once it runs out of work, or an OS signal. The first request flips
//! `disconnect_called` under the coordinator lock and runs the disconnect;
//! later requests are no-ops. Once the transport is disconnected the done
//! latch is set and [`ShutdownCoordinator::wait`] returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::state::SharedState;
use crate::transport::Transport;

/// Why the agent is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Normal end of work.
    Finished(String),
    /// SIGINT / SIGTERM.
    Interrupted,
    /// A fatal error funnelled into shutdown.
    Failed(String),
}

impl ShutdownReason {
    pub fn failed(err: &Error) -> Self {
        ShutdownReason::Failed(err.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ShutdownReason::Failed(_))
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Finished(msg) => write!(f, "finished: {msg}"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
            ShutdownReason::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Final result published on the done latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    /// Set when the transport reported an error while disconnecting.
    pub disconnect_error: Option<String>,
}

pub struct ShutdownCoordinator<T: Transport> {
    state: SharedState,
    transport: Arc<T>,
    done: Arc<watch::Sender<Option<ShutdownOutcome>>>,
}

impl<T: Transport> Clone for ShutdownCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            transport: Arc::clone(&self.transport),
            done: Arc::clone(&self.done),
        }
    }
}

impl<T: Transport> ShutdownCoordinator<T> {
    pub fn new(state: SharedState, transport: Arc<T>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            state,
            transport,
            done: Arc::new(done),
        }
    }

    /// Begin shutdown. Returns true for the call that actually started it.
    /// Must be called from within a Tokio runtime.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.disconnect_called {
                debug!(%reason, "shutdown already in progress");
                return false;
            }
            state.disconnect_called = true;
        }

        if reason.is_error() {
            error!(%reason, "shutting down");
        } else {
            info!(%reason, "shutting down");
        }

        let transport = Arc::clone(&self.transport);
        let done = Arc::clone(&self.done);
        tokio::spawn(async move {
            info!("disconnecting");
            let disconnect_error = match transport.disconnect().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "disconnect failed");
                    Some(e.to_string())
                }
            };
            info!("disconnected");
            done.send_replace(Some(ShutdownOutcome {
                reason,
                disconnect_error,
            }));
        });
        true
    }

    pub fn disconnect_requested(&self) -> bool {
        self.state.lock().disconnect_called
    }

    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        self.done.borrow().clone()
    }

    /// Block until the done latch is set.
    pub async fn wait(&self) -> ShutdownOutcome {
        let mut rx = self.done.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(latched) => latched.clone(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => None,
        };
        outcome.unwrap_or(ShutdownOutcome {
            reason: ShutdownReason::Failed("shutdown latch closed".to_string()),
            disconnect_error: None,
        })
    }

    /// Like [`wait`](Self::wait) with a deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ShutdownOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

/// Request an `Interrupted` shutdown on SIGINT or SIGTERM.
pub fn install_signal_handler<T: Transport>(shutdown: ShutdownCoordinator<T>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.request_shutdown(ShutdownReason::Interrupted);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        _ => {
            warn!("cannot install unix signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
