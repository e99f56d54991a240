//! Shutdown coordination shared by the emitter and the materializer.
//!
//! The first trigger wins: its reason decides the exit code, and later
//! triggers only log. Cleanup actions run once, in the order they were
//! registered.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the process is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS signal asked the process to stop
    Signal(String),
    /// An unrecoverable error stopped the run
    Fault(String),
}

impl ShutdownReason {
    /// Process exit status for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Signal(_) => 0,
            ShutdownReason::Fault(_) => 1,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {}", name),
            ShutdownReason::Fault(message) => write!(f, "fault: {}", message),
        }
    }
}

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Records the shutdown reason and runs registered cleanup actions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    actions: Mutex<Option<Vec<(String, CleanupAction)>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            actions: Mutex::new(Some(Vec::new())),
        }
    }

    /// Token cancelled on the first trigger
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown. Only the first reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock();
        match slot.as_ref() {
            Some(existing) => {
                debug!("Ignoring shutdown ({}), already stopping: {}", reason, existing);
            }
            None => {
                info!("Shutting down: {}", reason);
                *slot = Some(reason);
                self.token.cancel();
            }
        }
    }

    /// The recorded reason, if shutdown was triggered
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    /// Exit status: 0 when not triggered or stopped by a signal, 1 after a fault
    pub fn exit_code(&self) -> i32 {
        self.reason().map(|r| r.exit_code()).unwrap_or(0)
    }

    /// Register a named cleanup action. Actions registered after cleanup has
    /// run are dropped with a warning.
    pub fn register<F, Fut>(&self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut actions = self.actions.lock();
        match actions.as_mut() {
            Some(list) => {
                let boxed: CleanupAction = Box::new(move || Box::pin(action()));
                list.push((name.to_string(), boxed));
            }
            None => warn!("Cleanup already ran, dropping action '{}'", name),
        }
    }

    /// Run every registered action once, in registration order.
    pub async fn run_cleanup(&self) {
        let actions = self.actions.lock().take();
        let Some(actions) = actions else {
            debug!("Cleanup already ran");
            return;
        };

        for (name, action) in actions {
            debug!("Running cleanup: {}", name);
            action().await;
        }
    }
}

/// Wait for SIGINT or SIGTERM and return the signal's name.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!(signal = name, "Signal received");
    Ok(name)
}

/// Wait for ctrl-c and return the signal's name.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "Signal received");
    Ok("ctrl-c")
}
