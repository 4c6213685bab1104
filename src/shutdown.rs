//! Cooperative shutdown for statecache
//!
//! A single [`Shutdown`] handle is cloned into every background task and the
//! HTTP server. Loops check [`Shutdown::is_triggered`] at the top of every
//! iteration and race their blocking awaits against [`Shutdown::wait`].

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Why the process is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// The log consumer loop stopped; the view can no longer be trusted
    ConsumerStopped,
    /// Requested from code, e.g. tests
    Requested,
}

impl ShutdownReason {
    /// Whether the process should exit with a failure status
    pub fn is_failure(self) -> bool {
        matches!(self, ShutdownReason::ConsumerStopped)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT (Ctrl+C)"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::ConsumerStopped => write!(f, "consumer stopped"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// Handle for triggering and observing shutdown
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<Option<ShutdownReason>>,
    receiver: watch::Receiver<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self { sender, receiver }
    }

    /// Trigger shutdown; the first reason wins
    pub fn trigger(&self, reason: ShutdownReason) {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Reason shutdown was triggered, if it was
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) -> ShutdownReason {
        let mut receiver = self.receiver.clone();
        loop {
            if let Some(reason) = *receiver.borrow_and_update() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                return ShutdownReason::Requested;
            }
        }
    }

    /// Sleep for `duration`, returning `false` if shutdown interrupted it
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }

    /// Run `fut` to completion unless shutdown is triggered first
    pub async fn run_until<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            out = fut => Some(out),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `shutdown` on SIGINT or SIGTERM
pub async fn listen_for_signals(shutdown: Shutdown) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownReason::Interrupt,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending().await
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                ShutdownReason::Terminate
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending().await
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownReason>();

    let reason = tokio::select! {
        reason = ctrl_c => reason,
        reason = terminate => reason,
        _ = shutdown.wait() => return,
    };

    tracing::info!(signal = %reason, "Received shutdown signal");
    shutdown.trigger(reason);
}
