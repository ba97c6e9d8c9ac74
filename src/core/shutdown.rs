//! Process shutdown coordination
//!
//! The controller never calls `std::process::exit` itself: an `exit` command
//! (or a signal) records a reason here, the runner loop observes it, closes
//! its resources and hands the exit code back to the binary.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Records why the runner goes down and wakes everything waiting for it
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    /// First reason wins; later requests only log
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// Why the runner is going down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `exit` command from the worker
    ExitCommand(i32),
    /// SIGINT / SIGTERM
    Signal,
    /// The worker channel is gone for good
    ChannelClosed,
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::ExitCommand(code) => *code,
            ShutdownReason::Signal | ShutdownReason::ChannelClosed => 0,
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancelled once a reason is recorded; background loops select on it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown; returns false when a reason was already recorded
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut current = match self.reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = current.as_ref() {
                tracing::debug!("Shutdown already requested ({:?}), ignoring {:?}", existing, reason);
                return false;
            }
            tracing::info!(?reason, "shutdown requested");
            *current = Some(reason);
        }
        self.token.cancel();
        true
    }

    /// Request process exit with the given code
    pub fn request_exit(&self, code: i32) -> bool {
        self.shutdown(ShutdownReason::ExitCommand(code))
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        match self.reason.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Wait for shutdown and return its reason
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Signal)
    }

    /// Install system signal handlers (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::Signal);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert!(manager.reason().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(manager.request_exit(3));
        assert!(!manager.shutdown(ShutdownReason::Signal));
        assert_eq!(manager.reason(), Some(ShutdownReason::ExitCommand(3)));
        assert_eq!(manager.reason().unwrap().exit_code(), 3);
    }

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_reason() {
        let manager = ShutdownManager::new();
        let waiter = manager.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_shutdown().await });
        manager.request_exit(0);
        assert_eq!(handle.await.unwrap(), ShutdownReason::ExitCommand(0));
    }
}
