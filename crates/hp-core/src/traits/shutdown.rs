//! Cooperative shutdown capability
//!
//! Every long-lived component owns a [`ShutdownFlag`] and exposes it through
//! the [`Shutdown`] trait. The orchestrator requests shutdown; the component
//! observes it at its next bounded wait.

use tokio_util::sync::CancellationToken;

/// Shutdown flag shared between a component and whoever stops it
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(CancellationToken);

impl ShutdownFlag {
    /// Create a new, unset flag
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn request(&self) {
        self.0.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once shutdown is requested
    pub async fn requested(&self) {
        self.0.cancelled().await
    }
}

/// Shutdown-aware component
pub trait Shutdown {
    /// The component's flag
    fn shutdown_flag(&self) -> &ShutdownFlag;

    /// Ask the component to stop at its next wait
    fn request_shutdown(&self) {
        self.shutdown_flag().request();
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag().is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Worker {
        flag: ShutdownFlag,
    }

    impl Shutdown for Worker {
        fn shutdown_flag(&self) -> &ShutdownFlag {
            &self.flag
        }
    }

    #[test]
    fn test_request_shutdown() {
        let worker = Worker {
            flag: ShutdownFlag::new(),
        };
        assert!(!worker.is_shutdown_requested());
        worker.request_shutdown();
        assert!(worker.is_shutdown_requested());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        clone.request();
        assert!(flag.is_requested());
        assert!(!ShutdownFlag::default().is_requested());
    }

    #[tokio::test]
    async fn test_requested_resolves() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.requested().await });

        flag.request();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
