//! Long-lived relay components

use async_trait::async_trait;

use hp_core::Shutdown;

/// A unit of work the orchestrator starts once per session and stops
/// through its shutdown flag
#[async_trait]
pub trait Component: Shutdown + Send {
    /// Name used in logs and bus subscriptions
    fn name(&self) -> &str;

    /// Run until shutdown is requested or the component fails
    async fn run(self: Box<Self>) -> anyhow::Result<()>;
}
