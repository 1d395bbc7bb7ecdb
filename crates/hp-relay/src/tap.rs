//! Bus tap: prints `info` and `track` traffic to stdout as JSON lines

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use hp_core::{BusMessage, Channel, MessageBus, Shutdown, ShutdownFlag, Subscription};

use crate::component::Component;

/// Consumer of the telemetry channels
pub struct BusTap {
    info: Subscription,
    track: Subscription,
    shutdown: ShutdownFlag,
}

impl BusTap {
    /// Subscribe to `info` and `track` right away
    pub fn new(bus: MessageBus) -> Self {
        Self {
            info: bus.subscribe(Channel::Info, "tap"),
            track: bus.subscribe(Channel::Track, "tap"),
            shutdown: ShutdownFlag::new(),
        }
    }
}

/// One output line: `{"channel": ..., "message": ...}`
pub fn format_line(channel: Channel, msg: &BusMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({
        "channel": channel.as_str(),
        "message": msg,
    }))
}

impl Shutdown for BusTap {
    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

#[async_trait]
impl Component for BusTap {
    fn name(&self) -> &str {
        "tap"
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let poll = std::time::Duration::from_secs(1);
        let mut stdout = tokio::io::stdout();
        loop {
            let (channel, msg) = tokio::select! {
                _ = self.shutdown.requested() => break,
                msg = self.info.listen(poll) => (Channel::Info, msg),
                msg = self.track.listen(poll) => (Channel::Track, msg),
            };
            let Some(msg) = msg else { continue };

            let mut line = format_line(channel, &msg).context("encoding tap line")?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await.context("writing tap line")?;
            stdout.flush().await.context("writing tap line")?;
        }

        let dropped = self.info.dropped() + self.track.dropped();
        if dropped > 0 {
            tracing::warn!("tap dropped {} messages", dropped);
        }
        Ok(())
    }
}
