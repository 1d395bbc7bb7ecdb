//! Channel receiver base shared by bus-driven components

use std::time::Duration;

use crate::bus::{Channel, MessageBus, Subscription};
use crate::error::BusError;
use crate::traits::{Shutdown, ShutdownFlag};
use crate::types::{BusMessage, DiscoveryMarker, PeerAddress, PeerRole};

/// Peer data learned from `bootstrap` during one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkData {
    pub gateway: Option<PeerAddress>,
    pub boiler: Option<PeerAddress>,
    pub app_identity: Option<String>,
    pub serial: Option<String>,
    pub system_code: Option<String>,
}

impl NetworkData {
    /// Record what a bus message says about the peers; returns false for
    /// messages that carry no peer data
    pub fn apply(&mut self, msg: &BusMessage) -> bool {
        match msg {
            BusMessage::Peer(announcement) => {
                let slot = match announcement.role {
                    PeerRole::Gateway => &mut self.gateway,
                    PeerRole::Boiler => &mut self.boiler,
                };
                // first announcement wins for the whole session
                if slot.is_none() {
                    *slot = Some(announcement.address);
                }
                true
            }
            BusMessage::Marker(DiscoveryMarker::AppIdentity(value)) => {
                self.app_identity = Some(value.clone());
                true
            }
            BusMessage::Marker(DiscoveryMarker::Serial(value)) => {
                self.serial = Some(value.clone());
                true
            }
            BusMessage::Marker(DiscoveryMarker::SystemCode(value)) => {
                self.system_code = Some(value.clone());
                true
            }
            _ => false,
        }
    }
}

/// Subscribes to a bus channel on behalf of a component and accumulates the
/// peer data seen there
pub struct ChannelReceiver {
    name: String,
    bus: MessageBus,
    subscription: Option<Subscription>,
    data: NetworkData,
    shutdown: ShutdownFlag,
}

impl ChannelReceiver {
    /// Create a receiver, not yet subscribed
    pub fn new(name: impl Into<String>, bus: MessageBus, shutdown: ShutdownFlag) -> Self {
        Self {
            name: name.into(),
            bus,
            subscription: None,
            data: NetworkData::default(),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn data(&self) -> &NetworkData {
        &self.data
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe to `channel`, replacing any previous subscription
    pub fn subscribe(&mut self, channel: Channel) {
        self.subscription = Some(self.bus.subscribe(channel, self.name.clone()));
    }

    pub fn unsubscribe(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.bus.unsubscribe(subscription);
        }
    }

    /// Wait at most `timeout` for one message and fold it into the peer
    /// data. `Ok(None)` means the wait timed out.
    pub async fn handle(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let Some(subscription) = self.subscription.as_ref() else {
            return Err(BusError::Closed(self.name.clone()));
        };

        let msg = tokio::select! {
            _ = self.shutdown.requested() => return Err(BusError::ShutdownRequested),
            msg = subscription.listen(timeout) => msg,
        };

        if let Some(msg) = &msg {
            if self.data.apply(msg) {
                tracing::debug!("{} learned {:?}", self.name, msg);
            }
        }
        Ok(msg)
    }

    /// Keep handling messages until `ready` holds for the peer data, giving
    /// up when shutdown is requested
    pub async fn wait_for<F>(&mut self, poll: Duration, ready: F) -> Result<(), BusError>
    where
        F: Fn(&NetworkData) -> bool,
    {
        while !ready(&self.data) {
            if self.shutdown.is_requested() {
                return Err(BusError::ShutdownRequested);
            }
            if self.handle(poll).await?.is_none() {
                tracing::trace!("{} still waiting on {:?}", self.name, self.subscription);
            }
        }
        Ok(())
    }
}

impl Shutdown for ChannelReceiver {
    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}
