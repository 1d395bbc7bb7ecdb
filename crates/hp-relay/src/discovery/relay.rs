//! One discovery relay per interface

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;

use hp_core::config::NetworkConfig;
use hp_core::{
    BusError, BusMessage, Channel, ChannelReceiver, MessageBus, PeerAddress, PeerRole, Shutdown,
    ShutdownFlag, TransportError,
};

use super::scan_markers;
use super::socket::{bind_udp, Interface};
use crate::component::Component;

/// Which peer's datagrams a relay listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    /// Listens on the gateway interface, rebroadcasts towards the boiler
    Gateway,
    /// Listens on the boiler interface, unicasts back to the gateway
    Boiler,
}

impl RelaySide {
    fn role(&self) -> PeerRole {
        match self {
            RelaySide::Gateway => PeerRole::Gateway,
            RelaySide::Boiler => PeerRole::Boiler,
        }
    }
}

/// Relays discovery datagrams from one interface to the other
pub struct DiscoveryRelay {
    name: String,
    side: RelaySide,
    /// Interface the relay listens on
    listen: Interface,
    /// Interface datagrams are forwarded through
    forward: Interface,
    network: NetworkConfig,
    bus_poll: Duration,
    bus: MessageBus,
    /// Boiler side only: subscribed to `bootstrap` from construction on
    receiver: Option<ChannelReceiver>,
    shutdown: ShutdownFlag,
}

impl DiscoveryRelay {
    /// Create a relay for `side`
    pub fn new(
        side: RelaySide,
        network: &NetworkConfig,
        bus_poll: Duration,
        bus: MessageBus,
    ) -> Result<Self, TransportError> {
        let gateway: Interface = network.gateway_interface.parse()?;
        let boiler: Interface = network.boiler_interface.parse()?;
        let (name, listen, forward) = match side {
            RelaySide::Gateway => ("gateway-discovery", gateway, boiler),
            RelaySide::Boiler => ("boiler-discovery", boiler, gateway),
        };

        let shutdown = ShutdownFlag::new();
        let receiver = match side {
            RelaySide::Gateway => None,
            RelaySide::Boiler => {
                let mut receiver = ChannelReceiver::new(name, bus.clone(), shutdown.clone());
                receiver.subscribe(Channel::Bootstrap);
                Some(receiver)
            }
        };

        Ok(Self {
            name: name.to_string(),
            side,
            listen,
            forward,
            network: network.clone(),
            bus_poll,
            bus,
            receiver,
            shutdown,
        })
    }

    pub fn side(&self) -> RelaySide {
        self.side
    }

    /// Wait for the gateway announcement; `None` if shutdown came first
    async fn wait_for_gateway(&mut self) -> Result<Option<PeerAddress>> {
        let Some(mut receiver) = self.receiver.take() else {
            anyhow::bail!("{} has no bootstrap subscription", self.name);
        };

        tracing::info!("{} waiting for the gateway address", self.name);
        match receiver
            .wait_for(self.bus_poll, |data| data.gateway.is_some())
            .await
        {
            Ok(()) => {}
            Err(BusError::ShutdownRequested) => return Ok(None),
            Err(e) => return Err(e).context("waiting for gateway discovery"),
        }
        receiver.unsubscribe();
        Ok(receiver.data().gateway)
    }

    /// Port the listening socket binds to
    fn listen_port(&self, gateway: Option<PeerAddress>) -> Result<u16> {
        match (self.side, gateway) {
            (RelaySide::Gateway, _) => Ok(self.network.discovery_port),
            (RelaySide::Boiler, Some(gateway)) => shift_down(gateway.port, self.network.port_delta()),
            (RelaySide::Boiler, None) => anyhow::bail!("boiler relay started without gateway address"),
        }
    }

    /// Socket and destination used to forward datagrams once `peer` (the
    /// peer this relay listens for) is known
    fn open_forwarder(
        &self,
        peer: PeerAddress,
        gateway: Option<PeerAddress>,
    ) -> Result<(UdpSocket, SocketAddr)> {
        let delta = self.network.port_delta();
        let (port, broadcast, destination) = match (self.side, gateway) {
            // rebroadcast from the gateway's own port so the boiler answers to it
            (RelaySide::Gateway, _) => (
                shift_down(peer.port, delta)?,
                true,
                SocketAddrV4::new(
                    self.network.broadcast_address,
                    self.network.discovery_port.saturating_add(delta),
                ),
            ),
            (RelaySide::Boiler, Some(gateway)) => (
                peer.port,
                false,
                SocketAddrV4::new(gateway.host, gateway.port),
            ),
            (RelaySide::Boiler, None) => anyhow::bail!("boiler relay has no gateway to answer"),
        };

        let socket = bind_udp(&self.forward, port, broadcast)
            .with_context(|| format!("{} forwarder on {}", self.name, self.forward))?;
        tracing::info!(
            "{} forwarding via {} port {} to {}",
            self.name,
            self.forward,
            port,
            destination
        );
        Ok((socket, SocketAddr::V4(destination)))
    }

    async fn relay(&self, socket: UdpSocket, gateway: Option<PeerAddress>) -> Result<()> {
        let mut buf = vec![0u8; self.network.buffer_size.max(512)];
        let mut peer: Option<PeerAddress> = None;
        let mut forwarder: Option<(UdpSocket, SocketAddr)> = None;

        loop {
            let received = tokio::select! {
                _ = self.shutdown.requested() => {
                    tracing::info!("{} stopping", self.name);
                    return Ok(());
                }
                res = tokio::time::timeout(self.network.socket_timeout, socket.recv_from(&mut buf)) => res,
            };

            let (len, from) = match received {
                Err(_) => {
                    tracing::trace!("{}: no datagram within {:?}", self.name, self.network.socket_timeout);
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::error!("{} receive failed: {}", self.name, e);
                    return Err(e).context(format!("{} receive", self.name));
                }
                Ok(Ok(received)) => received,
            };
            let data = &buf[..len];
            tracing::debug!("{} received {} bytes from {}", self.name, len, from);
            tracing::trace!("{} payload {:?}", self.name, String::from_utf8_lossy(data));

            if peer.is_none() {
                let Some(address) = PeerAddress::from_socket_addr(from) else {
                    tracing::warn!("{} ignoring non-IPv4 sender {}", self.name, from);
                    continue;
                };
                tracing::info!("{} discovered {} at {}", self.name, self.side.role(), address);
                self.bus
                    .publish(Channel::Bootstrap, BusMessage::peer(self.side.role(), address));
                peer = Some(address);
                forwarder = Some(self.open_forwarder(address, gateway)?);
            }

            for marker in scan_markers(data) {
                tracing::info!("{} marker {:?}", self.name, marker);
                self.bus.publish(Channel::Bootstrap, BusMessage::Marker(marker));
            }

            if let Some((sender, destination)) = &forwarder {
                if let Err(e) = sender.send_to(data, destination).await {
                    tracing::error!("{} forward to {} failed: {}", self.name, destination, e);
                    return Err(e).context(format!("{} forward", self.name));
                }
            }
        }
    }
}

fn shift_down(port: u16, delta: u16) -> Result<u16> {
    port.checked_sub(delta)
        .with_context(|| format!("port {} is below the same-host delta {}", port, delta))
}

impl Shutdown for DiscoveryRelay {
    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

#[async_trait]
impl Component for DiscoveryRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>) -> Result<()> {
        tracing::info!("{} started on {}", self.name, self.listen);

        let gateway = match self.side {
            RelaySide::Gateway => None,
            RelaySide::Boiler => match self.wait_for_gateway().await? {
                Some(gateway) => Some(gateway),
                None => return Ok(()),
            },
        };

        let port = self.listen_port(gateway)?;
        let socket = bind_udp(&self.listen, port, self.side == RelaySide::Gateway)
            .with_context(|| format!("{} listener on {}:{}", self.name, self.listen, port))?;
        tracing::info!("{} listening on {} port {}", self.name, self.listen, port);

        self.relay(socket, gateway).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sides_swap_interfaces() {
        let network = NetworkConfig {
            gateway_interface: "eth0".into(),
            boiler_interface: "eth1".into(),
            ..NetworkConfig::default()
        };
        let bus = MessageBus::new();

        let gateway = DiscoveryRelay::new(RelaySide::Gateway, &network, Duration::from_secs(1), bus.clone()).unwrap();
        assert_eq!(gateway.listen, Interface::Device("eth0".into()));
        assert_eq!(gateway.forward, Interface::Device("eth1".into()));

        let boiler = DiscoveryRelay::new(RelaySide::Boiler, &network, Duration::from_secs(1), bus).unwrap();
        assert_eq!(boiler.listen, Interface::Device("eth1".into()));
        assert_eq!(boiler.name(), "boiler-discovery");
    }

    #[test]
    fn test_boiler_listens_on_shifted_gateway_port() {
        let network = NetworkConfig {
            gateway_interface: "eth0".into(),
            boiler_interface: "eth0".into(),
            ..NetworkConfig::default()
        };
        let relay = DiscoveryRelay::new(RelaySide::Boiler, &network, Duration::from_secs(1), MessageBus::new()).unwrap();
        let gateway = PeerAddress::new(std::net::Ipv4Addr::new(192, 168, 1, 5), 50000);

        assert_eq!(relay.listen_port(Some(gateway)).unwrap(), 49900);
        assert!(relay.listen_port(None).is_err());
    }

    #[test]
    fn test_invalid_interface_rejected() {
        let network = NetworkConfig {
            gateway_interface: "".into(),
            ..NetworkConfig::default()
        };
        assert!(DiscoveryRelay::new(RelaySide::Gateway, &network, Duration::from_secs(1), MessageBus::new()).is_err());
    }
}
