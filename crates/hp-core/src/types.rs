//! Core domain types carried on the bus

use hp_protocol::{AnalyserEvent, InfoEvent, TrackEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Which side of the relay a peer lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// The internet gateway (IGW)
    Gateway,
    /// The boiler
    Boiler,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Gateway => write!(f, "gateway"),
            PeerRole::Boiler => write!(f, "boiler"),
        }
    }
}

/// Address of a discovered peer; immutable once published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    /// Create a new peer address
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }

    /// Peer address from a datagram source, if it is IPv4
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// First-datagram discovery of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerAnnouncement {
    pub role: PeerRole,
    pub address: PeerAddress,
}

/// Marker lines found in discovery datagrams
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "marker", content = "value", rename_all = "snake_case")]
pub enum DiscoveryMarker {
    /// `HargaWebApp` line broadcast by the gateway
    AppIdentity(String),
    /// `SN:` line broadcast by the gateway
    Serial(String),
    /// Trailing system code of the boiler's `HSV` announcement
    SystemCode(String),
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// The gateway's session-clear request was acknowledged
    SessionCleared,
    /// The gateway connection closed or failed
    GatewayClosed,
    /// The gateway announced its identity again mid-session
    DuplicateIdentity,
    /// A relay socket failed
    TransportFailure,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RestartReason::SessionCleared => "session cleared",
            RestartReason::GatewayClosed => "gateway closed",
            RestartReason::DuplicateIdentity => "duplicate identity",
            RestartReason::TransportFailure => "transport failure",
        };
        f.write_str(reason)
    }
}

/// Everything that travels on the message bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Peer(PeerAnnouncement),
    Marker(DiscoveryMarker),
    Info(InfoEvent),
    Track(TrackEvent),
    Restart { reason: RestartReason },
}

impl BusMessage {
    pub fn peer(role: PeerRole, address: PeerAddress) -> Self {
        BusMessage::Peer(PeerAnnouncement { role, address })
    }

    pub fn restart(reason: RestartReason) -> Self {
        BusMessage::Restart { reason }
    }
}

impl From<AnalyserEvent> for BusMessage {
    fn from(event: AnalyserEvent) -> Self {
        match event {
            AnalyserEvent::Info(info) => BusMessage::Info(info),
            AnalyserEvent::Track(track) => BusMessage::Track(track),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_protocol::InfoKey;

    #[test]
    fn test_peer_address_display() {
        let addr = PeerAddress::new(Ipv4Addr::new(192, 168, 1, 20), 50000);
        assert_eq!(addr.to_string(), "192.168.1.20:50000");
        assert_eq!(
            PeerAddress::from_socket_addr(addr.socket_addr()),
            Some(addr)
        );
    }

    #[test]
    fn test_bus_message_json() {
        let msg = BusMessage::Info(InfoEvent::new(InfoKey::Field("boiler_temp".into()), "65.2"));
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"info","key":"boiler_temp","value":"65.2"}"#);

        let json = serde_json::to_string(&BusMessage::restart(RestartReason::GatewayClosed)).unwrap();
        assert_eq!(json, r#"{"type":"restart","reason":"gateway_closed"}"#);
    }
}
