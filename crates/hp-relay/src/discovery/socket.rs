//! Interface-bound sockets
//!
//! Discovery sockets share well-known ports with other processes and stay
//! on one physical interface. They are set up with address and port reuse,
//! optional broadcast, then either `SO_BINDTODEVICE` (Linux, interface given
//! by name) or a bind to the interface's own address.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use hp_core::TransportError;

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL)
const MAX_DEVICE_NAME: usize = 15;

/// Backlog of the TCP listeners; one gateway and one command client
const LISTEN_BACKLOG: u32 = 16;

/// A network interface, named or addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interface {
    /// Device name such as `eth0`
    Device(String),
    /// Local IPv4 address of the interface
    Address(Ipv4Addr),
}

impl Interface {
    /// Address to bind to; devices bind the wildcard address
    pub fn bind_ip(&self) -> Ipv4Addr {
        match self {
            Interface::Device(_) => Ipv4Addr::UNSPECIFIED,
            Interface::Address(addr) => *addr,
        }
    }

    pub fn device(&self) -> Option<&str> {
        match self {
            Interface::Device(name) => Some(name),
            Interface::Address(_) => None,
        }
    }
}

impl FromStr for Interface {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidInterface("empty interface".to_string()));
        }
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Interface::Address(addr));
        }
        if s.len() > MAX_DEVICE_NAME || s.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(TransportError::InvalidInterface(s.to_string()));
        }
        Ok(Interface::Device(s.to_string()))
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interface::Device(name) => f.write_str(name),
            Interface::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Bind a UDP socket to `port` on `interface`.
///
/// Must be called from within a tokio runtime.
pub fn bind_udp(interface: &Interface, port: u16, broadcast: bool) -> Result<UdpSocket, TransportError> {
    let address = SocketAddrV4::new(interface.bind_ip(), port);
    let bind_error = |source| TransportError::Bind {
        address: format!("{}:{}", interface, port),
        source,
    };
    let option_error = |option: &'static str| {
        move |source: io::Error| TransportError::SocketOption { option, source }
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
    socket
        .set_reuse_address(true)
        .map_err(option_error("SO_REUSEADDR"))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(option_error("SO_REUSEPORT"))?;
    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(option_error("SO_BROADCAST"))?;
    }
    if let Some(device) = interface.device() {
        bind_to_device(&socket, device)?;
    }
    socket.bind(&SockAddr::from(address)).map_err(bind_error)?;
    socket
        .set_nonblocking(true)
        .map_err(option_error("O_NONBLOCK"))?;

    tracing::debug!("udp socket bound to {}:{} (broadcast: {})", interface, port, broadcast);
    UdpSocket::from_std(socket.into()).map_err(bind_error)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: &Socket, device: &str) -> Result<(), TransportError> {
    socket
        .bind_device(Some(device.as_bytes()))
        .map_err(|source| TransportError::SocketOption {
            option: "SO_BINDTODEVICE",
            source,
        })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: &Socket, device: &str) -> Result<(), TransportError> {
    Err(TransportError::InvalidInterface(format!(
        "{}: binding by device name needs Linux, use the interface's IPv4 address",
        device
    )))
}

/// Bind a TCP listener with address reuse so consecutive sessions can
/// rebind the same port immediately
pub fn bind_tcp_listener(address: &str) -> Result<TcpListener, TransportError> {
    let bind_error = |source| TransportError::Bind {
        address: address.to_string(),
        source,
    };
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| TransportError::InvalidInterface(address.to_string()))?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_error)?;
    socket
        .set_reuseaddr(true)
        .map_err(|source| TransportError::SocketOption {
            option: "SO_REUSEADDR",
            source,
        })?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// Connect to `address`, leaving through `interface` where the platform
/// allows pinning the device
pub async fn connect_tcp(
    interface: &Interface,
    address: SocketAddrV4,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let connect_error = |source| TransportError::Connect {
        address: address.to_string(),
        source,
    };

    let socket = TcpSocket::new_v4().map_err(connect_error)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(device) = interface.device() {
        socket
            .bind_device(Some(device.as_bytes()))
            .map_err(|source| TransportError::SocketOption {
                option: "SO_BINDTODEVICE",
                source,
            })?;
    }
    if let Interface::Address(ip) = interface {
        socket
            .bind(SocketAddr::V4(SocketAddrV4::new(*ip, 0)))
            .map_err(connect_error)?;
    }

    match tokio::time::timeout(timeout, socket.connect(SocketAddr::V4(address))).await {
        Ok(result) => result.map_err(connect_error),
        Err(_) => Err(connect_error(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}
