//! hp-core: Shared plumbing for hargproxy
//!
//! This crate provides the in-process message bus that is the only
//! coordination primitive between relay components, the messages carried on
//! it, the shutdown capability every component implements, and the
//! configuration structures loaded by the binary.

pub mod bus;
pub mod config;
pub mod error;
pub mod receiver;
pub mod traits;
pub mod types;

pub use bus::{Channel, ChannelPolicy, MessageBus, Subscription};
pub use error::{BusError, ConfigError, RelayError, TransportError};
pub use receiver::{ChannelReceiver, NetworkData};
pub use traits::{Shutdown, ShutdownFlag};
pub use types::{BusMessage, DiscoveryMarker, PeerAddress, PeerAnnouncement, PeerRole, RestartReason};
