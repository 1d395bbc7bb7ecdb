//! Relay configuration

use hp_protocol::FieldMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::bus::{Channel, ChannelPolicy};

/// Configuration for the relay daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interfaces, ports and socket settings
    pub network: NetworkConfig,

    /// Session lifecycle settings
    pub session: SessionConfig,

    /// Bus channel capacities
    pub bus: BusConfig,

    /// Protocol analyser settings
    pub analyser: AnalyserConfig,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface facing the gateway (device name or IPv4 address)
    pub gateway_interface: String,

    /// Interface facing the boiler (device name or IPv4 address)
    pub boiler_interface: String,

    /// Port the gateway broadcasts discovery datagrams to
    pub discovery_port: u16,

    /// Destination of rebroadcast discovery datagrams
    pub broadcast_address: Ipv4Addr,

    /// Port shift applied when both interfaces are the same
    pub same_host_delta: u16,

    /// Port the gateway connects to on the relay
    pub gateway_port: u16,

    /// Port of the boiler's command service
    pub boiler_port: u16,

    /// Port of the internal command listener
    pub command_port: u16,

    /// Address the TCP listeners bind to
    pub listen_address: String,

    /// Receive timeout of discovery sockets
    #[serde(with = "duration_secs")]
    pub socket_timeout: Duration,

    /// Read buffer size for sockets
    pub buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gateway_interface: "eth0".to_string(),
            boiler_interface: "eth1".to_string(),
            discovery_port: 35601,
            broadcast_address: Ipv4Addr::BROADCAST,
            same_host_delta: 100,
            gateway_port: 23,
            boiler_port: 23,
            command_port: 4000,
            listen_address: "0.0.0.0".to_string(),
            socket_timeout: Duration::from_secs(5),
            buffer_size: 4096,
        }
    }
}

impl NetworkConfig {
    /// Both peers are reached through the same interface
    pub fn same_host(&self) -> bool {
        self.gateway_interface == self.boiler_interface
    }

    /// Port shift in effect (zero unless same-host)
    pub fn port_delta(&self) -> u16 {
        if self.same_host() {
            self.same_host_delta
        } else {
            0
        }
    }

    /// Gateway listener address (`listen_address:gateway_port`)
    pub fn gateway_listen_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.gateway_port)
    }

    /// Command listener address (`listen_address:command_port`)
    pub fn command_listen_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.command_port)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a request may wait for a complete reply (milliseconds)
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,

    /// Bound of a single bus wait (milliseconds)
    #[serde(with = "duration_millis")]
    pub bus_poll: Duration,

    /// How long each component gets to stop (seconds)
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Pause between two sessions (milliseconds)
    #[serde(with = "duration_millis")]
    pub restart_pause: Duration,

    /// Pause after a session failed to start (milliseconds)
    #[serde(with = "duration_millis")]
    pub error_pause: Duration,

    /// Treat a repeated gateway identity broadcast as the end of the session
    pub restart_on_duplicate_identity: bool,

    /// Parameters queried after the gateway logged in
    pub boiler_config_queries: Vec<String>,

    /// Print `info` and `track` traffic as JSON lines
    pub tap: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            bus_poll: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            restart_pause: Duration::from_secs(2),
            error_pause: Duration::from_secs(5),
            restart_on_duplicate_identity: true,
            boiler_config_queries: ["PR001", "PR011", "PR012", "PR040", "4", "5"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            tap: false,
        }
    }
}

/// Per-subscriber queue capacities; 0 means unbounded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub bootstrap_capacity: usize,
    pub info_capacity: usize,
    pub track_capacity: usize,
    pub system_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bootstrap_capacity: 256,
            info_capacity: 1024,
            track_capacity: 256,
            system_capacity: 0,
        }
    }
}

impl BusConfig {
    /// Channel policies for [`MessageBus::with_policies`](crate::bus::MessageBus::with_policies)
    pub fn policies(&self) -> HashMap<Channel, ChannelPolicy> {
        let policy = |capacity: usize| match capacity {
            0 => ChannelPolicy::Unbounded,
            n => ChannelPolicy::Bounded(n),
        };
        HashMap::from([
            (Channel::Bootstrap, policy(self.bootstrap_capacity)),
            (Channel::Info, policy(self.info_capacity)),
            (Channel::Track, policy(self.track_capacity)),
            (Channel::System, policy(self.system_capacity)),
        ])
    }
}

/// Protocol analyser settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// Minimum time between two analysed heartbeats (milliseconds, 0 analyses
    /// every frame)
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Heartbeat fields published on `info`
    pub heartbeat_fields: FieldMap,
}
