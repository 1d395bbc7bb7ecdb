//! hp-relay: Transparent relay between a Hargassner IGW and its boiler
//!
//! The relay sits on two network interfaces. Discovery relays copy the UDP
//! discovery datagrams across, the multiplexer terminates the gateway's TCP
//! session and forwards it to the boiler while analysing the dialog, and the
//! orchestrator restarts the whole component set whenever a session ends.

pub mod component;
pub mod discovery;
pub mod orchestrator;
pub mod proxy;
pub mod tap;

pub use component::Component;
pub use orchestrator::{ComponentFactory, Orchestrator, RelayFactory, SessionOutcome};
pub use proxy::{Multiplexer, ProxyState};
