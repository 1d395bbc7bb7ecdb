//! TCP session multiplexer between the gateway, the boiler and the local
//! command port

mod caller;
mod multiplexer;

pub use caller::{Caller, Dispatcher, Request};
pub use multiplexer::Multiplexer;

use std::fmt;

/// Multiplexer lifecycle, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Waiting for the boiler address on `bootstrap`
    Discovering,
    /// Connecting to the boiler and opening the listeners
    Connecting,
    /// Relaying traffic
    Relaying,
    /// A session-end trigger fired or shutdown was requested
    Ending,
    /// The multiplexer returned
    Exited,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ProxyState::Discovering => "discovering",
            ProxyState::Connecting => "connecting",
            ProxyState::Relaying => "relaying",
            ProxyState::Ending => "ending",
            ProxyState::Exited => "exited",
        };
        f.write_str(state)
    }
}
