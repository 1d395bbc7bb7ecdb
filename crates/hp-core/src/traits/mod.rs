//! Core trait definitions

mod shutdown;

pub use shutdown::{Shutdown, ShutdownFlag};
