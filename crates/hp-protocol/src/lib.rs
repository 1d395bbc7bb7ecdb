//! hp-protocol: Line protocol of the Hargassner gateway/boiler link
//!
//! This crate knows how the IGW gateway and the boiler talk to each other:
//! line framing, request classification, heartbeat decoding and the
//! per-session analyser that turns the dialog into info and track events.

pub mod analyser;
pub mod error;
pub mod event;
pub mod frame;
pub mod heartbeat;
pub mod request;

pub use analyser::{Analyser, LineKind, ParseState, ResponseLine, ResponseMode, ResponseParse};
pub use error::ProtocolError;
pub use event::{AnalyserEvent, InfoEvent, InfoKey, TrackEvent};
pub use frame::{request_line, LineCodec, LINE_TERMINATOR, MAX_LINE_LENGTH};
pub use heartbeat::{FieldMap, HeartbeatTracker};
pub use request::RequestVerb;
