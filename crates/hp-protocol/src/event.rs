//! Events extracted from the gateway/boiler dialog
//!
//! `InfoEvent`s feed the telemetry side (`info` channel), `TrackEvent`s the
//! parameter-change side (`track` channel).

use serde::{Serialize, Serializer};
use std::fmt;

/// What an extracted value describes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InfoKey {
    /// Login key sent by the gateway
    Key,
    /// Login token returned by the boiler
    Token,
    /// Gateway number registered with `$igw set`
    Igw,
    Api,
    SetKomm,
    Asnr,
    Boot,
    /// Boiler model description
    Kt,
    Swv,
    Fwv,
    SnIo,
    SnBce,
    Uptime,
    Rtc,
    /// Active error list (`$erract`)
    ErrAct,
    /// One parameter record from a `$par get` reply
    Parameter,
    /// Parameter records gathered after login
    BoilerConfig,
    BoilerAddr,
    BoilerPort,
    /// Error or permission-denied reply from the appliance
    ApplianceError,
    /// Named heartbeat field
    Field(String),
}

impl fmt::Display for InfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InfoKey::Key => "KEY",
            InfoKey::Token => "TOKEN",
            InfoKey::Igw => "IGW",
            InfoKey::Api => "API",
            InfoKey::SetKomm => "SETKOMM",
            InfoKey::Asnr => "ASNR",
            InfoKey::Boot => "BOOT",
            InfoKey::Kt => "KT",
            InfoKey::Swv => "SWV",
            InfoKey::Fwv => "FWV",
            InfoKey::SnIo => "SNIO",
            InfoKey::SnBce => "SNBCE",
            InfoKey::Uptime => "UPTIME",
            InfoKey::Rtc => "RTC",
            InfoKey::ErrAct => "ERRACT",
            InfoKey::Parameter => "PAR",
            InfoKey::BoilerConfig => "BOILER_CONFIG",
            InfoKey::BoilerAddr => "BL_ADDR",
            InfoKey::BoilerPort => "BL_PORT",
            InfoKey::ApplianceError => "APPLIANCE_ERROR",
            InfoKey::Field(name) => name,
        };
        f.write_str(name)
    }
}

impl Serialize for InfoKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A decoded value destined for the telemetry publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoEvent {
    pub key: InfoKey,
    pub value: String,
}

impl InfoEvent {
    pub fn new(key: InfoKey, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for InfoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A parameter change acknowledged by the boiler.
///
/// Emitted for `zPa N: <id> (<name>) = <value>` notices, which the boiler
/// prints both for `$par set` requests and for changes made on its own panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackEvent {
    pub parameter: String,
    pub name: String,
    pub value: String,
}

impl TrackEvent {
    const PREFIX: &'static str = "zPa N:";

    /// Parse a `zPa N:` notice line (terminator stripped)
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(Self::PREFIX)?.trim_start();
        let (head, value) = rest.split_once(" = ")?;
        let (parameter, name) = match head.split_once(" (") {
            Some((id, name)) => (id.trim(), name.trim_end_matches(')')),
            None => (head.trim(), ""),
        };
        if parameter.is_empty() {
            return None;
        }
        Some(Self {
            parameter: parameter.to_string(),
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Output of the analyser, routed to a bus channel by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyserEvent {
    Info(InfoEvent),
    Track(TrackEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_event_parse() {
        let event = TrackEvent::parse("zPa N: PR001 (Mode) = Ballon").unwrap();
        assert_eq!(event.parameter, "PR001");
        assert_eq!(event.name, "Mode");
        assert_eq!(event.value, "Ballon");

        let event = TrackEvent::parse("zPa N: 4 (Temp. ambiante jour) = 20.0").unwrap();
        assert_eq!(event.parameter, "4");
        assert_eq!(event.name, "Temp. ambiante jour");
        assert_eq!(event.value, "20.0");
    }

    #[test]
    fn test_track_event_rejects_previous_value_notice() {
        assert!(TrackEvent::parse("zPa A: PR001 (Mode) = Arr").is_none());
        assert!(TrackEvent::parse("zParamter PR001 per APP verstellt").is_none());
    }

    #[test]
    fn test_info_event_display() {
        let event = InfoEvent::new(InfoKey::Field("TK".into()), "65.2");
        assert_eq!(event.to_string(), "TK=65.2");
        assert_eq!(InfoKey::SnBce.to_string(), "SNBCE");
    }
}
