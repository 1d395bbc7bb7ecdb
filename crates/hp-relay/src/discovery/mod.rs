//! UDP discovery relays
//!
//! The gateway finds the boiler by broadcasting on UDP 35601 and the boiler
//! answers to the gateway's source port. With the relay in between, each
//! side lives on its own interface and one [`DiscoveryRelay`] per side copies
//! the datagrams across.

mod relay;
pub mod socket;

pub use relay::{DiscoveryRelay, RelaySide};
pub use socket::Interface;

use hp_core::DiscoveryMarker;
use hp_protocol::frame::decode_latin1;

/// Line prefix of the gateway's application identity
pub const APP_IDENTITY_PREFIX: &str = "HargaWebApp";

/// Line prefix of the gateway's serial number
pub const SERIAL_PREFIX: &str = "SN:";

/// Leading bytes of the boiler's announcement datagram
pub const SYSTEM_ANNOUNCE_PREFIX: &[u8] = b"\x00\x02HSV";

/// Length of the system code at the end of the boiler's announcement
pub const SYSTEM_CODE_LEN: usize = 16;

/// Markers carried by a discovery datagram, in payload order
pub fn scan_markers(payload: &[u8]) -> Vec<DiscoveryMarker> {
    let mut markers = Vec::new();

    if payload.starts_with(SYSTEM_ANNOUNCE_PREFIX) && payload.len() >= SYSTEM_CODE_LEN {
        let code = &payload[payload.len() - SYSTEM_CODE_LEN..];
        markers.push(DiscoveryMarker::SystemCode(decode_latin1(code)));
        return markers;
    }

    let text = decode_latin1(payload);
    for line in text.split('\n').map(|l| l.trim_end_matches('\r')) {
        if let Some(rest) = line.strip_prefix(APP_IDENTITY_PREFIX) {
            let value = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            markers.push(DiscoveryMarker::AppIdentity(value.trim_end().to_string()));
        } else if let Some(rest) = line.strip_prefix(SERIAL_PREFIX) {
            markers.push(DiscoveryMarker::Serial(rest.to_string()));
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_gateway_markers() {
        let payload = b"HargaWebApp: 7\r\nSN:0123456789\r\nIP:192.168.1.5\r\n";
        assert_eq!(
            scan_markers(payload),
            vec![
                DiscoveryMarker::AppIdentity("7".into()),
                DiscoveryMarker::Serial("0123456789".into()),
            ]
        );
    }

    #[test]
    fn test_scan_without_markers() {
        assert!(scan_markers(b"hello\r\nworld").is_empty());
    }

    #[test]
    fn test_scan_system_code() {
        let mut payload = b"\x00\x02HSV/CL ".to_vec();
        payload.extend_from_slice(b"padding.........");
        payload.extend_from_slice(b"0123456789ABCDEF");

        assert_eq!(
            scan_markers(&payload),
            vec![DiscoveryMarker::SystemCode("0123456789ABCDEF".into())]
        );
    }
}
