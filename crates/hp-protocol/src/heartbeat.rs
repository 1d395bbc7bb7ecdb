//! Heartbeat (`pm`) frame decoding
//!
//! About once a second the boiler pushes a space separated status line:
//!
//! ```text
//! pm 7 6.3 7.0 65.2 66 112 35 4.5 61.8 ...\r\n
//! ```
//!
//! Values are positional. Position 0 is the first value after `pm`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ProtocolError;
use crate::event::{InfoEvent, InfoKey};
use crate::frame::decode_latin1;

/// Prefix identifying a heartbeat frame
pub const HEARTBEAT_PREFIX: &[u8] = b"pm";

/// Whether a line (or the start of a partial line) is a heartbeat frame
pub fn is_heartbeat(line: &[u8]) -> bool {
    line.starts_with(HEARTBEAT_PREFIX)
}

/// Published heartbeat fields, by name, with their position in the frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMap(BTreeMap<String, usize>);

impl FieldMap {
    pub fn new(fields: BTreeMap<String, usize>) -> Self {
        Self(fields)
    }

    /// Field name at a position, if the position is published
    pub fn name(&self, index: usize) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, position)| **position == index)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FieldMap {
    /// Positions of the Nano-PK firmware heartbeat
    fn default() -> Self {
        let fields = [
            ("state", 0),
            ("o2", 1),
            ("o2_target", 2),
            ("boiler_temp", 3),
            ("boiler_target", 4),
            ("flue_temp", 5),
            ("output", 6),
            ("outdoor_temp", 7),
            ("buffer_top", 8),
            ("buffer_middle", 9),
            ("buffer_bottom", 10),
            ("hot_water_temp", 11),
            ("flow_temp_1", 12),
            ("flow_target_1", 13),
            ("flow_temp_2", 14),
            ("flow_target_2", 15),
        ];
        Self(
            fields
                .into_iter()
                .map(|(name, index)| (name.to_string(), index))
                .collect(),
        )
    }
}

/// Remembers the last value seen at every position so that only changes
/// are published
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    fields: FieldMap,
    last: HashMap<usize, String>,
}

impl HeartbeatTracker {
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            last: HashMap::new(),
        }
    }

    /// Decode one heartbeat line and return the mapped fields whose value
    /// differs from the previous frame (all mapped fields on the first one)
    pub fn analyse(&mut self, line: &[u8]) -> Result<Vec<InfoEvent>, ProtocolError> {
        let text = decode_latin1(line);
        let mut tokens = text.split_whitespace();
        if tokens.next() != Some("pm") {
            return Err(ProtocolError::NotHeartbeat(text));
        }

        let mut changed = Vec::new();
        for (index, value) in tokens.enumerate() {
            if self.last.get(&index).map(String::as_str) == Some(value) {
                continue;
            }
            self.last.insert(index, value.to_string());
            if let Some(name) = self.fields.name(index) {
                tracing::trace!("heartbeat {} -> {}", name, value);
                changed.push(InfoEvent::new(InfoKey::Field(name.to_string()), value));
            }
        }
        Ok(changed)
    }

    /// Forget all previously observed values
    pub fn reset(&mut self) {
        self.last.clear();
    }
}
