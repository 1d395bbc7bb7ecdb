//! Shared serde helpers for configuration
//!
//! Durations are written as plain integers so the TOML file stays readable.

/// `Duration` as whole seconds
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// `Duration` as whole milliseconds, for sub-second settings
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        response: Duration,
        #[serde(with = "duration_millis")]
        pause: Duration,
    }

    #[test]
    fn test_duration_serialize() {
        let timeouts = Timeouts {
            response: Duration::from_secs(5),
            pause: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&timeouts).unwrap();
        assert_eq!(json, r#"{"response":5,"pause":250}"#);
    }

    #[test]
    fn test_duration_deserialize() {
        let timeouts: Timeouts = serde_json::from_str(r#"{"response":60,"pause":1500}"#).unwrap();
        assert_eq!(timeouts.response, Duration::from_secs(60));
        assert_eq!(timeouts.pause, Duration::from_millis(1500));
    }
}
