//! Engine configuration.
//!
//! All fields have defaults, and the struct deserializes with missing fields
//! filled in, so callers can embed it in their own configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pairwise algorithm name advertised in device keys.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Group algorithm name advertised in device keys and room events.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Key algorithm of signed one-time prekeys.
pub const SIGNED_ONE_TIME_KEY_ALGORITHM: &str = "signed_curve25519";

/// To-device event type carrying a room key.
pub const ROOM_KEY_EVENT: &str = "m.room_key";

/// Event type of encrypted events (to-device and room).
pub const ENCRYPTED_EVENT: &str = "m.room.encrypted";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of one-time prekeys the server should hold.
    ///
    /// The engine keeps the server stocked at half this value.
    pub max_one_time_keys: usize,

    /// When outbound group sessions are replaced.
    pub rotation: RotationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_one_time_keys: 100, rotation: RotationPolicy::default() }
    }
}

/// Outbound group session rotation limits. Whichever is hit first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Messages encrypted before rotation.
    pub max_messages: u64,

    /// Session age before rotation.
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self { max_messages: 100, max_age: Duration::from_secs(7 * 24 * 60 * 60) }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_one_time_keys, 100);
        assert_eq!(config.rotation.max_messages, 100);
        assert_eq!(config.rotation.max_age, Duration::from_secs(604_800));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"rotation": {"max_age": 3600}}"#).unwrap();

        assert_eq!(config.max_one_time_keys, 100);
        assert_eq!(config.rotation.max_messages, 100);
        assert_eq!(config.rotation.max_age, Duration::from_secs(3600));
    }
}
