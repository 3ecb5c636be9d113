use crate::constants::*;
use crate::error::H4pError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of one transport instance.
///
/// Every field has a default matching the reference controller; a JSON file
/// only needs to name what it overrides. Durations are integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_baud: u32,
    pub target_baud: u32,
    #[serde(with = "millis")]
    pub reset_settle: Duration,
    #[serde(with = "millis")]
    pub post_reset_delay: Duration,
    #[serde(with = "millis")]
    pub cts_timeout: Duration,
    #[serde(with = "millis")]
    pub cts_poll_interval: Duration,
    #[serde(with = "millis")]
    pub speed_change_timeout: Duration,
    pub speed_change_attempts: u32,
    #[serde(with = "millis")]
    pub speed_settle: Duration,
    #[serde(with = "millis")]
    pub firmware_ack_timeout: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub alive_timeout: Duration,
    pub max_frame_size: usize,
    /// Clock-gate idle directions once running
    pub power_management: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_baud: DEFAULT_BAUD,
            target_baud: TARGET_BAUD,
            reset_settle: RESET_SETTLE,
            post_reset_delay: POST_RESET_DELAY,
            cts_timeout: CTS_TIMEOUT,
            cts_poll_interval: CTS_POLL_INTERVAL,
            speed_change_timeout: SPEED_CHANGE_TIMEOUT,
            speed_change_attempts: SPEED_CHANGE_ATTEMPTS,
            speed_settle: SPEED_SETTLE,
            firmware_ack_timeout: FIRMWARE_ACK_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            alive_timeout: ALIVE_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            power_management: true,
        }
    }
}

impl TransportConfig {
    pub fn from_json_str(json: &str) -> Result<Self, H4pError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, H4pError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<(), H4pError> {
        if self.speed_change_attempts == 0 {
            return Err(H4pError::InvalidConfig(
                "speed_change_attempts must be at least 1".to_string(),
            ));
        }
        if self.cts_poll_interval.is_zero() {
            return Err(H4pError::InvalidConfig("cts_poll_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
