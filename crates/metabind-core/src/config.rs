//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MetabindError;

/// Default number of scheduler ticks after a local write during which
/// external changes to the same document are ignored.
pub const DEFAULT_UPDATE_CYCLE_THRESHOLD: u32 = 5;

/// Default scheduler period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration of a [`MetadataManager`](crate::MetadataManager).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use metabind_core::ManagerConfig;
///
/// let config = ManagerConfig::default()
///     .with_update_cycle_threshold(3)
///     .with_tick_interval(Duration::from_millis(50));
/// assert!(config.validate().is_ok());
///
/// let config: ManagerConfig = serde_json::from_str(r#"{"tick_interval_ms": 100}"#).unwrap();
/// assert_eq!(config.update_cycle_threshold, 5);
/// assert_eq!(config.tick_interval, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// External changes are suppressed while a document's
    /// `cycles_since_last_user_input` is below this value.
    pub update_cycle_threshold: u32,

    /// Period of the write-back scheduler.
    #[serde(rename = "tick_interval_ms", with = "duration_ms")]
    pub tick_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            update_cycle_threshold: DEFAULT_UPDATE_CYCLE_THRESHOLD,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl ManagerConfig {
    pub fn with_update_cycle_threshold(mut self, threshold: u32) -> Self {
        self.update_cycle_threshold = threshold;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), MetabindError> {
        if self.tick_interval.is_zero() {
            return Err(MetabindError::Validation(
                "tick interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.update_cycle_threshold, 5);
        assert_eq!(config.tick_interval, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = ManagerConfig::default().with_tick_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(MetabindError::Validation(_))
        ));
    }

    #[test]
    fn test_serde_roundtrip_uses_milliseconds() {
        let config = ManagerConfig::default().with_tick_interval(Duration::from_millis(750));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"update_cycle_threshold": 5, "tick_interval_ms": 750})
        );
        let back: ManagerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
