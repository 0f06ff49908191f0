use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::info;

use crate::{
    error::{MioError, Result},
    gatt::{CharacteristicKind, ServiceKind},
    types::PeripheralId,
};

/// What the session does once it is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Report the battery level once, then disconnect
    #[default]
    BatteryOnce,
    /// Stay connected and route notifications until stopped
    Streaming,
}

/// Which characteristics a session resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Battery level only
    #[default]
    Battery,
    /// Battery plus the optional heart rate and sport services
    Full,
}

/// One characteristic the session wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileEntry {
    /// Characteristic to resolve
    pub characteristic: CharacteristicKind,
    /// Missing it ends the session
    pub required: bool,
}

/// Characteristics to resolve after connecting, grouped by service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    entries: Vec<ProfileEntry>,
}

impl Profile {
    /// Build a profile from explicit entries
    #[must_use]
    pub fn new(entries: Vec<ProfileEntry>) -> Self {
        Self { entries }
    }

    /// Battery level only, required
    #[must_use]
    pub fn battery() -> Self {
        Self::new(vec![ProfileEntry {
            characteristic: CharacteristicKind::BatteryLevel,
            required: true,
        }])
    }

    /// Every known characteristic; battery required, everything else optional
    #[must_use]
    pub fn full() -> Self {
        Self::new(
            CharacteristicKind::ALL
                .into_iter()
                .map(|characteristic| ProfileEntry {
                    characteristic,
                    required: characteristic == CharacteristicKind::BatteryLevel,
                })
                .collect(),
        )
    }

    /// Services to resolve, battery first, each with its wanted characteristics
    #[must_use]
    pub fn services(&self) -> Vec<(ServiceKind, bool, Vec<ProfileEntry>)> {
        ServiceKind::ALL
            .into_iter()
            .filter_map(|service| {
                let entries: Vec<_> = self
                    .entries
                    .iter()
                    .copied()
                    .filter(|e| e.characteristic.service() == service)
                    .collect();
                if entries.is_empty() {
                    return None;
                }
                let required = entries.iter().any(|e| e.required);
                Some((service, required, entries))
            })
            .collect()
    }

    /// Whether `characteristic` is part of this profile
    #[must_use]
    pub fn contains(&self, characteristic: CharacteristicKind) -> bool {
        self.entries.iter().any(|e| e.characteristic == characteristic)
    }
}

impl From<ProfileKind> for Profile {
    fn from(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Battery => Self::battery(),
            ProfileKind::Full => Self::full(),
        }
    }
}

/// Per-operation transport timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Service and characteristic discovery timeout in milliseconds
    pub discovery_timeout_ms: u64,
    /// Characteristic read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Characteristic write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Subscribe timeout in milliseconds
    pub subscribe_timeout_ms: u64,
    /// Graceful disconnect timeout in milliseconds
    pub disconnect_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            discovery_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            disconnect_timeout_ms: 3_000,
        }
    }
}

impl TimeoutConfig {
    /// Connect timeout
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Discovery timeout
    #[must_use]
    pub const fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Read timeout
    #[must_use]
    pub const fn read(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout
    #[must_use]
    pub const fn write(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Subscribe timeout
    #[must_use]
    pub const fn subscribe(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Disconnect timeout
    #[must_use]
    pub const fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Session configuration, usually loaded from `config.json`
///
/// ```json
/// { "device_id": "C8:2B:96:12:34:56", "mode": "streaming", "profile": "full" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The one peripheral to pair with
    pub device_id: String,
    /// What to do once active
    #[serde(default)]
    pub mode: SessionMode,
    /// Which characteristics to resolve
    #[serde(default)]
    pub profile: ProfileKind,
    /// Scan-and-connect cycles allowed per session start
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Transport timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

const fn default_connect_attempts() -> u32 {
    1
}

impl SessionConfig {
    /// Configuration with defaults for everything but the device
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            mode: SessionMode::default(),
            profile: ProfileKind::default(),
            connect_attempts: default_connect_attempts(),
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Parse and check a JSON configuration
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Json`] for malformed JSON and [`MioError::Config`] for
    /// semantically invalid values.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Io`] if the file cannot be read, otherwise as
    /// [`SessionConfig::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// The configured peripheral
    #[must_use]
    pub fn identity(&self) -> PeripheralId {
        PeripheralId::new(self.device_id.trim())
    }

    /// Characteristics to resolve
    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile.into()
    }

    fn check(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(MioError::Config("device_id must not be empty".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(MioError::Config(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = SessionConfig::from_json_str(r#"{"device_id": "c8:2b:96:12:34:56"}"#).unwrap();
        assert_eq!(config.mode, SessionMode::BatteryOnce);
        assert_eq!(config.profile, ProfileKind::Battery);
        assert_eq!(config.connect_attempts, 1);
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert!(config.identity().matches("C8:2B:96:12:34:56"));
    }

    #[test]
    fn test_full_config() {
        let config = SessionConfig::from_json_str(
            r#"{
                "device_id": "AA:BB",
                "mode": "streaming",
                "profile": "full",
                "connect_attempts": 3,
                "timeouts": { "read_timeout_ms": 750 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, SessionMode::Streaming);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.timeouts.read(), Duration::from_millis(750));
        assert_eq!(config.timeouts.connect_timeout_ms, 30_000);
        assert!(config.profile().contains(CharacteristicKind::Sensor));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"device_id": "  "}"#),
            Err(MioError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"device_id": "AA", "connect_attempts": 0}"#),
            Err(MioError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"mode": "streaming"}"#),
            Err(MioError::Json(_))
        ));
        assert!(matches!(
            SessionConfig::from_file("/nonexistent/miolink.json"),
            Err(MioError::Io(_))
        ));
    }

    #[test]
    fn test_profile_groups_battery_first() {
        let services = Profile::full().services();
        let order: Vec<_> = services.iter().map(|(s, _, _)| *s).collect();
        assert_eq!(
            order,
            vec![ServiceKind::Battery, ServiceKind::HeartRate, ServiceKind::MioSport]
        );
        assert!(services[0].1);
        assert!(!services[1].1);
        assert!(!services[2].2.iter().any(|e| e.required));
        let total: usize = services.iter().map(|(_, _, entries)| entries.len()).sum();
        assert_eq!(total, CharacteristicKind::ALL.len());
        assert!(services[2]
            .2
            .iter()
            .any(|e| e.characteristic == CharacteristicKind::SportUnknown));

        let battery = Profile::battery().services();
        assert_eq!(battery.len(), 1);
    }
}
