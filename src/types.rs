use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// Lifecycle of one session attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for the radio to power on
    Idle,
    /// Scanning for the configured peripheral
    Scanning,
    /// Target peripheral seen, scan stopped
    Discovered,
    /// Connect request outstanding
    Connecting,
    /// Link established, services not yet resolved
    Connected,
    /// All required services and characteristics resolved
    ServicesResolved,
    /// Reading and streaming telemetry
    Active,
    /// Teardown requested, waiting for the link to drop
    Disconnecting,
    /// Terminal state for this session
    Disconnected,
}

impl SessionState {
    /// Whether a link to the peripheral exists or is being set up
    #[must_use]
    pub const fn is_linked(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::ServicesResolved | Self::Active
        )
    }

    /// Whether the session has ended
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Discovered => write!(f, "Discovered"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ServicesResolved => write!(f, "Services Resolved"),
            Self::Active => write!(f, "Active"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Radio power state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Radio is on and usable
    PoweredOn,
    /// Radio is off
    PoweredOff,
    /// State not known yet
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "Powered On"),
            Self::PoweredOff => write!(f, "Powered Off"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Opaque peripheral identifier, compared case-insensitively
///
/// On Linux this is the Bluetooth address, e.g. `C8:2B:96:12:34:56`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as given
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against another identifier
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl PartialEq for PeripheralId {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl std::hash::Hash for PeripheralId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_uppercase().hash(state);
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Advertising peripheral
    pub peripheral: Option<PeripheralId>,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Advertised TX power level
    pub tx_power_level: Option<i16>,
    /// Manufacturer specific data by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    /// Minimal advertisement carrying just an identifier
    pub fn from_id(id: impl Into<PeripheralId>) -> Self {
        Self {
            peripheral: Some(id.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_is_case_insensitive() {
        let id = PeripheralId::from("aa:bb");
        assert!(id.matches("AA:BB"));
        assert_eq!(id, PeripheralId::from("AA:bb"));
        assert!(!id.matches("11:22"));

        let mut set = std::collections::HashSet::new();
        set.insert(PeripheralId::from("c8:2b"));
        assert!(set.contains(&PeripheralId::from("C8:2B")));
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Active.is_linked());
        assert!(SessionState::Connecting.is_linked());
        assert!(!SessionState::Scanning.is_linked());
        assert!(!SessionState::Disconnecting.is_linked());
        assert!(SessionState::Disconnected.is_terminal());
        assert_eq!(SessionState::ServicesResolved.to_string(), "Services Resolved");
    }
}
