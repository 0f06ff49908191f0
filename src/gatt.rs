//! GATT services and characteristics exposed by Mio wearables.
//!
//! Battery and heart rate use the 16-bit identifiers assigned by the Bluetooth SIG.
//! The vendor "sport" service family shares a 128-bit base of
//! `6C72xxxx-5BF1-4F64-9170-381C08EC57EE`. Callers never need to care which width a
//! descriptor uses: [`GattId::uuid`] always yields a full [`Uuid`].

use btleplug::api::bleuuid::uuid_from_u16;
use std::{fmt, str::FromStr};
use uuid::{uuid, Uuid};

use crate::error::{MioError, Result};

/// Battery service (0x180F)
pub const SERVICE_BATTERY: u16 = 0x180F;
/// Battery level characteristic (0x2A19), read + notify, one byte
pub const CHAR_BATTERY_LEVEL: u16 = 0x2A19;

/// Heart rate service (0x180D)
pub const SERVICE_HEART_RATE: u16 = 0x180D;
/// Heart rate measurement characteristic (0x2A37), notify
pub const CHAR_HEART_RATE_MEASUREMENT: u16 = 0x2A37;
/// Body sensor location characteristic (0x2A38), read
pub const CHAR_BODY_SENSOR_LOCATION: u16 = 0x2A38;

/// Vendor sport service
pub const SERVICE_MIO_SPORT: Uuid = uuid!("6C721838-5BF1-4F64-9170-381C08EC57EE");
/// Command channel into the device, read + write
pub const CHAR_MIO_SPORT_MSG: Uuid = uuid!("6C722A80-5BF1-4F64-9170-381C08EC57EE");
/// Purpose unknown, read + write
pub const CHAR_MIO_SPORT_UNKNOWN: Uuid = uuid!("6C722A81-5BF1-4F64-9170-381C08EC57EE");
/// Command responses from the device, read + notify
pub const CHAR_MIO_SPORT_MSG_RESP: Uuid = uuid!("6C722A82-5BF1-4F64-9170-381C08EC57EE");
/// Sensor stream, read + notify
pub const CHAR_MIO_SENSOR: Uuid = uuid!("6C722A83-5BF1-4F64-9170-381C08EC57EE");
/// Stored record stream, read + notify
pub const CHAR_MIO_RECORD: Uuid = uuid!("6C722A84-5BF1-4F64-9170-381C08EC57EE");

/// A GATT identifier in either of its two wire widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattId {
    /// 16-bit SIG assigned number, expanded against the Bluetooth base UUID
    Standard(u16),
    /// Full 128-bit vendor UUID
    Vendor(Uuid),
}

impl GattId {
    /// Full 128-bit form, comparable regardless of the original width
    #[must_use]
    pub fn uuid(self) -> Uuid {
        match self {
            Self::Standard(short) => uuid_from_u16(short),
            Self::Vendor(uuid) => uuid,
        }
    }
}

impl fmt::Display for GattId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(short) => write!(f, "0x{short:04X}"),
            Self::Vendor(uuid) => write!(f, "{}", uuid.hyphenated()),
        }
    }
}

/// Services the session knows how to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    /// Standard battery service
    Battery,
    /// Standard heart rate service
    HeartRate,
    /// Vendor sport service
    MioSport,
}

impl ServiceKind {
    /// All services, in resolution order. Battery comes first since it is the
    /// minimum viability check for a peripheral.
    pub const ALL: [Self; 3] = [Self::Battery, Self::HeartRate, Self::MioSport];

    /// Descriptor for this service
    #[must_use]
    pub const fn descriptor(self) -> ServiceDescriptor {
        match self {
            Self::Battery => ServiceDescriptor {
                kind: self,
                id: GattId::Standard(SERVICE_BATTERY),
                name: "Battery",
            },
            Self::HeartRate => ServiceDescriptor {
                kind: self,
                id: GattId::Standard(SERVICE_HEART_RATE),
                name: "Heart Rate",
            },
            Self::MioSport => ServiceDescriptor {
                kind: self,
                id: GattId::Vendor(SERVICE_MIO_SPORT),
                name: "Mio Sport",
            },
        }
    }

    /// Characteristics that live under this service
    #[must_use]
    pub fn characteristics(self) -> Vec<CharacteristicKind> {
        CharacteristicKind::ALL
            .into_iter()
            .filter(|c| c.service() == self)
            .collect()
    }
}

impl FromStr for ServiceKind {
    type Err = MioError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "battery" => Ok(Self::Battery),
            "heart_rate" => Ok(Self::HeartRate),
            "mio_sport" | "sport" => Ok(Self::MioSport),
            _ => Err(MioError::UnknownIdentifier {
                kind: "service",
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

/// Characteristics the session knows how to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicKind {
    /// Battery level in percent
    BatteryLevel,
    /// Heart rate measurement stream
    HeartRateMeasurement,
    /// Where the sensor sits on the body
    BodySensorLocation,
    /// Vendor command channel
    SportMsg,
    /// Vendor characteristic with unknown purpose
    SportUnknown,
    /// Vendor command responses
    SportMsgResp,
    /// Vendor sensor stream
    Sensor,
    /// Vendor record stream
    Record,
}

impl CharacteristicKind {
    /// All characteristics, grouped by service in resolution order
    pub const ALL: [Self; 8] = [
        Self::BatteryLevel,
        Self::HeartRateMeasurement,
        Self::BodySensorLocation,
        Self::SportMsg,
        Self::SportUnknown,
        Self::SportMsgResp,
        Self::Sensor,
        Self::Record,
    ];

    /// Parent service
    #[must_use]
    pub const fn service(self) -> ServiceKind {
        match self {
            Self::BatteryLevel => ServiceKind::Battery,
            Self::HeartRateMeasurement | Self::BodySensorLocation => ServiceKind::HeartRate,
            Self::SportMsg | Self::SportUnknown | Self::SportMsgResp | Self::Sensor | Self::Record => {
                ServiceKind::MioSport
            }
        }
    }

    /// Descriptor with the capabilities the device is expected to advertise
    #[must_use]
    pub const fn descriptor(self) -> CharacteristicDescriptor {
        let (id, name, readable, writable, notifiable) = match self {
            Self::BatteryLevel => (
                GattId::Standard(CHAR_BATTERY_LEVEL),
                "Battery Level",
                true,
                false,
                true,
            ),
            Self::HeartRateMeasurement => (
                GattId::Standard(CHAR_HEART_RATE_MEASUREMENT),
                "Heart Rate Measurement",
                false,
                false,
                true,
            ),
            Self::BodySensorLocation => (
                GattId::Standard(CHAR_BODY_SENSOR_LOCATION),
                "Body Sensor Location",
                true,
                false,
                false,
            ),
            Self::SportMsg => (GattId::Vendor(CHAR_MIO_SPORT_MSG), "Sport Msg", true, true, false),
            Self::SportUnknown => (
                GattId::Vendor(CHAR_MIO_SPORT_UNKNOWN),
                "Sport Unknown",
                true,
                true,
                false,
            ),
            Self::SportMsgResp => (
                GattId::Vendor(CHAR_MIO_SPORT_MSG_RESP),
                "Sport Msg Response",
                true,
                false,
                true,
            ),
            Self::Sensor => (GattId::Vendor(CHAR_MIO_SENSOR), "Sensor", true, false, true),
            Self::Record => (GattId::Vendor(CHAR_MIO_RECORD), "Record", true, false, true),
        };
        CharacteristicDescriptor {
            kind: self,
            service: self.service(),
            id,
            name,
            readable,
            writable,
            notifiable,
        }
    }

    /// Reverse lookup from a full UUID
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.descriptor().uuid() == uuid)
    }

    fn parse_within(service: ServiceKind, name: &str) -> Option<Self> {
        let key = name.to_ascii_lowercase().replace(['-', ' '], "_");
        let kind = match (service, key.as_str()) {
            (ServiceKind::Battery, "battery_level" | "level") => Self::BatteryLevel,
            (ServiceKind::HeartRate, "heart_rate_measurement" | "measurement") => {
                Self::HeartRateMeasurement
            }
            (ServiceKind::HeartRate, "body_sensor_location" | "body_sensor") => {
                Self::BodySensorLocation
            }
            (ServiceKind::MioSport, "msg") => Self::SportMsg,
            (ServiceKind::MioSport, "unknown") => Self::SportUnknown,
            (ServiceKind::MioSport, "msg_resp") => Self::SportMsgResp,
            (ServiceKind::MioSport, "sensor") => Self::Sensor,
            (ServiceKind::MioSport, "record") => Self::Record,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

/// A service identifier paired with its human readable name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    /// Logical service
    pub kind: ServiceKind,
    /// Wire identifier
    pub id: GattId,
    /// Human readable name
    pub name: &'static str,
}

impl ServiceDescriptor {
    /// Full 128-bit identifier
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.id.uuid()
    }
}

/// A characteristic identifier scoped under its parent service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicDescriptor {
    /// Logical characteristic
    pub kind: CharacteristicKind,
    /// Parent service
    pub service: ServiceKind,
    /// Wire identifier
    pub id: GattId,
    /// Human readable name
    pub name: &'static str,
    /// Expected to support reads
    pub readable: bool,
    /// Expected to support writes
    pub writable: bool,
    /// Expected to support notify or indicate
    pub notifiable: bool,
}

impl CharacteristicDescriptor {
    /// Full 128-bit identifier
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.id.uuid()
    }
}

/// Resolve a service by its logical name
///
/// # Errors
///
/// Returns [`MioError::UnknownIdentifier`] if the name is not a known service.
pub fn resolve_service(name: &str) -> Result<ServiceDescriptor> {
    name.parse::<ServiceKind>().map(ServiceKind::descriptor)
}

/// Resolve a characteristic by its logical name under `service`
///
/// # Errors
///
/// Returns [`MioError::UnknownIdentifier`] if the name is not a characteristic of `service`.
pub fn resolve_characteristic(
    service: ServiceKind,
    name: &str,
) -> Result<CharacteristicDescriptor> {
    CharacteristicKind::parse_within(service, name)
        .map(CharacteristicKind::descriptor)
        .ok_or_else(|| MioError::UnknownIdentifier {
            kind: "characteristic",
            name: format!("{service}/{name}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_ids_expand_to_base_uuid() {
        let battery = resolve_service("battery").unwrap();
        assert_eq!(
            battery.uuid(),
            uuid!("0000180F-0000-1000-8000-00805F9B34FB")
        );
        assert_eq!(battery.id.to_string(), "0x180F");
    }

    #[test]
    fn test_vendor_ids_resolve_uniformly() {
        let sport = resolve_service("Mio Sport").unwrap();
        assert_eq!(sport.kind, ServiceKind::MioSport);
        assert_eq!(sport.uuid(), SERVICE_MIO_SPORT);

        let sensor = resolve_characteristic(ServiceKind::MioSport, "sensor").unwrap();
        assert_eq!(sensor.uuid(), CHAR_MIO_SENSOR);
        assert!(sensor.notifiable);
    }

    #[test]
    fn test_unknown_names_fail() {
        let err = resolve_service("cycling_power").unwrap_err();
        assert!(matches!(err, MioError::UnknownIdentifier { kind: "service", .. }));

        // valid name, wrong parent
        let err = resolve_characteristic(ServiceKind::Battery, "sensor").unwrap_err();
        assert!(matches!(
            err,
            MioError::UnknownIdentifier {
                kind: "characteristic",
                ..
            }
        ));
    }

    #[test]
    fn test_reverse_lookup() {
        for kind in CharacteristicKind::ALL {
            assert_eq!(CharacteristicKind::from_uuid(kind.descriptor().uuid()), Some(kind));
        }
        assert_eq!(CharacteristicKind::from_uuid(SERVICE_MIO_SPORT), None);
    }

    #[test]
    fn test_battery_is_resolved_first() {
        assert_eq!(ServiceKind::ALL[0], ServiceKind::Battery);
        assert_eq!(
            ServiceKind::MioSport.characteristics(),
            vec![
                CharacteristicKind::SportMsg,
                CharacteristicKind::SportUnknown,
                CharacteristicKind::SportMsgResp,
                CharacteristicKind::Sensor,
                CharacteristicKind::Record,
            ]
        );
    }
}
