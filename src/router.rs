//! Decoding and fan-out of values read from or pushed by the device.
//!
//! Decoders are registered per characteristic UUID. A characteristic without a
//! decoder is delivered as [`Telemetry::Raw`], so new telemetry formats plug in
//! here without touching the session.

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::DecodeError,
    gatt::CharacteristicKind,
};

/// How a value reached the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadSource {
    /// Result of a one-shot read
    Read,
    /// Pushed by a subscription
    Notification,
}

/// Where the heart rate sensor sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodySensorLocation {
    /// Other
    Other,
    /// Chest
    Chest,
    /// Wrist
    Wrist,
    /// Finger
    Finger,
    /// Hand
    Hand,
    /// Ear lobe
    EarLobe,
    /// Foot
    Foot,
}

impl TryFrom<u8> for BodySensorLocation {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Other),
            1 => Ok(Self::Chest),
            2 => Ok(Self::Wrist),
            3 => Ok(Self::Finger),
            4 => Ok(Self::Hand),
            5 => Ok(Self::EarLobe),
            6 => Ok(Self::Foot),
            _ => Err(DecodeError::OutOfRange {
                format: "body sensor location",
                value: u32::from(value),
            }),
        }
    }
}

/// One heart rate measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    /// Beats per minute
    pub bpm: u16,
    /// Skin contact, if the sensor reports it
    pub sensor_contact: Option<bool>,
    /// Energy expended in kilojoules
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in units of 1/1024 s
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// RR intervals in milliseconds
    #[must_use]
    pub fn rr_intervals_ms(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .map(|rr| f64::from(*rr) * 1000.0 / 1024.0)
            .collect()
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    /// Battery level in percent
    BatteryLevel(u8),
    /// Heart rate measurement
    HeartRate(HeartRateMeasurement),
    /// Body sensor location
    BodySensorLocation(BodySensorLocation),
    /// Value without a registered decoder
    Raw(Bytes),
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatteryLevel(level) => write!(f, "Battery level: {level}%"),
            Self::HeartRate(hr) => write!(f, "Heart rate: {} bpm", hr.bpm),
            Self::BodySensorLocation(location) => write!(f, "Body sensor location: {location:?}"),
            Self::Raw(bytes) => write!(f, "Raw: {:02X?}", bytes.as_ref()),
        }
    }
}

/// A value routed to telemetry observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    /// Source characteristic
    pub characteristic: Uuid,
    /// Logical characteristic, when known
    pub kind: Option<CharacteristicKind>,
    /// How the value arrived
    pub source: ReadSource,
    /// Decoded value or the reason decoding failed
    pub telemetry: Result<Telemetry, DecodeError>,
}

/// Payload decoder for one characteristic
pub trait TelemetryDecoder: Send + Sync {
    /// Decode one payload
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload does not match the format.
    fn decode(&self, payload: &[u8]) -> Result<Telemetry, DecodeError>;
}

impl<F> TelemetryDecoder for F
where
    F: Fn(&[u8]) -> Result<Telemetry, DecodeError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<Telemetry, DecodeError> {
        self(payload)
    }
}

/// Battery level: exactly one byte, 0..=100
#[derive(Debug, Clone, Copy, Default)]
pub struct BatteryLevelDecoder;

impl BatteryLevelDecoder {
    /// Decode a battery payload to a percentage
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::WrongLength`] unless the payload is one byte and
    /// [`DecodeError::OutOfRange`] above 100.
    pub fn level(payload: &[u8]) -> Result<u8, DecodeError> {
        let [level] = payload else {
            return Err(DecodeError::WrongLength {
                format: "battery level",
                expected: "1".to_string(),
                actual: payload.len(),
            });
        };
        if *level > 100 {
            return Err(DecodeError::OutOfRange {
                format: "battery level",
                value: u32::from(*level),
            });
        }
        Ok(*level)
    }
}

impl TelemetryDecoder for BatteryLevelDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Telemetry, DecodeError> {
        Self::level(payload).map(Telemetry::BatteryLevel)
    }
}

/// Standard heart rate measurement (0x2A37)
///
/// - Byte 0: flags (bit 0 = 16-bit value, bits 1-2 = contact status, bit 3 = energy, bit 4 = RR)
/// - Heart rate as u8 or u16 little-endian
/// - Energy expended, u16 little-endian, if flagged
/// - Zero or more RR intervals, u16 little-endian, if flagged
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartRateDecoder;

impl HeartRateDecoder {
    const FORMAT: &'static str = "heart rate measurement";

    fn truncated(actual: usize) -> DecodeError {
        DecodeError::WrongLength {
            format: Self::FORMAT,
            expected: "length implied by flags".to_string(),
            actual,
        }
    }
}

impl TelemetryDecoder for HeartRateDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Telemetry, DecodeError> {
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(Self::truncated(0));
        }
        let flags = buf.get_u8();

        let bpm = if flags & 0x01 == 0 {
            if buf.remaining() < 1 {
                return Err(Self::truncated(payload.len()));
            }
            u16::from(buf.get_u8())
        } else {
            if buf.remaining() < 2 {
                return Err(Self::truncated(payload.len()));
            }
            buf.get_u16_le()
        };

        let sensor_contact = (flags & 0x04 != 0).then_some(flags & 0x02 != 0);

        let energy_expended_kj = if flags & 0x08 == 0 {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(Self::truncated(payload.len()));
            }
            Some(buf.get_u16_le())
        };

        let mut rr_intervals = Vec::new();
        if flags & 0x10 != 0 {
            if buf.remaining() % 2 != 0 {
                return Err(DecodeError::Malformed {
                    format: Self::FORMAT,
                    reason: "odd number of RR interval bytes".to_string(),
                });
            }
            while buf.remaining() >= 2 {
                rr_intervals.push(buf.get_u16_le());
            }
        }

        Ok(Telemetry::HeartRate(HeartRateMeasurement {
            bpm,
            sensor_contact,
            energy_expended_kj,
            rr_intervals,
        }))
    }
}

/// Standard body sensor location (0x2A38), one byte
#[derive(Debug, Clone, Copy, Default)]
pub struct BodySensorLocationDecoder;

impl TelemetryDecoder for BodySensorLocationDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Telemetry, DecodeError> {
        let [location] = payload else {
            return Err(DecodeError::WrongLength {
                format: "body sensor location",
                expected: "1".to_string(),
                actual: payload.len(),
            });
        };
        BodySensorLocation::try_from(*location).map(Telemetry::BodySensorLocation)
    }
}

/// Observer for battery readings
pub type BatteryObserver = Box<dyn Fn(Result<u8, DecodeError>) + Send + Sync>;

/// Observer for everything that is not a battery reading
pub type TelemetryObserver = Box<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Routes raw payloads to decoders and decoded values to observers
///
/// Observers run on the session's dispatch task and must return quickly; hand slow
/// work off to a channel or a spawned task.
pub struct NotificationRouter {
    decoders: HashMap<Uuid, Arc<dyn TelemetryDecoder>>,
    battery_observers: Vec<BatteryObserver>,
    telemetry_observers: Vec<TelemetryObserver>,
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("battery_observers", &self.battery_observers.len())
            .field("telemetry_observers", &self.telemetry_observers.len())
            .finish()
    }
}

impl NotificationRouter {
    /// Router with only the battery decoder registered
    #[must_use]
    pub fn new() -> Self {
        let mut router = Self {
            decoders: HashMap::new(),
            battery_observers: Vec::new(),
            telemetry_observers: Vec::new(),
        };
        router.register_decoder(
            CharacteristicKind::BatteryLevel.descriptor().uuid(),
            BatteryLevelDecoder,
        );
        router
    }

    /// Router that also decodes heart rate and body sensor location
    #[must_use]
    pub fn with_standard_decoders() -> Self {
        let mut router = Self::new();
        router.register_decoder(
            CharacteristicKind::HeartRateMeasurement.descriptor().uuid(),
            HeartRateDecoder,
        );
        router.register_decoder(
            CharacteristicKind::BodySensorLocation.descriptor().uuid(),
            BodySensorLocationDecoder,
        );
        router
    }

    /// Register or replace the decoder for a characteristic
    pub fn register_decoder(
        &mut self,
        characteristic: Uuid,
        decoder: impl TelemetryDecoder + 'static,
    ) -> &mut Self {
        self.decoders.insert(characteristic, Arc::new(decoder));
        self
    }

    /// Observe battery readings, including malformed ones
    pub fn on_battery_level(
        &mut self,
        observer: impl Fn(Result<u8, DecodeError>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.battery_observers.push(Box::new(observer));
        self
    }

    /// Observe all other telemetry
    pub fn on_telemetry(
        &mut self,
        observer: impl Fn(&TelemetryEvent) + Send + Sync + 'static,
    ) -> &mut Self {
        self.telemetry_observers.push(Box::new(observer));
        self
    }

    pub(crate) fn add_battery_observer(&mut self, observer: BatteryObserver) {
        self.battery_observers.push(observer);
    }

    pub(crate) fn add_telemetry_observer(&mut self, observer: TelemetryObserver) {
        self.telemetry_observers.push(observer);
    }

    /// Decode `payload` from `characteristic` and notify observers
    pub fn route(&self, characteristic: Uuid, source: ReadSource, payload: &[u8]) -> TelemetryEvent {
        let kind = CharacteristicKind::from_uuid(characteristic);
        let telemetry = match self.decoders.get(&characteristic) {
            Some(decoder) => decoder.decode(payload),
            None => Ok(Telemetry::Raw(Bytes::copy_from_slice(payload))),
        };

        match &telemetry {
            Ok(value) => debug!("{} via {:?}: {}", describe(kind, characteristic), source, value),
            Err(e) => warn!("Dropping malformed {} payload {:02X?}: {}", describe(kind, characteristic), payload, e),
        }

        let event = TelemetryEvent {
            characteristic,
            kind,
            source,
            telemetry,
        };

        if kind == Some(CharacteristicKind::BatteryLevel) {
            let reading = match &event.telemetry {
                Ok(Telemetry::BatteryLevel(level)) => Ok(*level),
                Ok(other) => Err(DecodeError::Malformed {
                    format: "battery level",
                    reason: format!("decoder produced {other}"),
                }),
                Err(e) => Err(e.clone()),
            };
            for observer in &self.battery_observers {
                observer(reading.clone());
            }
        } else {
            for observer in &self.telemetry_observers {
                observer(&event);
            }
        }

        event
    }
}

fn describe(kind: Option<CharacteristicKind>, characteristic: Uuid) -> String {
    kind.map_or_else(|| characteristic.to_string(), |k| k.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn battery_uuid() -> Uuid {
        CharacteristicKind::BatteryLevel.descriptor().uuid()
    }

    #[test]
    fn test_battery_decoding() {
        assert_eq!(BatteryLevelDecoder::level(&[87]), Ok(87));
        assert_eq!(BatteryLevelDecoder::level(&[0]), Ok(0));
        assert_eq!(BatteryLevelDecoder::level(&[100]), Ok(100));
        assert!(matches!(
            BatteryLevelDecoder::level(&[101]),
            Err(DecodeError::OutOfRange { value: 101, .. })
        ));
        assert!(matches!(
            BatteryLevelDecoder::level(&[]),
            Err(DecodeError::WrongLength { actual: 0, .. })
        ));
        assert!(matches!(
            BatteryLevelDecoder::level(&[50, 0]),
            Err(DecodeError::WrongLength { actual: 2, .. })
        ));
    }

    #[test]
    fn test_malformed_battery_reaches_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = NotificationRouter::new();
        let sink = seen.clone();
        router.on_battery_level(move |reading| sink.lock().unwrap().push(reading));

        router.route(battery_uuid(), ReadSource::Notification, &[42]);
        router.route(battery_uuid(), ReadSource::Notification, &[42, 1]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Ok(42));
        assert!(matches!(seen[1], Err(DecodeError::WrongLength { actual: 2, .. })));
    }

    #[test]
    fn test_unregistered_characteristics_are_raw() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = NotificationRouter::new();
        let sink = seen.clone();
        router.on_telemetry(move |event| sink.lock().unwrap().push(event.clone()));

        let hr = CharacteristicKind::HeartRateMeasurement.descriptor().uuid();
        router.route(hr, ReadSource::Notification, &[0x00, 72]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, Some(CharacteristicKind::HeartRateMeasurement));
        assert_eq!(
            seen[0].telemetry,
            Ok(Telemetry::Raw(Bytes::from_static(&[0x00, 72])))
        );
    }

    #[test]
    fn test_battery_not_sent_to_telemetry_observers() {
        let count = Arc::new(Mutex::new(0));
        let mut router = NotificationRouter::new();
        let sink = count.clone();
        router.on_telemetry(move |_| *sink.lock().unwrap() += 1);
        router.route(battery_uuid(), ReadSource::Read, &[10]);
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_custom_decoder_registration() {
        let mut router = NotificationRouter::new();
        let sensor = CharacteristicKind::Sensor.descriptor().uuid();
        router.register_decoder(sensor, |payload: &[u8]| -> Result<Telemetry, DecodeError> {
            Ok(Telemetry::Raw(Bytes::copy_from_slice(&payload[..1.min(payload.len())])))
        });
        let event = router.route(sensor, ReadSource::Notification, &[1, 2, 3]);
        assert_eq!(event.telemetry, Ok(Telemetry::Raw(Bytes::from_static(&[1]))));
    }

    #[test]
    fn test_heart_rate_decoding() {
        let decoder = HeartRateDecoder;

        let Ok(Telemetry::HeartRate(hr)) = decoder.decode(&[0x06, 72]) else {
            panic!("expected heart rate");
        };
        assert_eq!(hr.bpm, 72);
        assert_eq!(hr.sensor_contact, Some(true));
        assert!(hr.rr_intervals.is_empty());

        // 16-bit value, energy expended, two RR intervals
        let Ok(Telemetry::HeartRate(hr)) =
            decoder.decode(&[0x19, 0x2C, 0x01, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02])
        else {
            panic!("expected heart rate");
        };
        assert_eq!(hr.bpm, 300);
        assert_eq!(hr.sensor_contact, None);
        assert_eq!(hr.energy_expended_kj, Some(16));
        assert_eq!(hr.rr_intervals, vec![1024, 512]);
        assert_eq!(hr.rr_intervals_ms(), vec![1000.0, 500.0]);

        assert!(matches!(
            decoder.decode(&[0x01, 0x48]),
            Err(DecodeError::WrongLength { .. })
        ));
        assert!(matches!(
            decoder.decode(&[0x10, 72, 0x01]),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_standard_decoders() {
        let router = NotificationRouter::with_standard_decoders();
        let location = CharacteristicKind::BodySensorLocation.descriptor().uuid();
        let event = router.route(location, ReadSource::Read, &[2]);
        assert_eq!(
            event.telemetry,
            Ok(Telemetry::BodySensorLocation(BodySensorLocation::Wrist))
        );
        let event = router.route(location, ReadSource::Read, &[9]);
        assert!(matches!(event.telemetry, Err(DecodeError::OutOfRange { value: 9, .. })));
    }
}
