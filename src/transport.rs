//! The radio capability a session consumes.
//!
//! A [`Transport`] only moves bytes and reports events. It knows nothing about
//! session states, profiles or payload formats. [`crate::ble::BleTransport`] is the
//! real implementation, [`crate::mock::MockTransport`] the scripted one.

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{Advertisement, PeripheralId, PowerState},
};

/// Something the radio reports without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Radio power changed; the current state is also reported first on subscription
    PowerChanged(PowerState),
    /// A peripheral advertised
    Advertisement(Advertisement),
    /// The link to a peripheral dropped
    Disconnected(PeripheralId),
    /// A subscribed characteristic pushed a value
    Notification {
        /// Source peripheral
        peripheral: PeripheralId,
        /// Source characteristic
        characteristic: Uuid,
        /// Pushed value
        value: Bytes,
    },
}

/// A service found on a connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Service UUID
    pub uuid: Uuid,
}

/// A characteristic found on a connected peripheral, with the capabilities it advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Parent service UUID
    pub service: Uuid,
    /// Advertised properties
    pub properties: CharPropFlags,
}

impl CharacteristicHandle {
    /// Supports one-shot reads
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    /// Supports writes, with or without response
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }

    /// Supports notify or indicate
    #[must_use]
    pub fn can_notify(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

/// Low energy radio operations
///
/// Every method may suspend for as long as the radio needs. The session runs each
/// call as its own cancellable task and applies its own timeouts.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream of unsolicited events. The first item is the current power state.
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>>;

    /// Scan for all advertising peripherals
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral seen while scanning
    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Find services with the given UUIDs
    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
    ) -> Result<Vec<ServiceHandle>>;

    /// Find characteristics with the given UUIDs under `service`
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>>;

    /// Read a characteristic once
    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
    ) -> Result<Bytes>;

    /// Write a characteristic
    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()>;

    /// Enable notifications; values then arrive as [`TransportEvent::Notification`]
    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
    ) -> Result<()>;

    /// Drop the link
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;
}
