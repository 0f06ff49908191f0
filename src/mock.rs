//! Scriptable in-memory [`Transport`].
//!
//! Peripherals, their characteristics and failure modes are configured up front;
//! test code then drives power changes, notifications and link loss by hand. Every
//! call the session makes is recorded so tests can assert on ordering.

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{MioError, Result},
    gatt::{CharacteristicKind, ServiceKind},
    transport::{CharacteristicHandle, ServiceHandle, Transport, TransportEvent},
    types::{Advertisement, PeripheralId, PowerState},
};

/// One characteristic on a simulated peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Parent service UUID
    pub service: Uuid,
    /// Advertised properties
    pub properties: CharPropFlags,
    /// Value returned by reads
    pub value: Bytes,
}

/// A simulated peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPeripheral {
    /// Advertised identifier
    pub id: PeripheralId,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Offered characteristics
    pub characteristics: Vec<MockCharacteristic>,
}

impl MockPeripheral {
    /// Peripheral with nothing on it
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            local_name: None,
            characteristics: Vec::new(),
        }
    }

    /// A Mio wearable offering battery, heart rate and the sport service
    pub fn mio(id: impl Into<PeripheralId>) -> Self {
        Self::new(id)
            .with_name("MIO GLOBAL")
            .with(
                CharacteristicKind::BatteryLevel,
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                vec![87],
            )
            .with(CharacteristicKind::HeartRateMeasurement, CharPropFlags::NOTIFY, Bytes::new())
            .with(CharacteristicKind::BodySensorLocation, CharPropFlags::READ, vec![2])
            .with(
                CharacteristicKind::SportMsg,
                CharPropFlags::READ | CharPropFlags::WRITE,
                Bytes::new(),
            )
            .with(
                CharacteristicKind::SportMsgResp,
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                Bytes::new(),
            )
            .with(
                CharacteristicKind::Sensor,
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                Bytes::new(),
            )
            .with(
                CharacteristicKind::Record,
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                Bytes::new(),
            )
    }

    /// Set the advertised local name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Offer a characteristic under its own service
    #[must_use]
    pub fn with(
        mut self,
        kind: CharacteristicKind,
        properties: CharPropFlags,
        value: impl Into<Bytes>,
    ) -> Self {
        let descriptor = kind.descriptor();
        self.characteristics.retain(|c| c.uuid != descriptor.uuid());
        self.characteristics.push(MockCharacteristic {
            uuid: descriptor.uuid(),
            service: descriptor.service.descriptor().uuid(),
            properties,
            value: value.into(),
        });
        self
    }

    /// Remove a characteristic
    #[must_use]
    pub fn without(mut self, kind: CharacteristicKind) -> Self {
        let uuid = kind.descriptor().uuid();
        self.characteristics.retain(|c| c.uuid != uuid);
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            peripheral: Some(self.id.clone()),
            local_name: self.local_name.clone(),
            rssi: Some(-60),
            ..Advertisement::default()
        }
    }
}

/// A transport call, as recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(PeripheralId),
    /// `discover_services`
    DiscoverServices(PeripheralId),
    /// `discover_characteristics` for a service
    DiscoverCharacteristics(Uuid),
    /// `read` of a characteristic
    Read(Uuid),
    /// `write` to a characteristic
    Write(Uuid, Bytes),
    /// `subscribe` to a characteristic
    Subscribe(Uuid),
    /// `disconnect`
    Disconnect(PeripheralId),
}

#[derive(Debug)]
struct MockState {
    power: PowerState,
    peripherals: Vec<MockPeripheral>,
    connected: HashSet<PeripheralId>,
    connect_failures: u32,
    hanging_reads: HashSet<Uuid>,
    failing_discovery: HashSet<Uuid>,
    manual_advertising: bool,
    calls: Vec<MockCall>,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
}

impl MockState {
    fn emit(&mut self, event: &TransportEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    fn peripheral(&self, id: &PeripheralId, operation: &'static str) -> Result<&MockPeripheral> {
        self.peripherals
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| MioError::transport(operation, id.to_string(), "unknown peripheral"))
    }

    fn linked(&self, id: &PeripheralId, operation: &'static str) -> Result<&MockPeripheral> {
        if !self.connected.contains(id) {
            return Err(MioError::transport(operation, id.to_string(), "not connected"));
        }
        self.peripheral(id, operation)
    }
}

/// In-memory transport for tests and demos
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Powered-on radio with no peripherals
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                power: PowerState::PoweredOn,
                peripherals: Vec::new(),
                connected: HashSet::new(),
                connect_failures: 0,
                hanging_reads: HashSet::new(),
                failing_discovery: HashSet::new(),
                manual_advertising: false,
                calls: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Add a peripheral; it advertises, in insertion order, whenever a scan starts
    #[must_use]
    pub fn with_peripheral(mut self, peripheral: MockPeripheral) -> Self {
        self.state.get_mut().peripherals.push(peripheral);
        self
    }

    /// Initial radio power state
    #[must_use]
    pub fn with_power(mut self, power: PowerState) -> Self {
        self.state.get_mut().power = power;
        self
    }

    /// Fail the next `count` connect calls
    #[must_use]
    pub fn with_connect_failures(mut self, count: u32) -> Self {
        self.state.get_mut().connect_failures = count;
        self
    }

    /// Reads of `kind` never complete
    #[must_use]
    pub fn with_hanging_read(mut self, kind: CharacteristicKind) -> Self {
        self.state
            .get_mut()
            .hanging_reads
            .insert(kind.descriptor().uuid());
        self
    }

    /// Characteristic discovery on `service` fails
    #[must_use]
    pub fn with_failing_discovery(mut self, service: ServiceKind) -> Self {
        self.state
            .get_mut()
            .failing_discovery
            .insert(service.descriptor().uuid());
        self
    }

    /// Scans advertise nothing on their own; tests call [`MockTransport::advertise`]
    #[must_use]
    pub fn with_manual_advertising(mut self) -> Self {
        self.state.get_mut().manual_advertising = true;
        self
    }

    /// Change the radio power state
    pub async fn set_power(&self, power: PowerState) {
        let mut state = self.state.lock().await;
        state.power = power;
        state.emit(&TransportEvent::PowerChanged(power));
    }

    /// Emit an advertisement
    pub async fn advertise(&self, advertisement: Advertisement) {
        self.state
            .lock()
            .await
            .emit(&TransportEvent::Advertisement(advertisement));
    }

    /// Push a value as if `kind` had notified
    pub async fn notify(
        &self,
        peripheral: impl Into<PeripheralId>,
        kind: CharacteristicKind,
        value: impl Into<Bytes>,
    ) {
        self.state.lock().await.emit(&TransportEvent::Notification {
            peripheral: peripheral.into(),
            characteristic: kind.descriptor().uuid(),
            value: value.into(),
        });
    }

    /// Drop the link to a peripheral without being asked
    pub async fn drop_link(&self, peripheral: impl Into<PeripheralId>) {
        let peripheral = peripheral.into();
        let mut state = self.state.lock().await;
        state.connected.remove(&peripheral);
        state.emit(&TransportEvent::Disconnected(peripheral));
    }

    /// Close every event stream handed out so far
    pub async fn close(&self) {
        self.state.lock().await.subscribers.clear();
    }

    /// Every call made so far
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of recorded calls matching `filter`
    pub async fn count(&self, filter: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().await.calls.iter().filter(|c| filter(c)).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        // An unbounded send only fails once the receiver is gone, and it is still here.
        let _ = tx.send(TransportEvent::PowerChanged(state.power));
        state.subscribers.push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::StartScan);
        if state.power != PowerState::PoweredOn {
            return Err(MioError::transport("scan", "adapter", "radio is not powered on"));
        }
        if state.manual_advertising {
            return Ok(());
        }
        let advertisements: Vec<_> = state.peripherals.iter().map(MockPeripheral::advertisement).collect();
        for advertisement in advertisements {
            state.emit(&TransportEvent::Advertisement(advertisement));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().await.calls.push(MockCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::Connect(peripheral.clone()));
        state.peripheral(peripheral, "connect")?;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(MioError::transport("connect", peripheral.to_string(), "connection refused"));
        }
        state.connected.insert(peripheral.clone());
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
    ) -> Result<Vec<ServiceHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::DiscoverServices(peripheral.clone()));
        let offered: HashSet<Uuid> = state
            .linked(peripheral, "discover services")?
            .characteristics
            .iter()
            .map(|c| c.service)
            .collect();
        Ok(services
            .iter()
            .filter(|uuid| offered.contains(uuid))
            .map(|&uuid| ServiceHandle { uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::DiscoverCharacteristics(service.uuid));
        if state.failing_discovery.contains(&service.uuid) {
            return Err(MioError::transport(
                "discover characteristics",
                peripheral.to_string(),
                "attribute table read failed",
            ));
        }
        Ok(state
            .linked(peripheral, "discover characteristics")?
            .characteristics
            .iter()
            .filter(|c| c.service == service.uuid && characteristics.contains(&c.uuid))
            .map(|c| CharacteristicHandle {
                uuid: c.uuid,
                service: c.service,
                properties: c.properties,
            })
            .collect())
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
    ) -> Result<Bytes> {
        let value = {
            let mut state = self.state.lock().await;
            state.calls.push(MockCall::Read(characteristic.uuid));
            let hang = state.hanging_reads.contains(&characteristic.uuid);
            let value = state
                .linked(peripheral, "read")?
                .characteristics
                .iter()
                .find(|c| c.uuid == characteristic.uuid)
                .map(|c| c.value.clone())
                .ok_or_else(|| {
                    MioError::transport("read", characteristic.uuid.to_string(), "no such characteristic")
                })?;
            if hang {
                None
            } else {
                Some(value)
            }
        };
        match value {
            Some(value) => Ok(value),
            None => {
                debug!("Read of {} will never complete", characteristic.uuid);
                futures::future::pending().await
            }
        }
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(MockCall::Write(characteristic.uuid, Bytes::copy_from_slice(data)));
        state.linked(peripheral, "write")?;
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::Subscribe(characteristic.uuid));
        state.linked(peripheral, "subscribe")?;
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::Disconnect(peripheral.clone()));
        if state.connected.remove(peripheral) {
            state.emit(&TransportEvent::Disconnected(peripheral.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_advertises_configured_peripherals() {
        let mock = MockTransport::new()
            .with_peripheral(MockPeripheral::new("11:22"))
            .with_peripheral(MockPeripheral::mio("AA:BB"));
        let mut events = mock.events().await.unwrap();

        assert_eq!(
            events.next().await,
            Some(TransportEvent::PowerChanged(PowerState::PoweredOn))
        );
        mock.start_scan().await.unwrap();

        let ids: Vec<_> = events
            .take(2)
            .filter_map(|e| async move {
                match e {
                    TransportEvent::Advertisement(a) => a.peripheral,
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(ids, vec![PeripheralId::from("11:22"), PeripheralId::from("aa:bb")]);
    }

    #[test]
    fn test_builder_records_no_calls() {
        let mock = MockTransport::new()
            .with_power(PowerState::PoweredOff)
            .with_peripheral(MockPeripheral::mio("AA:BB").without(CharacteristicKind::Record));
        assert!(tokio_test::block_on(mock.calls()).is_empty());
        assert!(tokio_test::block_on(mock.start_scan()).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_a_link() {
        let mock = MockTransport::new()
            .with_peripheral(MockPeripheral::mio("AA:BB"))
            .with_connect_failures(1);
        let id = PeripheralId::from("aa:bb");

        assert!(mock.discover_services(&id, &[]).await.is_err());
        assert!(mock.connect(&id).await.is_err());
        mock.connect(&id).await.unwrap();

        let battery = CharacteristicKind::BatteryLevel.descriptor();
        let services = mock
            .discover_services(&id, &[battery.service.descriptor().uuid()])
            .await
            .unwrap();
        assert_eq!(services.len(), 1);

        let chars = mock
            .discover_characteristics(&id, &services[0], &[battery.uuid()])
            .await
            .unwrap();
        assert!(chars[0].can_read() && chars[0].can_notify());
        assert_eq!(mock.read(&id, &chars[0]).await.unwrap(), Bytes::from_static(&[87]));

        assert_eq!(mock.count(|c| matches!(c, MockCall::Connect(_))).await, 2);
    }
}
