use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{MioError, Result},
    transport::{CharacteristicHandle, ServiceHandle, Transport, TransportEvent},
    types::{Advertisement, PeripheralId, PowerState},
};

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>;

/// [`Transport`] over the host's first Bluetooth adapter
///
/// Peripherals are identified by their Bluetooth address.
pub struct BleTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    listeners: Listeners,
    forwarders: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport").finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Ble`] if the Bluetooth stack cannot be initialized, or
    /// [`MioError::AdapterUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(MioError::AdapterUnavailable)?;
        info!(
            "Using Bluetooth adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            forwarders: Mutex::new(HashMap::new()),
        })
    }

    async fn peripheral(&self, id: &PeripheralId, operation: &'static str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(id) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.adapter.peripherals().await? {
            if id.matches(&peripheral.address().to_string()) {
                self.peripherals
                    .lock()
                    .await
                    .insert(id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(MioError::transport(
            operation,
            id.to_string(),
            "peripheral has not been seen by the adapter",
        ))
    }

    async fn forward_notifications(&self, id: &PeripheralId, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| MioError::transport("subscribe", id.to_string(), e))?;
        let listeners = Arc::clone(&self.listeners);
        let source = id.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::Notification {
                    peripheral: source.clone(),
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                };
                listeners
                    .lock()
                    .await
                    .retain(|listener| listener.send(event.clone()).is_ok());
            }
            debug!("Notification stream for {} ended", source);
        });

        if let Some(previous) = self.forwarders.lock().await.insert(id.clone(), forwarder) {
            previous.abort();
        }
        Ok(())
    }
}

fn power_state(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
    operation: &'static str,
) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
        .ok_or_else(|| {
            MioError::transport(operation, handle.uuid.to_string(), "characteristic not discovered")
        })
}

async fn advertisement(
    adapter: &Adapter,
    known: &Mutex<HashMap<PeripheralId, Peripheral>>,
    id: &btleplug::platform::PeripheralId,
) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let peripheral_id = PeripheralId::new(properties.address.to_string());
    known.lock().await.insert(peripheral_id.clone(), peripheral);

    Some(Advertisement {
        peripheral: Some(peripheral_id),
        local_name: properties.local_name,
        rssi: properties.rssi,
        tx_power_level: properties.tx_power_level,
        manufacturer_data: properties.manufacturer_data,
        service_data: properties.service_data,
    })
}

async fn translate(
    adapter: &Adapter,
    known: &Mutex<HashMap<PeripheralId, Peripheral>>,
    event: CentralEvent,
) -> Option<TransportEvent> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            advertisement(adapter, known, &id)
                .await
                .map(TransportEvent::Advertisement)
        }
        CentralEvent::DeviceDisconnected(id) => {
            let peripheral = adapter.peripheral(&id).await.ok()?;
            Some(TransportEvent::Disconnected(PeripheralId::new(
                peripheral.address().to_string(),
            )))
        }
        CentralEvent::StateUpdate(state) => Some(TransportEvent::PowerChanged(power_state(state))),
        _ => None,
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let power = match self.adapter.adapter_state().await {
            Ok(state) => power_state(state),
            Err(e) => {
                warn!("Could not read adapter state: {}", e);
                PowerState::Unknown
            }
        };
        let central = self.adapter.events().await?;

        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.peripherals);
        let radio = central.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = Arc::clone(&known);
            async move { translate(&adapter, &known, event).await }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(tx);
        let notifications = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(stream::once(async move { TransportEvent::PowerChanged(power) })
            .chain(stream::select(radio, notifications))
            .boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting scan");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| MioError::transport("scan", "adapter", e))
    }

    async fn stop_scan(&self) -> Result<()> {
        debug!("Stopping scan");
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| MioError::transport("stop scan", "adapter", e))
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id, "connect").await?;
        peripheral
            .connect()
            .await
            .map_err(|e| MioError::transport("connect", id.to_string(), e))?;
        self.forward_notifications(id, &peripheral).await
    }

    async fn discover_services(
        &self,
        id: &PeripheralId,
        services: &[Uuid],
    ) -> Result<Vec<ServiceHandle>> {
        let peripheral = self.peripheral(id, "discover services").await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| MioError::transport("discover services", id.to_string(), e))?;

        let found: Vec<_> = peripheral
            .services()
            .into_iter()
            .filter(|s| services.contains(&s.uuid))
            .map(|s| ServiceHandle { uuid: s.uuid })
            .collect();
        debug!("{} of {} wanted service(s) offered by {}", found.len(), services.len(), id);
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>> {
        let peripheral = self.peripheral(id, "discover characteristics").await?;
        let Some(offered) = peripheral.services().into_iter().find(|s| s.uuid == service.uuid) else {
            return Err(MioError::transport(
                "discover characteristics",
                service.uuid.to_string(),
                "service not discovered",
            ));
        };

        Ok(offered
            .characteristics
            .into_iter()
            .filter(|c| characteristics.contains(&c.uuid))
            .map(|c| CharacteristicHandle {
                uuid: c.uuid,
                service: c.service_uuid,
                properties: c.properties,
            })
            .collect())
    }

    async fn read(&self, id: &PeripheralId, handle: &CharacteristicHandle) -> Result<Bytes> {
        let peripheral = self.peripheral(id, "read").await?;
        let characteristic = find_characteristic(&peripheral, handle, "read")?;
        let value = peripheral
            .read(&characteristic)
            .await
            .map_err(|e| MioError::transport("read", handle.uuid.to_string(), e))?;
        debug!("Read {:02X?} from {}", value, handle.uuid);
        Ok(Bytes::from(value))
    }

    async fn write(&self, id: &PeripheralId, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(id, "write").await?;
        let characteristic = find_characteristic(&peripheral, handle, "write")?;
        let write_type = if handle
            .properties
            .contains(btleplug::api::CharPropFlags::WRITE)
        {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", data, handle.uuid);
        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| MioError::transport("write", handle.uuid.to_string(), e))
    }

    async fn subscribe(&self, id: &PeripheralId, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.peripheral(id, "subscribe").await?;
        let characteristic = find_characteristic(&peripheral, handle, "subscribe")?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| MioError::transport("subscribe", handle.uuid.to_string(), e))
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        if let Some(forwarder) = self.forwarders.lock().await.remove(id) {
            forwarder.abort();
        }
        let peripheral = self.peripheral(id, "disconnect").await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| MioError::transport("disconnect", id.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::CharacteristicKind;
    use btleplug::api::bleuuid::uuid_from_u16;

    #[tokio::test]
    #[ignore = "needs a Bluetooth adapter"]
    async fn test_transport_creation() {
        let transport = BleTransport::new().await;
        assert!(transport.is_ok());
    }

    #[test]
    fn test_uuid_expansion() {
        assert_eq!(
            CharacteristicKind::BatteryLevel.descriptor().uuid(),
            uuid_from_u16(0x2A19)
        );
        assert_eq!(
            CharacteristicKind::SportMsg.descriptor().uuid(),
            Uuid::parse_str("6C722A80-5BF1-4F64-9170-381C08EC57EE").unwrap()
        );
    }

    #[test]
    fn test_power_state_mapping() {
        assert_eq!(power_state(CentralState::PoweredOn), PowerState::PoweredOn);
        assert_eq!(power_state(CentralState::PoweredOff), PowerState::PoweredOff);
        assert_eq!(power_state(CentralState::Unknown), PowerState::Unknown);
    }
}
