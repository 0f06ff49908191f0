//! Session lifecycle as a pure state machine.
//!
//! [`SessionMachine::handle`] applies one [`Input`] and returns the [`Effect`]s the
//! caller must carry out. Nothing here touches the radio, so every transition can be
//! exercised without hardware. [`crate::session`] drives it from a single event queue.

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionMode,
    error::{MioError, Result},
    gatt::{CharacteristicDescriptor, CharacteristicKind},
    router::ReadSource,
    transport::CharacteristicHandle,
    types::{Advertisement, PeripheralId, PowerState, SessionState},
};

/// A characteristic found on the connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    /// What the session expected
    pub descriptor: CharacteristicDescriptor,
    /// What the peripheral actually offers
    pub handle: CharacteristicHandle,
}

impl ResolvedCharacteristic {
    /// Logical characteristic
    #[must_use]
    pub const fn kind(&self) -> CharacteristicKind {
        self.descriptor.kind
    }
}

/// Everything that can move the session
#[derive(Debug)]
pub enum Input {
    /// Radio power changed
    Power(PowerState),
    /// Starting the scan failed
    ScanFailed(MioError),
    /// A peripheral advertised
    Advertised(Advertisement),
    /// The connect request completed
    ConnectFinished(Result<()>),
    /// Service and characteristic resolution completed
    Resolved(Result<Vec<ResolvedCharacteristic>>),
    /// A session-issued one-shot read completed
    ReadFinished {
        /// Characteristic that was read
        characteristic: CharacteristicKind,
        /// Value or failure
        result: Result<Bytes>,
    },
    /// A subscribe request completed
    SubscribeFinished {
        /// Characteristic subscribed to
        characteristic: CharacteristicKind,
        /// Outcome
        result: Result<()>,
    },
    /// A subscribed characteristic pushed a value
    Notification {
        /// Source peripheral
        peripheral: PeripheralId,
        /// Source characteristic
        characteristic: Uuid,
        /// Pushed value
        value: Bytes,
    },
    /// The link to a peripheral dropped
    LinkLost(PeripheralId),
    /// The transport stopped delivering events
    TransportClosed,
    /// The caller asked for teardown
    StopRequested,
    /// A disconnect request completed
    DisconnectFinished(Result<()>),
}

/// Work the driver must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// State changed; publish it
    Transition {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// Start scanning for all peripherals
    StartScan,
    /// Stop scanning
    StopScan,
    /// Connect to the peripheral
    Connect(PeripheralId),
    /// Resolve the configured services and characteristics
    Resolve(PeripheralId),
    /// Read a characteristic once
    Read(ResolvedCharacteristic),
    /// Subscribe to a characteristic
    Subscribe(ResolvedCharacteristic),
    /// Hand a value to the notification router
    Route {
        /// Source characteristic
        characteristic: Uuid,
        /// How it arrived
        source: ReadSource,
        /// Raw value
        value: Bytes,
    },
    /// Abort every outstanding transport operation
    CancelPending,
    /// Drop the link
    Disconnect(PeripheralId),
    /// The session is over
    Finish,
}

/// Session state plus the facts transitions depend on
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    identity: PeripheralId,
    mode: SessionMode,
    connect_attempts: u32,
    attempts_used: u32,
    peripheral: Option<PeripheralId>,
    resolved: Vec<ResolvedCharacteristic>,
    initial_battery_read: bool,
    outcome: Option<MioError>,
}

impl SessionMachine {
    /// Fresh machine in [`SessionState::Idle`]
    #[must_use]
    pub fn new(identity: PeripheralId, mode: SessionMode, connect_attempts: u32) -> Self {
        Self {
            state: SessionState::Idle,
            identity,
            mode,
            connect_attempts: connect_attempts.max(1),
            attempts_used: 0,
            peripheral: None,
            resolved: Vec::new(),
            initial_battery_read: false,
            outcome: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Peripheral the session matched, once discovered
    #[must_use]
    pub const fn peripheral(&self) -> Option<&PeripheralId> {
        self.peripheral.as_ref()
    }

    /// A resolved characteristic, if the peripheral offered it
    #[must_use]
    pub fn resolved(&self, kind: CharacteristicKind) -> Option<ResolvedCharacteristic> {
        self.resolved.iter().copied().find(|c| c.kind() == kind)
    }

    /// Why the session ended, if it ended badly. Can be taken once.
    pub fn take_outcome(&mut self) -> Option<MioError> {
        self.outcome.take()
    }

    /// Apply one input
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Power(power) => self.on_power(power, &mut effects),
            Input::ScanFailed(e) => {
                if self.state == SessionState::Scanning {
                    warn!("Scan failed: {}", e);
                    self.fail(e);
                    self.finish(&mut effects);
                }
            }
            Input::Advertised(advertisement) => self.on_advertisement(&advertisement, &mut effects),
            Input::ConnectFinished(result) => self.on_connect(result, &mut effects),
            Input::Resolved(result) => self.on_resolved(result, &mut effects),
            Input::ReadFinished {
                characteristic,
                result,
            } => self.on_read(characteristic, result, &mut effects),
            Input::SubscribeFinished {
                characteristic,
                result,
            } => match result {
                Ok(()) => debug!("Subscribed to {}", characteristic),
                Err(e) => warn!("Failed to subscribe to {}: {}", characteristic, e),
            },
            Input::Notification {
                peripheral,
                characteristic,
                value,
            } => {
                if self.state == SessionState::Active && self.is_ours(&peripheral) {
                    effects.push(Effect::Route {
                        characteristic,
                        source: ReadSource::Notification,
                        value,
                    });
                } else {
                    debug!("Ignoring notification from {} in state {}", peripheral, self.state);
                }
            }
            Input::LinkLost(peripheral) => self.on_link_lost(&peripheral, &mut effects),
            Input::TransportClosed => {
                if !self.state.is_terminal() {
                    self.fail(MioError::transport(
                        "events",
                        self.identity.to_string(),
                        "transport event stream closed",
                    ));
                    effects.push(Effect::CancelPending);
                    self.finish(&mut effects);
                }
            }
            Input::StopRequested => self.on_stop(&mut effects),
            Input::DisconnectFinished(result) => {
                if self.state == SessionState::Disconnecting {
                    if let Err(e) = result {
                        warn!("Disconnect did not complete cleanly: {}", e);
                    }
                    self.finish(&mut effects);
                }
            }
        }
        effects
    }

    fn on_power(&mut self, power: PowerState, effects: &mut Vec<Effect>) {
        info!("State of BT: {}", power);
        match (self.state, power) {
            (SessionState::Idle, PowerState::PoweredOn) => {
                info!("Scanning for ID: {}", self.identity);
                self.enter(SessionState::Scanning, effects);
                effects.push(Effect::StartScan);
            }
            (SessionState::Scanning, PowerState::PoweredOff | PowerState::Unknown) => {
                effects.push(Effect::StopScan);
                self.enter(SessionState::Idle, effects);
            }
            _ => {}
        }
    }

    fn on_advertisement(&mut self, advertisement: &Advertisement, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Scanning {
            return;
        }
        let Some(peripheral) = advertisement
            .peripheral
            .as_ref()
            .filter(|p| p.matches(self.identity.as_str()))
        else {
            return;
        };

        effects.push(Effect::StopScan);
        self.peripheral = Some(peripheral.clone());
        self.enter(SessionState::Discovered, effects);

        match &advertisement.local_name {
            Some(name) if !name.is_empty() => info!("Device found: {}", name),
            _ => info!("Device found"),
        }
        info!("  Local Name        = {:?}", advertisement.local_name);
        info!("  TX Power Level    = {:?}", advertisement.tx_power_level);
        info!("  Manufacturer Data = {:02X?}", advertisement.manufacturer_data);
        info!("  Service Data      = {:02X?}", advertisement.service_data);

        self.attempts_used += 1;
        self.enter(SessionState::Connecting, effects);
        effects.push(Effect::Connect(peripheral.clone()));
    }

    fn on_connect(&mut self, result: Result<()>, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connecting {
            return;
        }
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        match result {
            Ok(()) => {
                info!("Connection ok");
                self.enter(SessionState::Connected, effects);
                effects.push(Effect::Resolve(peripheral));
            }
            Err(e) if self.attempts_used < self.connect_attempts => {
                warn!(
                    "Connect attempt {}/{} failed: {} - scanning again",
                    self.attempts_used, self.connect_attempts, e
                );
                self.peripheral = None;
                self.enter(SessionState::Scanning, effects);
                effects.push(Effect::StartScan);
            }
            Err(e) => {
                warn!("Connect failed after {} attempt(s): {}", self.attempts_used, e);
                self.fail(e);
                self.finish(effects);
            }
        }
    }

    fn on_resolved(&mut self, result: Result<Vec<ResolvedCharacteristic>>, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connected {
            return;
        }
        let resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!("Service resolution failed: {}", e);
                self.fail(e);
                self.begin_disconnect(effects);
                return;
            }
        };

        self.resolved = resolved;
        self.enter(SessionState::ServicesResolved, effects);

        let battery = self.resolved(CharacteristicKind::BatteryLevel);
        let mut work = Vec::new();
        match battery {
            Some(battery) if battery.handle.can_read() => {
                // Subscription waits for this read so the first value is not reported twice.
                self.initial_battery_read = true;
                work.push(Effect::Read(battery));
            }
            Some(battery) if battery.handle.can_notify() && self.mode == SessionMode::Streaming => {
                work.push(Effect::Subscribe(battery));
            }
            _ if self.mode == SessionMode::BatteryOnce => {
                let reason = match battery {
                    Some(battery) => format!(
                        "battery level characteristic does not support read (properties {:?})",
                        battery.handle.properties
                    ),
                    None => "battery level characteristic was not resolved".to_string(),
                };
                self.fail(MioError::NotReady { reason });
                self.begin_disconnect(effects);
                return;
            }
            _ => {}
        }

        if self.mode == SessionMode::Streaming {
            for characteristic in &self.resolved {
                if characteristic.kind() == CharacteristicKind::BatteryLevel {
                    continue;
                }
                if characteristic.handle.can_notify() {
                    work.push(Effect::Subscribe(*characteristic));
                } else if characteristic.handle.can_read() {
                    work.push(Effect::Read(*characteristic));
                }
            }
        }

        self.enter(SessionState::Active, effects);
        effects.extend(work);
    }

    fn on_read(&mut self, kind: CharacteristicKind, result: Result<Bytes>, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(characteristic) = self.resolved(kind) else {
            return;
        };

        match result {
            Ok(value) => effects.push(Effect::Route {
                characteristic: characteristic.handle.uuid,
                source: ReadSource::Read,
                value,
            }),
            Err(e) => {
                warn!("Error reading {}: {}", kind, e);
                if kind == CharacteristicKind::BatteryLevel && self.mode == SessionMode::BatteryOnce {
                    self.fail(e);
                }
            }
        }

        if kind == CharacteristicKind::BatteryLevel && self.initial_battery_read {
            self.initial_battery_read = false;
            match self.mode {
                SessionMode::BatteryOnce => self.begin_disconnect(effects),
                SessionMode::Streaming if characteristic.handle.can_notify() => {
                    effects.push(Effect::Subscribe(characteristic));
                }
                SessionMode::Streaming => {}
            }
        }
    }

    fn on_link_lost(&mut self, peripheral: &PeripheralId, effects: &mut Vec<Effect>) {
        if !self.is_ours(peripheral) {
            return;
        }
        match self.state {
            SessionState::Disconnecting => {
                info!("Disconnected");
                effects.push(Effect::CancelPending);
                self.finish(effects);
            }
            state if state.is_linked() => {
                warn!("Device disconnected unexpectedly in state {}", state);
                self.fail(MioError::Disconnected);
                effects.push(Effect::CancelPending);
                self.finish(effects);
            }
            _ => {}
        }
    }

    fn on_stop(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            SessionState::Idle | SessionState::Discovered => self.finish(effects),
            SessionState::Scanning => {
                effects.push(Effect::StopScan);
                self.finish(effects);
            }
            state if state.is_linked() => self.begin_disconnect(effects),
            _ => {}
        }
    }

    fn begin_disconnect(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelPending);
        match self.peripheral.clone() {
            Some(peripheral) => {
                self.enter(SessionState::Disconnecting, effects);
                effects.push(Effect::Disconnect(peripheral));
            }
            None => self.finish(effects),
        }
    }

    fn finish(&mut self, effects: &mut Vec<Effect>) {
        self.enter(SessionState::Disconnected, effects);
        effects.push(Effect::Finish);
    }

    fn fail(&mut self, error: MioError) {
        if self.outcome.is_none() {
            self.outcome = Some(error);
        }
    }

    fn enter(&mut self, to: SessionState, effects: &mut Vec<Effect>) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Session state: {} -> {}", from, to);
        self.state = to;
        effects.push(Effect::Transition { from, to });
    }

    fn is_ours(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(peripheral)
    }
}
