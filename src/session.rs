//! Async driver for [`SessionMachine`].
//!
//! One dispatch task owns the machine, the router and every outstanding transport
//! operation. Transport events, completed operations and caller commands all arrive
//! on a single queue, so transitions never race each other. Each radio operation runs
//! as its own task; cancelling aborts the task, and any caller waiting on it sees
//! [`MioError::Disconnected`].

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Profile, SessionConfig, TimeoutConfig},
    error::{DecodeError, MioError, Result},
    gatt::CharacteristicKind,
    machine::{Effect, Input, ResolvedCharacteristic, SessionMachine},
    protocol::{CommandCodec, CommandFrame, UserInfo, UserInfoSet},
    router::{BatteryLevelDecoder, BatteryObserver, NotificationRouter, TelemetryEvent, TelemetryObserver},
    transport::{Transport, TransportEvent},
    types::{PeripheralId, SessionState},
    validate::Validate,
};

/// Observer for lifecycle transitions, called with `(from, to)`
pub type StateObserver = Box<dyn Fn(SessionState, SessionState) + Send + Sync>;

enum Command {
    Stop,
    ReadBattery(oneshot::Sender<Result<u8>>),
    Send(CommandFrame, oneshot::Sender<Result<()>>),
    OnBattery(BatteryObserver),
    OnTelemetry(TelemetryObserver),
}

enum Event {
    Transport(TransportEvent),
    TransportClosed,
    Completed { id: u64, input: Option<Input> },
    Deferred(Input),
    Command(Command),
}

/// A configured, not yet started session
pub struct Session<T: Transport> {
    config: SessionConfig,
    transport: Arc<T>,
    router: NotificationRouter,
    state_observers: Vec<StateObserver>,
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("state_observers", &self.state_observers.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Prepare a session for the configured peripheral over `transport`
    ///
    /// The transport is owned by this session until it ends.
    pub fn new(config: SessionConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            router: NotificationRouter::new(),
            state_observers: Vec::new(),
        }
    }

    /// Replace the router, e.g. with [`NotificationRouter::with_standard_decoders`]
    #[must_use]
    pub fn with_router(mut self, router: NotificationRouter) -> Self {
        self.router = router;
        self
    }

    /// Router, for registering decoders before the session starts
    pub fn router_mut(&mut self) -> &mut NotificationRouter {
        &mut self.router
    }

    /// Observe battery readings, including malformed ones
    pub fn on_battery_level(
        &mut self,
        observer: impl Fn(std::result::Result<u8, DecodeError>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.router.on_battery_level(observer);
        self
    }

    /// Observe all other telemetry
    pub fn on_telemetry(
        &mut self,
        observer: impl Fn(&TelemetryEvent) + Send + Sync + 'static,
    ) -> &mut Self {
        self.router.on_telemetry(observer);
        self
    }

    /// Observe lifecycle transitions
    pub fn on_state_change(
        &mut self,
        observer: impl Fn(SessionState, SessionState) + Send + Sync + 'static,
    ) -> &mut Self {
        self.state_observers.push(Box::new(observer));
        self
    }

    /// Subscribe to transport events and spawn the dispatch task
    ///
    /// Returns as soon as the session is running; it then scans as soon as the radio
    /// reports power on.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses to deliver events.
    pub async fn start(self) -> Result<SessionHandle> {
        let identity = self.config.identity();
        info!("Starting session for {}", identity);

        let mut events = self.transport.events().await?;
        let (queue, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if pump_queue.send(Event::Transport(event)).is_err() {
                    return;
                }
            }
            let _ = pump_queue.send(Event::TransportClosed);
        });

        let driver = Driver {
            machine: SessionMachine::new(identity, self.config.mode, self.config.connect_attempts),
            transport: self.transport,
            profile: self.config.profile(),
            timeouts: self.config.timeouts,
            router: self.router,
            state_observers: self.state_observers,
            state: state_tx,
            queue: queue.clone(),
            operations: HashMap::new(),
            next_operation: 0,
        };
        let task = tokio::spawn(async move {
            let outcome = driver.run(rx).await;
            pump.abort();
            outcome
        });

        Ok(SessionHandle {
            queue,
            state: state_rx,
            task: Some(task),
        })
    }
}

/// Control surface of a running session
///
/// Dropping the handle stops the session.
#[derive(Debug)]
pub struct SessionHandle {
    queue: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(event) => f.debug_tuple("Transport").field(event).finish(),
            Self::TransportClosed => f.write_str("TransportClosed"),
            Self::Completed { id, input } => f
                .debug_struct("Completed")
                .field("id", id)
                .field("input", input)
                .finish(),
            Self::Deferred(input) => f.debug_tuple("Deferred").field(input).finish(),
            Self::Command(_) => f.write_str("Command"),
        }
    }
}

impl SessionHandle {
    /// Request graceful teardown. Safe to call in any state, and more than once.
    pub fn stop(&self) {
        let _ = self.queue.send(Event::Command(Command::Stop));
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every published state
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Read the battery level once
    ///
    /// The reading is also delivered to battery observers.
    ///
    /// # Errors
    ///
    /// Returns [`MioError::NotReady`] unless the session is active, the transport or
    /// [`MioError::Decode`] error if the read fails, and [`MioError::Disconnected`] if
    /// the session ends while the read is outstanding.
    pub async fn read_battery_level(&self) -> Result<u8> {
        let (reply, response) = oneshot::channel();
        self.request(Command::ReadBattery(reply))?;
        response.await.map_err(|_| MioError::Disconnected)?
    }

    /// Write a command frame to the sport message characteristic
    ///
    /// # Errors
    ///
    /// Returns [`MioError::NotReady`] unless the session is active and the sport
    /// service was resolved, otherwise as [`SessionHandle::read_battery_level`].
    pub async fn send_command(&self, frame: CommandFrame) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Send(frame, reply))?;
        response.await.map_err(|_| MioError::Disconnected)?
    }

    /// Validate, encode and send user settings
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Validation`] without writing anything if `validator`
    /// rejects the record, otherwise as [`SessionHandle::send_command`].
    pub async fn send_user_info<V>(&self, info: &UserInfo, validator: &V) -> Result<()>
    where
        V: Validate<UserInfo> + ?Sized,
    {
        let frame = UserInfoSet::encode(info, validator)?;
        self.send_command(frame).await
    }

    /// Add a battery observer to the running session
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Disconnected`] if the session has ended.
    pub fn on_battery_level(
        &self,
        observer: impl Fn(std::result::Result<u8, DecodeError>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.request(Command::OnBattery(Box::new(observer)))
    }

    /// Add a telemetry observer to the running session
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Disconnected`] if the session has ended.
    pub fn on_telemetry(
        &self,
        observer: impl Fn(&TelemetryEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        self.request(Command::OnTelemetry(Box::new(observer)))
    }

    /// Wait for the session to end
    ///
    /// # Errors
    ///
    /// Returns why the session ended if it did not end by request or by completing
    /// its one-shot work, e.g. [`MioError::MissingRequired`] or
    /// [`MioError::Disconnected`].
    pub async fn wait(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(MioError::transport("session", "dispatch task", e)),
        }
    }

    fn request(&self, command: Command) -> Result<()> {
        self.queue
            .send(Event::Command(command))
            .map_err(|_| MioError::Disconnected)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop();
        }
    }
}

struct Driver<T: Transport> {
    machine: SessionMachine,
    transport: Arc<T>,
    profile: Profile,
    timeouts: TimeoutConfig,
    router: NotificationRouter,
    state_observers: Vec<StateObserver>,
    state: watch::Sender<SessionState>,
    queue: mpsc::UnboundedSender<Event>,
    operations: HashMap<u64, JoinHandle<()>>,
    next_operation: u64,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        while let Some(event) = rx.recv().await {
            let input = match event {
                Event::Transport(event) => Some(Self::input_for(event)),
                Event::TransportClosed => Some(Input::TransportClosed),
                Event::Completed { id, input } => {
                    self.operations.remove(&id);
                    input
                }
                Event::Deferred(input) => Some(input),
                Event::Command(command) => self.command(command),
            };
            if let Some(input) = input {
                if self.apply(input).await {
                    break;
                }
            }
        }
        self.cancel_pending();

        match self.machine.take_outcome() {
            Some(e) => {
                error!("Session ended: {}", e);
                Err(e)
            }
            None => {
                info!("Session ended");
                Ok(())
            }
        }
    }

    fn input_for(event: TransportEvent) -> Input {
        match event {
            TransportEvent::PowerChanged(power) => Input::Power(power),
            TransportEvent::Advertisement(advertisement) => Input::Advertised(advertisement),
            TransportEvent::Disconnected(peripheral) => Input::LinkLost(peripheral),
            TransportEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => Input::Notification {
                peripheral,
                characteristic,
                value,
            },
        }
    }

    /// Returns true once the session has finished
    async fn apply(&mut self, input: Input) -> bool {
        let mut finished = false;
        for effect in self.machine.handle(input) {
            finished |= self.execute(effect).await;
        }
        finished
    }

    async fn execute(&mut self, effect: Effect) -> bool {
        match effect {
            Effect::Transition { from, to } => {
                self.state.send_replace(to);
                for observer in &self.state_observers {
                    observer(from, to);
                }
            }
            Effect::StartScan => {
                let transport = Arc::clone(&self.transport);
                let limit = self.timeouts.discovery();
                if let Err(e) = timed("scan", limit, transport.start_scan()).await {
                    let _ = self.queue.send(Event::Deferred(Input::ScanFailed(e)));
                }
            }
            Effect::StopScan => {
                let transport = Arc::clone(&self.transport);
                if let Err(e) = timed("stop scan", self.timeouts.discovery(), transport.stop_scan()).await {
                    warn!("Failed to stop scanning: {}", e);
                }
            }
            Effect::Connect(peripheral) => {
                info!("Connecting to {}", peripheral);
                let transport = Arc::clone(&self.transport);
                let limit = self.timeouts.connect();
                self.spawn_operation(async move {
                    Some(Input::ConnectFinished(
                        timed("connect", limit, transport.connect(&peripheral)).await,
                    ))
                });
            }
            Effect::Resolve(peripheral) => {
                info!("Discovering services on {}", peripheral);
                let transport = Arc::clone(&self.transport);
                let profile = self.profile.clone();
                let limit = self.timeouts.discovery();
                self.spawn_operation(async move {
                    let resolved = resolve_profile(transport.as_ref(), &peripheral, &profile);
                    Some(Input::Resolved(timed("discovery", limit, resolved).await))
                });
            }
            Effect::Read(characteristic) => self.spawn_read(characteristic),
            Effect::Subscribe(characteristic) => self.spawn_subscribe(characteristic),
            Effect::Route {
                characteristic,
                source,
                value,
            } => {
                self.router.route(characteristic, source, &value);
            }
            Effect::CancelPending => self.cancel_pending(),
            Effect::Disconnect(peripheral) => {
                info!("Disconnecting from {}", peripheral);
                let transport = Arc::clone(&self.transport);
                let limit = self.timeouts.disconnect();
                self.spawn_operation(async move {
                    Some(Input::DisconnectFinished(
                        timed("disconnect", limit, transport.disconnect(&peripheral)).await,
                    ))
                });
            }
            Effect::Finish => return true,
        }
        false
    }

    fn command(&mut self, command: Command) -> Option<Input> {
        match command {
            Command::Stop => {
                info!("Stop requested in state {}", self.machine.state());
                return Some(Input::StopRequested);
            }
            Command::ReadBattery(reply) => {
                match self.ready(CharacteristicKind::BatteryLevel, |c| c.handle.can_read()) {
                    Ok((peripheral, characteristic)) => {
                        let transport = Arc::clone(&self.transport);
                        let limit = self.timeouts.read();
                        self.spawn_operation(async move {
                            let result =
                                timed("read", limit, transport.read(&peripheral, &characteristic.handle)).await;
                            match result {
                                Ok(value) => {
                                    let level = BatteryLevelDecoder::level(&value).map_err(MioError::from);
                                    let _ = reply.send(level);
                                    Some(Input::ReadFinished {
                                        characteristic: CharacteristicKind::BatteryLevel,
                                        result: Ok(value),
                                    })
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                    None
                                }
                            }
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Send(frame, reply) => {
                match self.ready(CharacteristicKind::SportMsg, |c| c.handle.can_write()) {
                    Ok((peripheral, characteristic)) => {
                        debug!("Sending {} ({} bytes)", frame.command, frame.len());
                        let transport = Arc::clone(&self.transport);
                        let limit = self.timeouts.write();
                        let data: Bytes = frame.to_bytes();
                        self.spawn_operation(async move {
                            let result = timed(
                                "write",
                                limit,
                                transport.write(&peripheral, &characteristic.handle, &data),
                            )
                            .await;
                            let _ = reply.send(result);
                            None
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::OnBattery(observer) => self.router.add_battery_observer(observer),
            Command::OnTelemetry(observer) => self.router.add_telemetry_observer(observer),
        }
        None
    }

    /// The linked peripheral and a resolved characteristic, if the session can use it now
    fn ready(
        &self,
        kind: CharacteristicKind,
        capable: impl Fn(&ResolvedCharacteristic) -> bool,
    ) -> Result<(PeripheralId, ResolvedCharacteristic)> {
        let state = self.machine.state();
        if state != SessionState::Active {
            return Err(MioError::NotReady {
                reason: format!("session is {state}"),
            });
        }
        let characteristic = self
            .machine
            .resolved(kind)
            .filter(|c| capable(c))
            .ok_or_else(|| MioError::NotReady {
                reason: format!("{kind} is not available on this device"),
            })?;
        let peripheral = self
            .machine
            .peripheral()
            .cloned()
            .ok_or_else(|| MioError::NotReady {
                reason: "no peripheral".to_string(),
            })?;
        Ok((peripheral, characteristic))
    }

    fn spawn_read(&mut self, characteristic: ResolvedCharacteristic) {
        let Some(peripheral) = self.machine.peripheral().cloned() else {
            return;
        };
        debug!("Reading {}", characteristic.kind());
        let transport = Arc::clone(&self.transport);
        let limit = self.timeouts.read();
        self.spawn_operation(async move {
            Some(Input::ReadFinished {
                characteristic: characteristic.kind(),
                result: timed("read", limit, transport.read(&peripheral, &characteristic.handle)).await,
            })
        });
    }

    fn spawn_subscribe(&mut self, characteristic: ResolvedCharacteristic) {
        let Some(peripheral) = self.machine.peripheral().cloned() else {
            return;
        };
        debug!("Subscribing to {}", characteristic.kind());
        let transport = Arc::clone(&self.transport);
        let limit = self.timeouts.subscribe();
        self.spawn_operation(async move {
            Some(Input::SubscribeFinished {
                characteristic: characteristic.kind(),
                result: timed(
                    "subscribe",
                    limit,
                    transport.subscribe(&peripheral, &characteristic.handle),
                )
                .await,
            })
        });
    }

    fn spawn_operation(&mut self, operation: impl Future<Output = Option<Input>> + Send + 'static) {
        let id = self.next_operation;
        self.next_operation += 1;
        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            let input = operation.await;
            let _ = queue.send(Event::Completed { id, input });
        });
        self.operations.insert(id, task);
    }

    fn cancel_pending(&mut self) {
        if !self.operations.is_empty() {
            debug!("Cancelling {} outstanding operation(s)", self.operations.len());
        }
        for (_, task) in self.operations.drain() {
            task.abort();
        }
    }
}

async fn timed<R>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<R>>,
) -> Result<R> {
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or_else(|_| {
            Err(MioError::Timeout {
                operation,
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        })
}

/// Find every profile characteristic on the peripheral, battery service first
async fn resolve_profile<T: Transport + ?Sized>(
    transport: &T,
    peripheral: &PeripheralId,
    profile: &Profile,
) -> Result<Vec<ResolvedCharacteristic>> {
    let groups = profile.services();
    let wanted: Vec<_> = groups.iter().map(|(service, _, _)| service.descriptor().uuid()).collect();
    let offered = transport.discover_services(peripheral, &wanted).await?;

    let mut resolved = Vec::new();
    for (service, required, entries) in groups {
        let descriptor = service.descriptor();
        let Some(handle) = offered.iter().find(|s| s.uuid == descriptor.uuid()) else {
            if required {
                return Err(MioError::MissingRequired {
                    what: format!("{} service ({})", descriptor.name, descriptor.id),
                });
            }
            info!("Optional {} service not offered", descriptor.name);
            continue;
        };
        info!("Service found: {} ({})", descriptor.name, descriptor.id);

        let uuids: Vec<_> = entries.iter().map(|e| e.characteristic.descriptor().uuid()).collect();
        let characteristics = match transport.discover_characteristics(peripheral, handle, &uuids).await {
            Ok(characteristics) => characteristics,
            Err(e) if !required => {
                warn!("Skipping optional {} service: {}", descriptor.name, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        for entry in entries {
            let expected = entry.characteristic.descriptor();
            match characteristics.iter().find(|c| c.uuid == expected.uuid()) {
                Some(found) => {
                    info!("Characteristic found: {} ({})", expected.name, expected.id);
                    resolved.push(ResolvedCharacteristic {
                        descriptor: expected,
                        handle: *found,
                    });
                }
                None if entry.required => {
                    return Err(MioError::MissingRequired {
                        what: format!("{} characteristic ({})", expected.name, expected.id),
                    });
                }
                None => debug!("Optional characteristic {} not offered", expected.name),
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ProfileKind, SessionMode},
        gatt::ServiceKind,
        mock::{MockCall, MockPeripheral, MockTransport},
        router::{NotificationRouter, Telemetry},
        types::{Advertisement, PowerState},
        validate::UserInfoRules,
    };
    use std::sync::Mutex;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn config(mode: SessionMode) -> SessionConfig {
        let mut config = SessionConfig::new("aa:bb");
        config.mode = mode;
        config
    }

    async fn reach(handle: &SessionHandle, state: SessionState) {
        let mut changes = handle.state_changes();
        tokio::time::timeout(PATIENCE, changes.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("session dropped its state channel");
    }

    async fn finish(handle: SessionHandle) -> Result<()> {
        tokio::time::timeout(PATIENCE, handle.wait())
            .await
            .expect("session did not end in time")
    }

    fn battery_readings(session: &mut Session<MockTransport>) -> mpsc::UnboundedReceiver<std::result::Result<u8, DecodeError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.on_battery_level(move |reading| {
            let _ = tx.send(reading);
        });
        rx
    }

    async fn next_reading(
        rx: &mut mpsc::UnboundedReceiver<std::result::Result<u8, DecodeError>>,
    ) -> std::result::Result<u8, DecodeError> {
        tokio::time::timeout(PATIENCE, rx.recv())
            .await
            .expect("no battery reading in time")
            .expect("observer dropped")
    }

    #[tokio::test]
    async fn test_battery_once_reports_and_disconnects() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::new("11:22"))
                .with_peripheral(MockPeripheral::mio("AA:BB")),
        );
        let mut session = Session::new(config(SessionMode::BatteryOnce), Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        session.on_state_change(move |_, to| seen.lock().unwrap().push(to));

        let handle = session.start().await.unwrap();
        assert_eq!(next_reading(&mut readings).await, Ok(87));
        finish(handle).await.unwrap();

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                SessionState::Scanning,
                SessionState::Discovered,
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::ServicesResolved,
                SessionState::Active,
                SessionState::Disconnecting,
                SessionState::Disconnected,
            ]
        );

        let calls = mock.calls().await;
        let connects: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Connect(p) => Some(p.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(connects, vec!["AA:BB".to_string()]);
        assert!(calls.contains(&MockCall::StopScan));
        assert!(!calls.iter().any(|c| matches!(c, MockCall::Subscribe(_))));
    }

    #[tokio::test]
    async fn test_initial_reading_then_stream() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let mut session = Session::new(config(SessionMode::Streaming), Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let handle = session.start().await.unwrap();

        assert_eq!(next_reading(&mut readings).await, Ok(87));
        mock.notify("AA:BB", CharacteristicKind::BatteryLevel, vec![64]).await;
        assert_eq!(next_reading(&mut readings).await, Ok(64));

        handle.stop();
        finish(handle).await.unwrap();
        assert!(readings.try_recv().is_err());

        let battery = CharacteristicKind::BatteryLevel.descriptor().uuid();
        assert_eq!(mock.count(|c| *c == MockCall::Read(battery)).await, 1);
        let calls = mock.calls().await;
        let read = calls.iter().position(|c| *c == MockCall::Read(battery));
        let subscribe = calls.iter().position(|c| *c == MockCall::Subscribe(battery));
        assert!(read < subscribe);
    }

    #[tokio::test]
    async fn test_malformed_battery_notification_keeps_session_active() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let mut session = Session::new(config(SessionMode::Streaming), Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let handle = session.start().await.unwrap();
        assert_eq!(next_reading(&mut readings).await, Ok(87));

        mock.notify("AA:BB", CharacteristicKind::BatteryLevel, vec![1, 2]).await;
        assert!(matches!(
            next_reading(&mut readings).await,
            Err(DecodeError::WrongLength { actual: 2, .. })
        ));
        assert_eq!(handle.state(), SessionState::Active);

        mock.notify("AA:BB", CharacteristicKind::BatteryLevel, vec![50]).await;
        assert_eq!(next_reading(&mut readings).await, Ok(50));
        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_read() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_hanging_read(CharacteristicKind::BatteryLevel),
        );
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        reach(&handle, SessionState::Active).await;

        let link = Arc::clone(&mock);
        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            link.drop_link("AA:BB").await;
        });

        let read = tokio::time::timeout(PATIENCE, handle.read_battery_level())
            .await
            .expect("read hung after the link dropped");
        assert!(matches!(read, Err(MioError::Disconnected)));
        dropper.await.unwrap();

        reach(&handle, SessionState::Disconnected).await;
        assert!(matches!(finish(handle).await, Err(MioError::Disconnected)));
    }

    #[tokio::test]
    async fn test_missing_required_service_ends_session() {
        let mock = Arc::new(MockTransport::new().with_peripheral(
            MockPeripheral::mio("AA:BB").without(CharacteristicKind::BatteryLevel),
        ));
        let mut session = Session::new(config(SessionMode::Streaming), Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let outcome = finish(session.start().await.unwrap()).await;
        assert!(
            matches!(outcome, Err(MioError::MissingRequired { ref what }) if what.contains("0x180F"))
        );
        assert!(readings.try_recv().is_err());
        assert!(mock
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, MockCall::Disconnect(_))));
    }

    #[tokio::test]
    async fn test_connect_retries_are_bounded() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_connect_failures(1),
        );
        let outcome = finish(
            Session::new(config(SessionMode::BatteryOnce), Arc::clone(&mock))
                .start()
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(outcome, Err(MioError::Transport { operation: "connect", .. })));
        assert_eq!(mock.count(|c| matches!(c, MockCall::Connect(_))).await, 1);

        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_connect_failures(1),
        );
        let mut config = config(SessionMode::BatteryOnce);
        config.connect_attempts = 2;
        let handle = Session::new(config, Arc::clone(&mock)).start().await.unwrap();
        finish(handle).await.unwrap();
        assert_eq!(mock.count(|c| matches!(c, MockCall::Connect(_))).await, 2);
        assert_eq!(mock.count(|c| *c == MockCall::StartScan).await, 2);
    }

    #[tokio::test]
    async fn test_stop_before_power_on() {
        let mock = Arc::new(
            MockTransport::new()
                .with_power(PowerState::PoweredOff)
                .with_peripheral(MockPeripheral::mio("AA:BB")),
        );
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
        handle.stop();
        handle.stop();
        finish(handle).await.unwrap();
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_power_on_starts_scan() {
        let mock = Arc::new(
            MockTransport::new()
                .with_power(PowerState::PoweredOff)
                .with_peripheral(MockPeripheral::mio("AA:BB")),
        );
        let handle = Session::new(config(SessionMode::BatteryOnce), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        mock.set_power(PowerState::PoweredOn).await;
        finish(handle).await.unwrap();
        assert_eq!(mock.calls().await.first(), Some(&MockCall::StartScan));
    }

    #[tokio::test]
    async fn test_stop_while_active() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        reach(&handle, SessionState::Active).await;
        assert_eq!(handle.read_battery_level().await.unwrap(), 87);

        let mut changes = handle.state_changes();
        handle.stop();
        finish(handle).await.unwrap();
        assert_eq!(*changes.borrow_and_update(), SessionState::Disconnected);
        assert_eq!(
            mock.count(|c| matches!(c, MockCall::Disconnect(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn test_commands_need_an_active_session() {
        let mock = Arc::new(
            MockTransport::new()
                .with_power(PowerState::PoweredOff)
                .with_peripheral(MockPeripheral::mio("AA:BB")),
        );
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        assert!(matches!(
            handle.read_battery_level().await,
            Err(MioError::NotReady { .. })
        ));
        handle.stop();
        reach(&handle, SessionState::Disconnected).await;
        assert!(matches!(
            handle.read_battery_level().await,
            Err(MioError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_user_settings_are_written_to_the_sport_service() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let mut config = config(SessionMode::Streaming);
        config.profile = ProfileKind::Full;
        let handle = Session::new(config, Arc::clone(&mock)).start().await.unwrap();
        reach(&handle, SessionState::Active).await;

        let invalid = UserInfo {
            body_weight: 10,
            ..UserInfo::default()
        };
        match handle.send_user_info(&invalid, &UserInfoRules).await {
            Err(MioError::Validation(e)) => {
                assert!(e.has_field("body_weight"));
                assert!(!e.has_field("max_hr"));
            }
            other => panic!("expected a validation error, got {other:?}"),
        }

        handle
            .send_user_info(&UserInfo::default(), &UserInfoRules)
            .await
            .unwrap();

        let sport = CharacteristicKind::SportMsg.descriptor().uuid();
        let writes: Vec<_> = mock
            .calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Write(uuid, data) if uuid == sport => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 10);
        assert_eq!(writes[0][0], 8);

        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_command_without_sport_service() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        reach(&handle, SessionState::Active).await;
        let frame = CommandFrame::new(crate::protocol::CommandType::UserInfoSet, 0, Bytes::new());
        assert!(matches!(
            handle.send_command(frame).await,
            Err(MioError::NotReady { .. })
        ));
        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_heart_rate_routed_raw_by_default() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let mut config = config(SessionMode::Streaming);
        config.profile = ProfileKind::Full;
        let mut session = Session::new(config, Arc::clone(&mock));
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on_telemetry(move |event| {
            let _ = tx.send(event.clone());
        });
        let handle = session.start().await.unwrap();
        reach(&handle, SessionState::Active).await;

        mock.notify("AA:BB", CharacteristicKind::HeartRateMeasurement, vec![0x00, 72])
            .await;
        let event = loop {
            let event = tokio::time::timeout(PATIENCE, rx.recv())
                .await
                .expect("no telemetry in time")
                .expect("observer dropped");
            if event.kind == Some(CharacteristicKind::HeartRateMeasurement) {
                break event;
            }
        };
        assert_eq!(
            event.telemetry,
            Ok(Telemetry::Raw(Bytes::from_static(&[0x00, 72])))
        );
        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_registered_decoder_applies_to_heart_rate() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let mut config = config(SessionMode::Streaming);
        config.profile = ProfileKind::Full;
        let mut session = Session::new(config, Arc::clone(&mock));
        session.router_mut().register_decoder(
            CharacteristicKind::HeartRateMeasurement.descriptor().uuid(),
            crate::router::HeartRateDecoder,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on_telemetry(move |event| {
            let _ = tx.send(event.clone());
        });
        let handle = session.start().await.unwrap();
        reach(&handle, SessionState::Active).await;

        mock.notify("AA:BB", CharacteristicKind::HeartRateMeasurement, vec![0x00, 72])
            .await;
        let event = loop {
            let event = tokio::time::timeout(PATIENCE, rx.recv())
                .await
                .expect("no telemetry in time")
                .expect("observer dropped");
            if event.kind == Some(CharacteristicKind::HeartRateMeasurement) {
                break event;
            }
        };
        assert!(matches!(event.telemetry, Ok(Telemetry::HeartRate(ref hr)) if hr.bpm == 72));
        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_optional_service_discovery_failure_is_skipped() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_failing_discovery(ServiceKind::HeartRate),
        );
        let mut config = config(SessionMode::Streaming);
        config.profile = ProfileKind::Full;
        let mut session = Session::new(config, Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let handle = session.start().await.unwrap();

        assert_eq!(next_reading(&mut readings).await, Ok(87));
        reach(&handle, SessionState::Active).await;
        let heart_rate = ServiceKind::HeartRate.descriptor().uuid();
        assert_eq!(
            mock.count(|c| *c == MockCall::DiscoverCharacteristics(heart_rate)).await,
            1
        );
        let hr = CharacteristicKind::HeartRateMeasurement.descriptor().uuid();
        assert_eq!(mock.count(|c| *c == MockCall::Subscribe(hr)).await, 0);

        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_required_service_discovery_failure_ends_session() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_failing_discovery(ServiceKind::Battery),
        );
        let handle = Session::new(config(SessionMode::BatteryOnce), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        assert!(matches!(
            finish(handle).await,
            Err(MioError::Transport { operation: "discover characteristics", .. })
        ));
    }

    #[tokio::test]
    async fn test_optional_service_not_offered() {
        let mock = Arc::new(
            MockTransport::new().with_peripheral(
                MockPeripheral::mio("AA:BB")
                    .without(CharacteristicKind::HeartRateMeasurement)
                    .without(CharacteristicKind::BodySensorLocation),
            ),
        );
        let mut config = config(SessionMode::Streaming);
        config.profile = ProfileKind::Full;
        let mut session = Session::new(config, Arc::clone(&mock));
        let mut readings = battery_readings(&mut session);
        let handle = session.start().await.unwrap();

        assert_eq!(next_reading(&mut readings).await, Ok(87));
        reach(&handle, SessionState::Active).await;
        let heart_rate = ServiceKind::HeartRate.descriptor().uuid();
        assert_eq!(
            mock.count(|c| *c == MockCall::DiscoverCharacteristics(heart_rate)).await,
            0
        );

        handle.stop();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_connects_to_first_matching_advertisement_only() {
        let mock = Arc::new(
            MockTransport::new()
                .with_peripheral(MockPeripheral::mio("AA:BB"))
                .with_peripheral(MockPeripheral::new("11:22"))
                .with_manual_advertising(),
        );
        let handle = Session::new(config(SessionMode::BatteryOnce), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        reach(&handle, SessionState::Scanning).await;

        mock.advertise(Advertisement::from_id("AA:BB")).await;
        mock.advertise(Advertisement::from_id("11:22")).await;
        mock.advertise(Advertisement::from_id("aa:bb")).await;
        finish(handle).await.unwrap();

        let connects = mock.count(|c| matches!(c, MockCall::Connect(_))).await;
        assert_eq!(connects, 1);
        assert_eq!(
            mock.count(|c| *c == MockCall::Connect(PeripheralId::new("AA:BB"))).await,
            1
        );
    }

    #[tokio::test]
    async fn test_closed_event_stream_ends_session() {
        let mock = Arc::new(MockTransport::new().with_peripheral(MockPeripheral::mio("AA:BB")));
        let handle = Session::new(config(SessionMode::Streaming), Arc::clone(&mock))
            .start()
            .await
            .unwrap();
        reach(&handle, SessionState::Active).await;

        mock.close().await;
        assert!(matches!(
            finish(handle).await,
            Err(MioError::Transport { operation: "events", .. })
        ));
    }
}
