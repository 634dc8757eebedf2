//! Bluetooth Service Module
//!
//! The session orchestrator: drives adapter wait, scan, connect, discovery
//! and subscription in sequence for one peripheral and one characteristic.
//!
//! The orchestrator runs as a single task. Host commands and stage
//! completions arrive on channels and are handled one at a time; every radio
//! operation runs in its own task and reports back tagged with the epoch it
//! was started in. Tearing a session attempt down bumps the epoch, so late
//! completions from an abandoned attempt are ignored.

use crate::domain::error::{BleError, Result};
use crate::domain::models::{
    AdapterState, CharacteristicDescriptor, CharacteristicValue, LinkEvent, Operation,
    PeripheralHandle, ServiceDescriptor, SessionCommand, SessionEvent, SessionState,
};
use crate::infrastructure::bluetooth::{
    adapter::AdapterMonitor, backend::BleBackend, characteristic::CharacteristicSession,
    connection::ConnectionManager, discovery::DiscoveryEngine, protocol, scanner::Scanner,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service to scan for and discover
    pub service_uuid: Uuid,
    /// Characteristic to read, write and subscribe to
    pub characteristic_uuid: Uuid,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Link events buffered across disconnect/reconnect cycles
    pub retry_capacity: usize,
    /// Unconsumed notifications kept before the oldest is dropped
    pub notification_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            characteristic_uuid: protocol::CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            retry_capacity: 4,
            notification_buffer: 16,
        }
    }
}

/// Host-side handle to a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the orchestrator on the current tokio runtime.
    ///
    /// Every report for the host arrives, in order, on the returned receiver.
    pub fn spawn(
        backend: Arc<dyn BleBackend>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let orchestrator = SessionOrchestrator {
            monitor: AdapterMonitor::new(backend.clone()),
            scanner: Scanner::new(backend.clone()),
            backend,
            config,
            state: SessionState::Idle,
            state_tx,
            epoch: 0,
            events: event_tx,
            steps: step_tx,
            attempt: None,
            pending_read: None,
            tasks: Vec::new(),
            notify_task: None,
        };
        let task = tokio::spawn(orchestrator.run(command_rx, step_rx));

        (
            Self {
                commands: command_tx,
                state: state_rx,
                task,
            },
            event_rx,
        )
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            warn!("Session is no longer running");
        }
    }

    pub fn start(&self) {
        self.send(SessionCommand::Start);
    }

    pub fn read(&self) {
        self.send(SessionCommand::Read);
    }

    pub fn write(&self, value: impl Into<Vec<u8>>) {
        self.send(SessionCommand::Write(value.into()));
    }

    pub fn refresh(&self) {
        self.send(SessionCommand::Refresh);
    }

    pub fn cancel(&self) {
        self.send(SessionCommand::Cancel);
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Stop the orchestrator, releasing every radio resource it holds.
    pub async fn shutdown(self) {
        self.send(SessionCommand::Shutdown);
        if let Err(e) = self.task.await {
            error!("Session task ended abnormally: {}", e);
        }
    }
}

/// Stage completions and stream elements fed back to the orchestrator.
#[derive(Debug)]
enum StepEvent {
    Adapter(AdapterState),
    PeripheralFound(PeripheralHandle),
    Connected(Result<()>),
    ServiceDiscovered(Result<ServiceDescriptor>),
    CharacteristicDiscovered(Result<CharacteristicDescriptor>),
    Subscribed(Result<()>),
    InitialRead(Result<CharacteristicValue>),
    Notification(CharacteristicValue),
    LinkLost,
    Reconnected(Result<()>),
}

#[derive(Clone)]
struct Reporter {
    epoch: u64,
    steps: mpsc::UnboundedSender<(u64, StepEvent)>,
}

impl Reporter {
    /// False once the orchestrator has stopped.
    fn report(&self, event: StepEvent) -> bool {
        self.steps.send((self.epoch, event)).is_ok()
    }
}

/// Resources owned by one connection attempt to the selected peripheral.
struct Attempt {
    peripheral: PeripheralHandle,
    connection: Arc<ConnectionManager>,
    discovery: Arc<DiscoveryEngine>,
    characteristic: Option<Arc<CharacteristicSession>>,
}

impl Attempt {
    fn release(self) {
        if let Some(characteristic) = self.characteristic {
            characteristic.close();
        }
        self.discovery.reset();
        self.connection.release();
    }
}

struct SessionOrchestrator {
    backend: Arc<dyn BleBackend>,
    config: SessionConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    steps: mpsc::UnboundedSender<(u64, StepEvent)>,
    monitor: AdapterMonitor,
    scanner: Scanner,
    attempt: Option<Attempt>,
    /// Initial read that completed before the subscription did.
    pending_read: Option<Result<CharacteristicValue>>,
    /// Adapter and scan pumps for the current epoch.
    tasks: Vec<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl SessionOrchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut steps: mpsc::UnboundedReceiver<(u64, StepEvent)>,
    ) {
        info!("Session orchestrator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some((epoch, event)) = steps.recv() => {
                    if epoch == self.epoch {
                        self.handle_step(event);
                    } else {
                        trace!("Ignoring {:?} from epoch {}", event, epoch);
                    }
                }
            }
        }
        self.teardown();
        info!("Session orchestrator stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        debug!("Session command: {:?}", command);
        match command {
            SessionCommand::Start => self.start(),
            SessionCommand::Read | SessionCommand::Refresh => self.read(),
            SessionCommand::Write(value) => self.write(value),
            SessionCommand::Cancel => self.cancel(),
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_step(&mut self, event: StepEvent) {
        match event {
            StepEvent::Adapter(adapter) => self.on_adapter(adapter),
            StepEvent::PeripheralFound(peripheral) => self.on_peripheral_found(peripheral),
            StepEvent::Connected(result) => self.on_connected(result),
            StepEvent::ServiceDiscovered(result) => self.on_service_discovered(result),
            StepEvent::CharacteristicDiscovered(result) => {
                self.on_characteristic_discovered(result)
            }
            StepEvent::Subscribed(result) => self.on_subscribed(result),
            StepEvent::InitialRead(result) => self.on_initial_read(result),
            StepEvent::Notification(value) => self.on_notification(value),
            StepEvent::LinkLost => self.on_link_lost(),
            StepEvent::Reconnected(result) => self.on_reconnected(result),
        }
    }

    // ----- host commands -------------------------------------------------

    fn start(&mut self) {
        if self.state.is_active() {
            debug!("Session already running ({:?})", self.state);
            return;
        }
        self.teardown();
        self.wait_for_adapter();
    }

    fn cancel(&mut self) {
        info!("Session cancelled");
        self.teardown();
        self.transition(SessionState::Idle);
    }

    fn read(&self) {
        let Some(characteristic) = self.characteristic() else {
            self.report_failure(Operation::Read, BleError::disconnected());
            return;
        };
        let events = self.events.clone();
        let timeout = self.config.read_timeout;

        tokio::spawn(async move {
            let event = match characteristic.read(timeout).await {
                Ok(value) => SessionEvent::ValueRead(value),
                Err(error) => {
                    warn!("Read failed: {}", error);
                    SessionEvent::OperationFailed {
                        operation: Operation::Read,
                        error,
                    }
                }
            };
            let _ = events.send(event);
        });
    }

    fn write(&self, value: Vec<u8>) {
        let Some(characteristic) = self.characteristic() else {
            self.report_failure(Operation::Write, BleError::disconnected());
            return;
        };
        let events = self.events.clone();
        let timeout = self.config.write_timeout;

        tokio::spawn(async move {
            let event = match characteristic.write(&value, timeout).await {
                Ok(()) => SessionEvent::WriteCompleted,
                Err(error) => {
                    warn!("Write failed: {}", error);
                    SessionEvent::OperationFailed {
                        operation: Operation::Write,
                        error,
                    }
                }
            };
            let _ = events.send(event);
        });
    }

    // ----- stage transitions ---------------------------------------------

    fn wait_for_adapter(&mut self) {
        self.transition(SessionState::WaitingForAdapter);

        let mut stream = self.monitor.subscribe();
        let reporter = self.reporter();
        self.tasks.push(tokio::spawn(async move {
            while let Some(adapter) = stream.next().await {
                if !reporter.report(StepEvent::Adapter(adapter)) {
                    break;
                }
            }
        }));
    }

    fn on_adapter(&mut self, adapter: AdapterState) {
        debug!("Adapter state {:?} in {:?}", adapter, self.state);
        let waiting = self.state == SessionState::WaitingForAdapter;
        match (waiting, adapter) {
            (true, AdapterState::PoweredOn) => self.start_scan(),
            (true, AdapterState::Resetting) => {
                info!("Bluetooth adapter resetting, waiting for power on");
                self.reset_radio();
            }
            (_, AdapterState::PoweredOn) | (_, AdapterState::Unknown) => {}
            (true, _) => self.fail(adapter_error(adapter)),
            (false, AdapterState::Resetting) => {
                warn!("Bluetooth adapter resetting during {:?}", self.state);
                self.teardown();
                self.wait_for_adapter();
            }
            (_, _) => self.fail(adapter_error(adapter)),
        }
    }

    fn start_scan(&mut self) {
        let mut stream = match self.scanner.start_scan(self.config.service_uuid) {
            Ok(stream) => stream,
            Err(e) => return self.fail(e),
        };
        self.transition(SessionState::Scanning);

        let reporter = self.reporter();
        self.tasks.push(tokio::spawn(async move {
            while let Some(peripheral) = stream.next().await {
                if !reporter.report(StepEvent::PeripheralFound(peripheral)) {
                    break;
                }
            }
        }));
    }

    fn on_peripheral_found(&mut self, peripheral: PeripheralHandle) {
        if self.state != SessionState::Scanning {
            debug!("Ignoring peripheral {} outside of scanning", peripheral.id);
            return;
        }

        self.scanner.stop_scan();
        info!("Selected peripheral {} ({})", peripheral.name, peripheral.id);

        let connection = Arc::new(ConnectionManager::new(self.backend.clone()));
        self.attempt = Some(Attempt {
            peripheral: peripheral.clone(),
            connection: connection.clone(),
            discovery: Arc::new(DiscoveryEngine::new(self.backend.clone())),
            characteristic: None,
        });
        let _ = self
            .events
            .send(SessionEvent::PeripheralSelected(peripheral.clone()));
        self.transition(SessionState::Connecting);

        let timeout = self.config.connect_timeout;
        let retry_capacity = self.config.retry_capacity;
        let reporter = self.reporter();

        // Not tracked in `tasks`: a cancelled attempt lets the connect finish
        // or time out. The link event loop ends when the manager is released.
        tokio::spawn(async move {
            let mut link_events = match connection
                .connect(&peripheral, timeout, retry_capacity)
                .await
            {
                Ok(link_events) => link_events,
                Err(e) => {
                    reporter.report(StepEvent::Connected(Err(e)));
                    return;
                }
            };
            if !reporter.report(StepEvent::Connected(Ok(()))) {
                return;
            }

            loop {
                match link_events.recv().await {
                    Ok(LinkEvent::Disconnected) => {
                        if !reporter.report(StepEvent::LinkLost) {
                            break;
                        }
                    }
                    Ok(LinkEvent::Connected) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Link event stream lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn on_connected(&mut self, result: Result<()>) {
        if self.state != SessionState::Connecting {
            return;
        }
        match result {
            Ok(()) => {
                self.transition(SessionState::DiscoveringServices);
                self.discover_services();
            }
            Err(e) => self.fail(e),
        }
    }

    fn discover_services(&mut self) {
        let Some(attempt) = &self.attempt else {
            return self.fail(BleError::NoPeripheral);
        };
        let discovery = attempt.discovery.clone();
        let id = attempt.peripheral.id;
        let service = self.config.service_uuid;

        self.spawn_step(async move {
            StepEvent::ServiceDiscovered(discovery.discover_services(&id, service).await)
        });
    }

    fn on_service_discovered(&mut self, result: Result<ServiceDescriptor>) {
        if self.state != SessionState::DiscoveringServices {
            return;
        }
        let service = match result {
            Ok(service) => service,
            Err(e) => return self.fail(e),
        };
        let Some(attempt) = &self.attempt else {
            return self.fail(BleError::NoPeripheral);
        };

        info!("Found service {}", service.uuid);
        let discovery = attempt.discovery.clone();
        let id = attempt.peripheral.id;
        let characteristic = self.config.characteristic_uuid;
        self.transition(SessionState::DiscoveringCharacteristics);

        self.spawn_step(async move {
            StepEvent::CharacteristicDiscovered(
                discovery
                    .discover_characteristics(&id, &service, characteristic)
                    .await,
            )
        });
    }

    fn on_characteristic_discovered(&mut self, result: Result<CharacteristicDescriptor>) {
        if self.state != SessionState::DiscoveringCharacteristics {
            return;
        }
        let descriptor = match result {
            Ok(descriptor) => descriptor,
            Err(e) => return self.fail(e),
        };
        let Some(attempt) = &mut self.attempt else {
            return self.fail(BleError::NoPeripheral);
        };

        info!("Found characteristic {}", descriptor.uuid);
        let characteristic = Arc::new(CharacteristicSession::new(
            self.backend.clone(),
            attempt.peripheral.id,
            descriptor,
            attempt.connection.link_state(),
        ));
        attempt.characteristic = Some(characteristic.clone());
        self.pending_read = None;
        self.transition(SessionState::Subscribing);

        let reporter = self.reporter();
        let buffer = self.config.notification_buffer;
        let subscriber = characteristic.clone();
        self.notify_task = Some(tokio::spawn(async move {
            let mut stream = match subscriber.subscribe(buffer).await {
                Ok(stream) => stream,
                Err(e) => {
                    reporter.report(StepEvent::Subscribed(Err(e)));
                    return;
                }
            };
            if !reporter.report(StepEvent::Subscribed(Ok(()))) {
                return;
            }
            while let Some(value) = stream.next().await {
                if !reporter.report(StepEvent::Notification(value)) {
                    break;
                }
            }
        }));

        let timeout = self.config.read_timeout;
        self.spawn_step(async move { StepEvent::InitialRead(characteristic.read(timeout).await) });
    }

    fn on_subscribed(&mut self, result: Result<()>) {
        if self.state != SessionState::Subscribing {
            return;
        }
        match result {
            Ok(()) => {
                self.transition(SessionState::Ready);
                if let Some(read) = self.pending_read.take() {
                    self.deliver_read(read);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_initial_read(&mut self, result: Result<CharacteristicValue>) {
        match self.state {
            SessionState::Subscribing => self.pending_read = Some(result),
            SessionState::Ready => self.deliver_read(result),
            _ => debug!("Dropping initial read outside of subscription"),
        }
    }

    fn on_notification(&mut self, value: CharacteristicValue) {
        if self.state == SessionState::Ready {
            let _ = self.events.send(SessionEvent::Notification(value));
        } else {
            debug!("Dropping notification in {:?}", self.state);
        }
    }

    fn on_link_lost(&mut self) {
        match self.state {
            SessionState::Ready => {}
            SessionState::DiscoveringServices
            | SessionState::DiscoveringCharacteristics
            | SessionState::Subscribing => return self.fail(BleError::disconnected()),
            _ => {
                debug!("Ignoring link loss in {:?}", self.state);
                return;
            }
        }

        let adapter = self.monitor.current();
        if matches!(
            adapter,
            AdapterState::Resetting
                | AdapterState::PoweredOff
                | AdapterState::Unauthorized
                | AdapterState::Unsupported
        ) {
            return self.on_adapter(adapter);
        }

        let Some(attempt) = &mut self.attempt else {
            return self.fail(BleError::NoPeripheral);
        };
        warn!("Connection to {} lost, reconnecting", attempt.peripheral.id);

        // Descriptors may change across connections.
        if let Some(characteristic) = attempt.characteristic.take() {
            characteristic.close();
        }
        attempt.discovery.reset();
        let connection = attempt.connection.clone();

        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.pending_read = None;
        self.transition(SessionState::Reconnecting);

        self.spawn_step(async move { StepEvent::Reconnected(connection.reconnect().await) });
    }

    fn on_reconnected(&mut self, result: Result<()>) {
        if self.state != SessionState::Reconnecting {
            return;
        }
        match result {
            Ok(()) => {
                self.transition(SessionState::DiscoveringServices);
                self.discover_services();
            }
            Err(e) => self.fail(e),
        }
    }

    // ----- helpers -------------------------------------------------------

    fn characteristic(&self) -> Option<Arc<CharacteristicSession>> {
        self.attempt
            .as_ref()
            .and_then(|attempt| attempt.characteristic.clone())
    }

    fn deliver_read(&self, result: Result<CharacteristicValue>) {
        match result {
            Ok(value) => {
                let _ = self.events.send(SessionEvent::ValueRead(value));
            }
            Err(error) => self.report_failure(Operation::Read, error),
        }
    }

    fn report_failure(&self, operation: Operation, error: BleError) {
        warn!("{:?} failed: {}", operation, error);
        let _ = self
            .events
            .send(SessionEvent::OperationFailed { operation, error });
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            epoch: self.epoch,
            steps: self.steps.clone(),
        }
    }

    /// Run a one-shot stage operation and feed its outcome back.
    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = StepEvent> + Send + 'static,
    {
        let reporter = self.reporter();
        tokio::spawn(async move {
            reporter.report(step.await);
        });
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next.clone();
        self.state_tx.send_replace(next.clone());
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    fn fail(&mut self, error: BleError) {
        error!("Session failed in {:?}: {}", self.state, error);
        self.teardown();
        self.transition(SessionState::Failed(error));
    }

    /// Stop scanning and drop any link without leaving the current epoch.
    fn reset_radio(&mut self) {
        self.scanner.stop_scan();
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        if let Some(attempt) = self.attempt.take() {
            attempt.release();
        }
        self.pending_read = None;
    }

    /// Abandon the current attempt entirely.
    fn teardown(&mut self) {
        self.epoch += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.reset_radio();
    }
}

fn adapter_error(adapter: AdapterState) -> BleError {
    adapter
        .as_error()
        .map(BleError::from)
        .unwrap_or(BleError::InvalidAdapterState(adapter))
}
