//! In-process BLE backend
//!
//! Scriptable radio and peripherals used by the demo binary and the tests.
//! The scan does not apply the platform-level service filter, so every
//! advertisement reaches the [`Scanner`](super::scanner::Scanner).

use crate::domain::error::{BleError, Result};
use crate::domain::models::{
    AdapterState, Advertisement, CharacteristicDescriptor, PeripheralId, ServiceDescriptor,
};
use crate::infrastructure::bluetooth::backend::BleBackend;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

/// How a simulated peripheral answers a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    Accept,
    /// Fails with `Disconnected`.
    Refuse,
    /// Never completes.
    Hang,
}

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: PeripheralId,
    pub name: String,
    pub rssi: i16,
    pub advertised_services: Vec<Uuid>,
    /// GATT tree: service UUID with its characteristic UUIDs.
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    pub value: Vec<u8>,
    pub connect: ConnectBehaviour,
    pub read_hangs: bool,
    /// Reads complete only after this long.
    pub read_delay: Option<Duration>,
    pub write_hangs: bool,
    /// Announce this peripheral as soon as a scan starts.
    pub auto_advertise: bool,
}

impl SimulatedPeripheral {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PeripheralId(Uuid::new_v4()),
            name: name.into(),
            rssi: -55,
            advertised_services: Vec::new(),
            services: Vec::new(),
            value: Vec::new(),
            connect: ConnectBehaviour::Accept,
            read_hangs: false,
            read_delay: None,
            write_hangs: false,
            auto_advertise: false,
        }
    }

    /// A peripheral advertising `service` and exposing `characteristic`
    /// beneath it.
    pub fn with_gatt(name: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        Self::new(name)
            .advertising(vec![service])
            .with_service(service, vec![characteristic])
    }

    pub fn advertising(mut self, services: Vec<Uuid>) -> Self {
        self.advertised_services = services;
        self
    }

    pub fn with_service(mut self, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.services.push((service, characteristics));
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_connect(mut self, behaviour: ConnectBehaviour) -> Self {
        self.connect = behaviour;
        self
    }

    pub fn auto_advertise(mut self, enabled: bool) -> Self {
        self.auto_advertise = enabled;
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            peripheral: self.id,
            local_name: Some(self.name.clone()),
            service_uuids: self.advertised_services.clone(),
            rssi: self.rssi,
        }
    }
}

struct PeripheralRuntime {
    profile: SimulatedPeripheral,
    connected: bool,
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writes: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Counters {
    scans_started: usize,
    service_queries: usize,
    characteristic_queries: usize,
    connect_attempts: Vec<PeripheralId>,
}

struct SimState {
    adapter: AdapterState,
    peripherals: Vec<PeripheralRuntime>,
    scan: Option<mpsc::UnboundedSender<Advertisement>>,
    counters: Counters,
}

impl SimState {
    fn find(&mut self, id: &PeripheralId) -> Result<&mut PeripheralRuntime> {
        self.peripherals
            .iter_mut()
            .find(|p| p.profile.id == *id)
            .ok_or_else(|| BleError::Platform(format!("unknown peripheral {}", id)))
    }

    fn connected(&mut self, id: &PeripheralId) -> Result<&mut PeripheralRuntime> {
        let peripheral = self.find(id)?;
        if peripheral.connected {
            Ok(peripheral)
        } else {
            Err(BleError::disconnected())
        }
    }
}

pub struct SimulatedBackend {
    state: Mutex<SimState>,
    adapter_tx: broadcast::Sender<AdapterState>,
    disconnect_tx: broadcast::Sender<PeripheralId>,
}

impl SimulatedBackend {
    pub fn new(adapter: AdapterState) -> Self {
        let (adapter_tx, _) = broadcast::channel(16);
        let (disconnect_tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SimState {
                adapter,
                peripherals: Vec::new(),
                scan: None,
                counters: Counters::default(),
            }),
            adapter_tx,
            disconnect_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) -> PeripheralId {
        let id = peripheral.id;
        self.lock().peripherals.push(PeripheralRuntime {
            profile: peripheral,
            connected: false,
            notify: None,
            writes: Vec::new(),
        });
        id
    }

    /// Change the radio state. Leaving `PoweredOn` ends the scan and drops
    /// every link.
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        let dropped: Vec<PeripheralId> = {
            let mut state = self.lock();
            if state.adapter == adapter {
                return;
            }
            state.adapter = adapter;
            if adapter == AdapterState::PoweredOn {
                Vec::new()
            } else {
                state.scan = None;
                state
                    .peripherals
                    .iter_mut()
                    .filter(|p| p.connected)
                    .map(|p| {
                        p.connected = false;
                        p.notify = None;
                        p.profile.id
                    })
                    .collect()
            }
        };

        debug!("Simulated adapter state: {:?}", adapter);
        let _ = self.adapter_tx.send(adapter);
        for id in dropped {
            let _ = self.disconnect_tx.send(id);
        }
    }

    /// Push an advertisement for `id` into the active scan.
    pub fn advertise(&self, id: &PeripheralId) -> bool {
        let mut state = self.lock();
        let advertisement = match state.find(id) {
            Ok(peripheral) => peripheral.profile.advertisement(),
            Err(_) => return false,
        };
        match &state.scan {
            Some(scan) => scan.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral or radio dropping an established link.
    pub fn drop_link(&self, id: &PeripheralId) -> bool {
        {
            let mut state = self.lock();
            match state.connected(id) {
                Ok(peripheral) => {
                    peripheral.connected = false;
                    peripheral.notify = None;
                }
                Err(_) => return false,
            }
        }
        debug!("Simulated link loss: {}", id);
        let _ = self.disconnect_tx.send(*id);
        true
    }

    /// Push a notification if the characteristic is subscribed.
    pub fn notify(&self, id: &PeripheralId, data: impl Into<Vec<u8>>) -> bool {
        let mut state = self.lock();
        match state.find(id) {
            Ok(PeripheralRuntime {
                notify: Some(sender),
                ..
            }) => sender.send(data.into()).is_ok(),
            _ => false,
        }
    }

    pub fn set_connect_behaviour(&self, id: &PeripheralId, behaviour: ConnectBehaviour) {
        if let Ok(peripheral) = self.lock().find(id) {
            peripheral.profile.connect = behaviour;
        }
    }

    pub fn set_read_hangs(&self, id: &PeripheralId, hangs: bool) {
        if let Ok(peripheral) = self.lock().find(id) {
            peripheral.profile.read_hangs = hangs;
        }
    }

    pub fn set_read_delay(&self, id: &PeripheralId, delay: Option<Duration>) {
        if let Ok(peripheral) = self.lock().find(id) {
            peripheral.profile.read_delay = delay;
        }
    }

    pub fn set_write_hangs(&self, id: &PeripheralId, hangs: bool) {
        if let Ok(peripheral) = self.lock().find(id) {
            peripheral.profile.write_hangs = hangs;
        }
    }

    pub fn writes(&self, id: &PeripheralId) -> Vec<Vec<u8>> {
        self.lock()
            .find(id)
            .map(|p| p.writes.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.lock().find(id).map(|p| p.connected).unwrap_or(false)
    }

    pub fn is_subscribed(&self, id: &PeripheralId) -> bool {
        self.lock()
            .find(id)
            .map(|p| p.notify.is_some())
            .unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    pub fn scans_started(&self) -> usize {
        self.lock().counters.scans_started
    }

    pub fn service_queries(&self) -> usize {
        self.lock().counters.service_queries
    }

    pub fn characteristic_queries(&self) -> usize {
        self.lock().counters.characteristic_queries
    }

    pub fn connect_attempts(&self) -> Vec<PeripheralId> {
        self.lock().counters.connect_attempts.clone()
    }
}

#[async_trait]
impl BleBackend for SimulatedBackend {
    fn adapter_state(&self) -> AdapterState {
        self.lock().adapter
    }

    fn adapter_updates(&self) -> broadcast::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    fn start_scan(&self, services: &[Uuid]) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let mut state = self.lock();
        if state.adapter != AdapterState::PoweredOn {
            return Err(BleError::InvalidAdapterState(state.adapter));
        }

        trace!("Simulated scan started (requested services: {:?})", services);
        let (tx, rx) = mpsc::unbounded_channel();
        for peripheral in state.peripherals.iter().filter(|p| p.profile.auto_advertise) {
            let _ = tx.send(peripheral.profile.advertisement());
        }
        state.counters.scans_started += 1;
        state.scan = Some(tx);
        Ok(rx)
    }

    fn stop_scan(&self) {
        self.lock().scan = None;
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let behaviour = {
            let mut state = self.lock();
            state.counters.connect_attempts.push(*peripheral);
            if state.adapter != AdapterState::PoweredOn {
                return Err(BleError::InvalidAdapterState(state.adapter));
            }
            state.find(peripheral)?.profile.connect
        };

        match behaviour {
            ConnectBehaviour::Accept => {
                tokio::task::yield_now().await;
                self.lock().find(peripheral)?.connected = true;
                Ok(())
            }
            ConnectBehaviour::Refuse => Err(BleError::disconnected()),
            ConnectBehaviour::Hang => std::future::pending().await,
        }
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        if let Ok(runtime) = self.lock().find(peripheral) {
            runtime.connected = false;
            runtime.notify = None;
        }
    }

    fn disconnections(&self) -> broadcast::Receiver<PeripheralId> {
        self.disconnect_tx.subscribe()
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: &[Uuid],
    ) -> Result<Vec<ServiceDescriptor>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.counters.service_queries += 1;
        let runtime = state.connected(peripheral)?;
        Ok(runtime
            .profile
            .services
            .iter()
            .filter(|(uuid, _)| filter.is_empty() || filter.contains(uuid))
            .map(|(uuid, _)| ServiceDescriptor { uuid: *uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceDescriptor,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicDescriptor>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.counters.characteristic_queries += 1;
        let runtime = state.connected(peripheral)?;
        Ok(runtime
            .profile
            .services
            .iter()
            .filter(|(uuid, _)| *uuid == service.uuid)
            .flat_map(|(_, characteristics)| characteristics.iter())
            .filter(|uuid| filter.is_empty() || filter.contains(uuid))
            .map(|uuid| CharacteristicDescriptor {
                uuid: *uuid,
                service: service.uuid,
            })
            .collect())
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        _characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>> {
        tokio::task::yield_now().await;
        let (hangs, delay) = {
            let mut state = self.lock();
            let runtime = state.connected(peripheral)?;
            (runtime.profile.read_hangs, runtime.profile.read_delay)
        };
        if hangs {
            return std::future::pending().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        Ok(state.connected(peripheral)?.profile.value.clone())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        _characteristic: &CharacteristicDescriptor,
        value: &[u8],
    ) -> Result<()> {
        tokio::task::yield_now().await;
        let hangs = self.lock().connected(peripheral)?.profile.write_hangs;
        if hangs {
            return std::future::pending().await;
        }
        let mut state = self.lock();
        let runtime = state.connected(peripheral)?;
        runtime.profile.value = value.to_vec();
        runtime.writes.push(value.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        _characteristic: &CharacteristicDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let runtime = state.connected(peripheral)?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.notify = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&self, peripheral: &PeripheralId, _characteristic: &CharacteristicDescriptor) {
        if let Ok(runtime) = self.lock().find(peripheral) {
            runtime.notify = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};

    #[tokio::test]
    async fn test_scan_requires_powered_on() {
        let backend = SimulatedBackend::new(AdapterState::PoweredOff);
        assert_eq!(
            backend.start_scan(&[SERVICE_UUID]).unwrap_err(),
            BleError::InvalidAdapterState(AdapterState::PoweredOff)
        );
        assert_eq!(backend.scans_started(), 0);
    }

    #[tokio::test]
    async fn test_power_off_drops_links() {
        let backend = SimulatedBackend::new(AdapterState::PoweredOn);
        let id = backend.add_peripheral(SimulatedPeripheral::with_gatt(
            "P1",
            SERVICE_UUID,
            CHARACTERISTIC_UUID,
        ));
        let mut drops = backend.disconnections();
        backend.connect(&id).await.unwrap();
        assert!(backend.is_connected(&id));

        backend.set_adapter_state(AdapterState::PoweredOff);
        assert!(!backend.is_connected(&id));
        assert_eq!(drops.recv().await.unwrap(), id);
    }
}
