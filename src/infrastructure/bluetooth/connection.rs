//! BLE Connection Module
//!
//! Establishes and tracks the link to one selected peripheral. One manager
//! serves one session attempt; once released it never reconnects.

use crate::domain::error::{BleError, ConnectionError, Result};
use crate::domain::models::{LinkEvent, LinkState, PeripheralHandle, PeripheralId};
use crate::infrastructure::bluetooth::backend::BleBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Inner {
    peripheral: Option<PeripheralId>,
    timeout: Duration,
    events: Option<broadcast::Sender<LinkEvent>>,
    watcher: Option<JoinHandle<()>>,
}

/// BLE Connection handler
pub struct ConnectionManager {
    backend: Arc<dyn BleBackend>,
    inner: Mutex<Inner>,
    link: Arc<watch::Sender<LinkState>>,
    released: AtomicBool,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            backend,
            inner: Mutex::new(Inner {
                peripheral: None,
                timeout: Duration::ZERO,
                events: None,
                watcher: None,
            }),
            link: Arc::new(link),
            released: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect to `peripheral`, failing with `Timeout` if the link is not up
    /// within `timeout` and with `Disconnected` if it drops while being
    /// established.
    ///
    /// The returned receiver carries link events for this peripheral across
    /// later reconnects; `retry_capacity` bounds how many it buffers.
    pub async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        timeout: Duration,
        retry_capacity: usize,
    ) -> Result<broadcast::Receiver<LinkEvent>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(BleError::disconnected());
        }

        let id = peripheral.id;
        let events = {
            let mut inner = self.lock();
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
            let (events, _) = broadcast::channel(retry_capacity.max(1));
            inner.peripheral = Some(id);
            inner.timeout = timeout;
            inner.events = Some(events.clone());
            inner.watcher = Some(self.spawn_watcher(id, events.clone()));
            events
        };

        let receiver = events.subscribe();
        info!("Connecting to Bluetooth device: {} ({})", peripheral.name, id);
        self.establish(id, timeout, &events).await?;
        Ok(receiver)
    }

    /// Re-attempt the link to the peripheral of the last `connect`, without
    /// scanning again.
    pub async fn reconnect(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(BleError::disconnected());
        }

        let (id, timeout, events) = {
            let inner = self.lock();
            match (inner.peripheral, inner.events.clone()) {
                (Some(id), Some(events)) => (id, inner.timeout, events),
                _ => return Err(BleError::NoPeripheral),
            }
        };

        info!("Reconnecting to Bluetooth device: {}", id);
        self.establish(id, timeout, &events).await
    }

    async fn establish(
        &self,
        id: PeripheralId,
        timeout: Duration,
        events: &broadcast::Sender<LinkEvent>,
    ) -> Result<()> {
        let mut link = self.link.subscribe();
        self.link.send_replace(LinkState::Connecting);
        link.borrow_and_update();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.backend.connect(&id)) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Connection to {} timed out after {:?}", id, timeout);
                    self.backend.disconnect(&id);
                    Err(ConnectionError::Timeout.into())
                }
            },
            _ = wait_for_drop(&mut link) => Err(BleError::disconnected()),
        };

        match outcome {
            Ok(()) if self.released.load(Ordering::SeqCst) => {
                info!("Connection to {} completed after release, dropping it", id);
                self.backend.disconnect(&id);
                Err(BleError::disconnected())
            }
            Ok(()) => {
                info!("Device connected: {}", id);
                self.link.send_replace(LinkState::Connected);
                let _ = events.send(LinkEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.link.send_replace(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    fn spawn_watcher(
        &self,
        id: PeripheralId,
        events: broadcast::Sender<LinkEvent>,
    ) -> JoinHandle<()> {
        // Subscribed here, before the connect is issued.
        let mut drops = self.backend.disconnections();
        let link = self.link.clone();

        tokio::spawn(async move {
            loop {
                match drops.recv().await {
                    Ok(dropped) if dropped == id => {
                        let previous = link.send_replace(LinkState::Disconnected);
                        if previous == LinkState::Connected {
                            warn!("Link to {} dropped", id);
                            let _ = events.send(LinkEvent::Disconnected);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Disconnection stream lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Release the link and stop tracking it. Safe to call in any state and
    /// more than once.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        let (peripheral, watcher) = {
            let mut inner = self.lock();
            // Closes every link event receiver once the watcher is gone.
            inner.events = None;
            (inner.peripheral, inner.watcher.take())
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(id) = peripheral {
            let previous = self.link.send_replace(LinkState::Disconnected);
            if previous != LinkState::Disconnected {
                info!("Disconnected from device {}", id);
            }
            self.backend.disconnect(&id);
        }
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow() == LinkState::Connected
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.lock().watcher.take() {
            watcher.abort();
        }
    }
}

/// Resolves once the link leaves `Connecting`/`Connected` for
/// `Disconnected`, or its owner goes away.
pub(crate) async fn wait_for_drop(link: &mut watch::Receiver<LinkState>) {
    loop {
        if link.changed().await.is_err() {
            return;
        }
        if *link.borrow_and_update() == LinkState::Disconnected {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AdapterState;
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::infrastructure::bluetooth::simulated::{
        ConnectBehaviour, SimulatedBackend, SimulatedPeripheral,
    };

    fn setup(behaviour: ConnectBehaviour) -> (Arc<SimulatedBackend>, PeripheralHandle) {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let peripheral =
            SimulatedPeripheral::with_gatt("Ble-Demo", SERVICE_UUID, CHARACTERISTIC_UUID)
                .with_connect(behaviour);
        let handle = PeripheralHandle {
            id: peripheral.id,
            name: peripheral.name.clone(),
            services: peripheral.advertised_services.clone(),
            rssi: peripheral.rssi,
        };
        backend.add_peripheral(peripheral);
        (backend, handle)
    }

    #[tokio::test]
    async fn test_connect_and_link_drop() {
        let (backend, handle) = setup(ConnectBehaviour::Accept);
        let manager = ConnectionManager::new(backend.clone());

        let mut events = manager
            .connect(&handle, Duration::from_secs(5), 4)
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
        assert!(manager.is_connected());
        assert!(backend.is_connected(&handle.id));

        backend.drop_link(&handle.id);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
        assert!(!manager.is_connected());

        manager.reconnect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
        assert_eq!(backend.connect_attempts(), vec![handle.id, handle.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (backend, handle) = setup(ConnectBehaviour::Hang);
        let manager = ConnectionManager::new(backend.clone());

        let result = manager.connect(&handle, Duration::from_secs(3), 4).await;
        assert_eq!(
            result.err(),
            Some(BleError::Connection(ConnectionError::Timeout))
        );
        assert_eq!(*manager.link_state().borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connect_is_disconnected() {
        let (backend, handle) = setup(ConnectBehaviour::Refuse);
        let manager = ConnectionManager::new(backend);

        let result = manager.connect(&handle, Duration::from_secs(3), 4).await;
        assert!(result.unwrap_err().is_disconnected());
    }

    #[tokio::test]
    async fn test_reconnect_without_peripheral() {
        let (backend, _) = setup(ConnectBehaviour::Accept);
        let manager = ConnectionManager::new(backend);
        assert_eq!(manager.reconnect().await, Err(BleError::NoPeripheral));
    }

    #[tokio::test]
    async fn test_release_is_final() {
        let (backend, handle) = setup(ConnectBehaviour::Accept);
        let manager = ConnectionManager::new(backend.clone());
        manager
            .connect(&handle, Duration::from_secs(5), 4)
            .await
            .unwrap();

        manager.release();
        manager.release();
        assert!(!backend.is_connected(&handle.id));
        assert!(manager.reconnect().await.unwrap_err().is_disconnected());
    }
}
