//! BLE Scanner Module
//!
//! Turns platform advertisements into [`PeripheralHandle`]s for one target
//! service.

use crate::domain::error::{BleError, Result};
use crate::domain::models::{AdapterState, Advertisement, PeripheralHandle};
use crate::infrastructure::bluetooth::backend::BleBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// BLE Scanner. At most one scan is active at a time.
pub struct Scanner {
    backend: Arc<dyn BleBackend>,
    active: Mutex<Option<Arc<AtomicBool>>>,
}

impl Scanner {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self {
            backend,
            active: Mutex::new(None),
        }
    }

    /// Start scanning for peripherals advertising `service_filter`.
    ///
    /// Any previous scan is stopped first. Fails with `InvalidAdapterState`
    /// unless the adapter is powered on.
    pub fn start_scan(&self, service_filter: Uuid) -> Result<ScanStream> {
        let adapter = self.backend.adapter_state();
        if adapter != AdapterState::PoweredOn {
            return Err(BleError::InvalidAdapterState(adapter));
        }

        self.stop_scan();

        info!("Starting BLE scan for service UUID: {}", service_filter);
        let advertisements = self.backend.start_scan(&[service_filter])?;
        let stopped = Arc::new(AtomicBool::new(false));
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(stopped.clone());

        Ok(ScanStream {
            service_filter,
            advertisements,
            stopped,
        })
    }

    /// Stop scanning. Idempotent; the active stream yields nothing further.
    pub fn stop_scan(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stopped) = active {
            info!("Stopping BLE scan...");
            stopped.store(true, Ordering::SeqCst);
            self.backend.stop_scan();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

/// Matching peripherals in discovery order. Re-advertisements of the same
/// peripheral are passed through.
pub struct ScanStream {
    service_filter: Uuid,
    advertisements: mpsc::UnboundedReceiver<Advertisement>,
    stopped: Arc<AtomicBool>,
}

impl ScanStream {
    /// Next matching peripheral, or `None` once the scan has been stopped.
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            let advertisement = self.advertisements.recv().await?;
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }

            if advertisement.service_uuids.contains(&self.service_filter) {
                debug!(
                    "Found peripheral {} ({:?}, rssi {})",
                    advertisement.peripheral, advertisement.local_name, advertisement.rssi
                );
                return Some(advertisement.into());
            }
            trace!(
                "Ignoring advertisement from {} without service {}",
                advertisement.peripheral,
                self.service_filter
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        uuid_from_u16, CHARACTERISTIC_UUID, SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedPeripheral};

    #[tokio::test]
    async fn test_start_scan_requires_powered_on() {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::Unauthorized));
        let scanner = Scanner::new(backend.clone());
        assert_eq!(
            scanner.start_scan(SERVICE_UUID).err(),
            Some(BleError::InvalidAdapterState(AdapterState::Unauthorized))
        );
        assert_eq!(backend.scans_started(), 0);
    }

    #[tokio::test]
    async fn test_scan_filters_by_service() {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let other = backend.add_peripheral(
            SimulatedPeripheral::new("Heart Rate").advertising(vec![uuid_from_u16(0x180d)]),
        );
        let target = backend.add_peripheral(SimulatedPeripheral::with_gatt(
            "Ble-Demo",
            SERVICE_UUID,
            CHARACTERISTIC_UUID,
        ));
        let scanner = Scanner::new(backend.clone());
        let mut stream = scanner.start_scan(SERVICE_UUID).unwrap();

        assert!(backend.advertise(&other));
        assert!(backend.advertise(&target));
        assert!(backend.advertise(&target));

        let first = stream.next().await.unwrap();
        assert_eq!(first.id, target);
        assert_eq!(first.name, "Ble-Demo");
        // Duplicates are delivered; the caller decides when to stop.
        assert_eq!(stream.next().await.unwrap().id, target);
    }

    #[tokio::test]
    async fn test_stop_scan_closes_stream() {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let target = backend.add_peripheral(SimulatedPeripheral::with_gatt(
            "Ble-Demo",
            SERVICE_UUID,
            CHARACTERISTIC_UUID,
        ));
        let scanner = Scanner::new(backend.clone());
        let mut stream = scanner.start_scan(SERVICE_UUID).unwrap();
        assert!(backend.advertise(&target));

        scanner.stop_scan();
        scanner.stop_scan();
        assert!(!scanner.is_scanning());
        assert!(!backend.is_scanning());
        assert_eq!(stream.next().await, None);
        assert!(!backend.advertise(&target));
    }
}
