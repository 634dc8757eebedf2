//! Discovery Engine
//!
//! Walks a connected peripheral's GATT tree down to one characteristic.
//! Completed lookups are cached until [`DiscoveryEngine::reset`], which the
//! session calls whenever the link is re-established.

use crate::domain::error::{DiscoveryError, Result};
use crate::domain::models::{CharacteristicDescriptor, PeripheralId, ServiceDescriptor};
use crate::infrastructure::bluetooth::backend::BleBackend;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct DiscoveryCache {
    peripheral: Option<PeripheralId>,
    services: HashMap<Uuid, Option<ServiceDescriptor>>,
    characteristics: HashMap<(Uuid, Uuid), Option<CharacteristicDescriptor>>,
}

impl DiscoveryCache {
    /// Scope the cache to `peripheral`, dropping entries for any other.
    fn scoped(&mut self, peripheral: &PeripheralId) -> &mut Self {
        if self.peripheral != Some(*peripheral) {
            self.services.clear();
            self.characteristics.clear();
            self.peripheral = Some(*peripheral);
        }
        self
    }
}

pub struct DiscoveryEngine {
    backend: Arc<dyn BleBackend>,
    cache: Mutex<DiscoveryCache>,
}

impl DiscoveryEngine {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(DiscoveryCache::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locate `service_filter` on the connected peripheral.
    pub async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        service_filter: Uuid,
    ) -> Result<ServiceDescriptor> {
        let cached = self
            .lock()
            .scoped(peripheral)
            .services
            .get(&service_filter)
            .cloned();
        let found = match cached {
            Some(found) => {
                debug!("Service discovery for {} served from cache", service_filter);
                found
            }
            None => {
                let services = self
                    .backend
                    .discover_services(peripheral, &[service_filter])
                    .await?;
                info!("Found {} services", services.len());
                let found = services.into_iter().find(|s| s.uuid == service_filter);
                self.lock()
                    .scoped(peripheral)
                    .services
                    .insert(service_filter, found.clone());
                found
            }
        };

        found.ok_or_else(|| DiscoveryError::ServiceNotFound(service_filter).into())
    }

    /// Locate `characteristic_filter` beneath `service`.
    pub async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceDescriptor,
        characteristic_filter: Uuid,
    ) -> Result<CharacteristicDescriptor> {
        let key = (service.uuid, characteristic_filter);
        let cached = self
            .lock()
            .scoped(peripheral)
            .characteristics
            .get(&key)
            .cloned();
        let found = match cached {
            Some(found) => {
                debug!(
                    "Characteristic discovery for {} served from cache",
                    characteristic_filter
                );
                found
            }
            None => {
                let characteristics = self
                    .backend
                    .discover_characteristics(peripheral, service, &[characteristic_filter])
                    .await?;
                info!("Found {} characteristics", characteristics.len());
                let found = characteristics
                    .into_iter()
                    .find(|c| c.uuid == characteristic_filter);
                self.lock()
                    .scoped(peripheral)
                    .characteristics
                    .insert(key, found.clone());
                found
            }
        };

        found.ok_or_else(|| DiscoveryError::CharacteristicNotFound(characteristic_filter).into())
    }

    /// Forget everything discovered so far.
    pub fn reset(&self) {
        *self.lock() = DiscoveryCache::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::BleError;
    use crate::domain::models::AdapterState;
    use crate::infrastructure::bluetooth::protocol::{
        uuid_from_u16, CHARACTERISTIC_UUID, SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedPeripheral};

    async fn connected(peripheral: SimulatedPeripheral) -> (Arc<SimulatedBackend>, PeripheralId) {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let id = backend.add_peripheral(peripheral);
        backend.connect(&id).await.unwrap();
        (backend, id)
    }

    #[tokio::test]
    async fn test_discovery_is_cached_per_connection() {
        let (backend, id) = connected(SimulatedPeripheral::with_gatt(
            "Ble-Demo",
            SERVICE_UUID,
            CHARACTERISTIC_UUID,
        ))
        .await;
        let engine = DiscoveryEngine::new(backend.clone());

        let service = engine.discover_services(&id, SERVICE_UUID).await.unwrap();
        let again = engine.discover_services(&id, SERVICE_UUID).await.unwrap();
        assert_eq!(service, again);
        assert_eq!(backend.service_queries(), 1);

        let characteristic = engine
            .discover_characteristics(&id, &service, CHARACTERISTIC_UUID)
            .await
            .unwrap();
        engine
            .discover_characteristics(&id, &service, CHARACTERISTIC_UUID)
            .await
            .unwrap();
        assert_eq!(characteristic.service, SERVICE_UUID);
        assert_eq!(backend.characteristic_queries(), 1);

        engine.reset();
        engine.discover_services(&id, SERVICE_UUID).await.unwrap();
        assert_eq!(backend.service_queries(), 2);
    }

    #[tokio::test]
    async fn test_service_not_found() {
        let other = uuid_from_u16(0x180f);
        let (backend, id) = connected(
            SimulatedPeripheral::new("Battery")
                .advertising(vec![SERVICE_UUID])
                .with_service(other, vec![uuid_from_u16(0x2a19)]),
        )
        .await;
        let engine = DiscoveryEngine::new(backend.clone());

        let err = engine.discover_services(&id, SERVICE_UUID).await.unwrap_err();
        assert_eq!(
            err,
            BleError::Discovery(DiscoveryError::ServiceNotFound(SERVICE_UUID))
        );
        // The negative result is cached as well.
        assert!(engine.discover_services(&id, SERVICE_UUID).await.is_err());
        assert_eq!(backend.service_queries(), 1);
    }

    #[tokio::test]
    async fn test_characteristic_not_found() {
        let (backend, id) = connected(
            SimulatedPeripheral::new("Ble-Demo")
                .with_service(SERVICE_UUID, vec![uuid_from_u16(0xec01)]),
        )
        .await;
        let engine = DiscoveryEngine::new(backend);

        let service = engine.discover_services(&id, SERVICE_UUID).await.unwrap();
        let err = engine
            .discover_characteristics(&id, &service, CHARACTERISTIC_UUID)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BleError::Discovery(DiscoveryError::CharacteristicNotFound(CHARACTERISTIC_UUID))
        );
    }

    #[tokio::test]
    async fn test_disconnected_peripheral_is_not_cached() {
        let (backend, id) = connected(SimulatedPeripheral::with_gatt(
            "Ble-Demo",
            SERVICE_UUID,
            CHARACTERISTIC_UUID,
        ))
        .await;
        let engine = DiscoveryEngine::new(backend.clone());
        backend.drop_link(&id);

        let err = engine.discover_services(&id, SERVICE_UUID).await.unwrap_err();
        assert!(err.is_disconnected());

        backend.connect(&id).await.unwrap();
        assert!(engine.discover_services(&id, SERVICE_UUID).await.is_ok());
        assert_eq!(backend.service_queries(), 2);
    }
}
