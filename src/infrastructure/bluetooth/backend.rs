//! Platform BLE capability
//!
//! Everything the session needs from the platform radio. Release operations
//! (`stop_scan`, `disconnect`, `unsubscribe`) are synchronous so a teardown
//! completes before the next session attempt can touch the radio.

use crate::domain::error::Result;
use crate::domain::models::{
    AdapterState, Advertisement, CharacteristicDescriptor, PeripheralId, ServiceDescriptor,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// Current radio state.
    fn adapter_state(&self) -> AdapterState;

    /// Every radio state change after the call.
    fn adapter_updates(&self) -> broadcast::Receiver<AdapterState>;

    /// Start scanning. The platform may apply `services` as a filter but is
    /// not required to.
    fn start_scan(&self, services: &[Uuid]) -> Result<mpsc::UnboundedReceiver<Advertisement>>;

    fn stop_scan(&self);

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Release the link or abandon a pending connect.
    fn disconnect(&self, peripheral: &PeripheralId);

    /// Ids of peripherals whose established link dropped.
    fn disconnections(&self) -> broadcast::Receiver<PeripheralId>;

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: &[Uuid],
    ) -> Result<Vec<ServiceDescriptor>>;

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceDescriptor,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicDescriptor>>;

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
    ) -> Result<()>;

    /// Enable notifications. The receiver closes when the link drops.
    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;

    fn unsubscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicDescriptor);
}
