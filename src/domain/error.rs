//! Error taxonomy for the BLE session.
//!
//! Setup-phase errors (adapter, connection, discovery) end a session attempt.
//! Operation errors are local to one read or write.

use crate::domain::models::AdapterState;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("Bluetooth is powered off")]
    PoweredOff,
    #[error("Bluetooth access is not authorized")]
    Unauthorized,
    #[error("Bluetooth LE is not supported on this device")]
    Unsupported,
    #[error("Bluetooth adapter is resetting")]
    Resetting,
    #[error("Bluetooth adapter state is unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection timed out")]
    Timeout,
    #[error("peripheral disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("adapter is not powered on (state: {0:?})")]
    InvalidAdapterState(AdapterState),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("no peripheral selected")]
    NoPeripheral,
    #[error("platform error: {0}")]
    Platform(String),
}

impl BleError {
    pub fn disconnected() -> Self {
        ConnectionError::Disconnected.into()
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::Disconnected))
    }
}
