use crate::domain::error::{AdapterError, BleError};
use std::fmt;
use uuid::Uuid;

/// Power/availability state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
    Resetting,
}

impl AdapterState {
    /// The error a session reports when it cannot proceed in this state.
    pub fn as_error(self) -> Option<AdapterError> {
        match self {
            Self::PoweredOn => None,
            Self::PoweredOff => Some(AdapterError::PoweredOff),
            Self::Unauthorized => Some(AdapterError::Unauthorized),
            Self::Unsupported => Some(AdapterError::Unsupported),
            Self::Resetting => Some(AdapterError::Resetting),
            Self::Unknown => Some(AdapterError::Unknown),
        }
    }
}

/// Platform identity of a remote peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub Uuid);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Raw advertisement as reported by the platform while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: i16,
}

/// A peripheral seen by the scanner whose advertisement matched the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub name: String,
    pub services: Vec<Uuid>,
    pub rssi: i16,
}

impl From<Advertisement> for PeripheralHandle {
    fn from(adv: Advertisement) -> Self {
        Self {
            id: adv.peripheral,
            name: adv
                .local_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            services: adv.service_uuids,
            rssi: adv.rssi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service: Uuid,
}

/// Where a characteristic value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    Read,
    /// Peripheral push; `sequence` increases by one per notification
    /// observed on the characteristic session.
    Notification { sequence: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub data: Vec<u8>,
    pub origin: ValueOrigin,
}

impl CharacteristicValue {
    pub fn read(data: Vec<u8>) -> Self {
        Self {
            data,
            origin: ValueOrigin::Read,
        }
    }

    pub fn notification(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            origin: ValueOrigin::Notification { sequence },
        }
    }

    /// Lossy UTF-8 rendering for display.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Link-layer state of the connection manager's peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Completion notifications buffered per connection for
/// disconnect/reconnect cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingForAdapter,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Ready,
    Reconnecting,
    Failed(BleError),
}

impl SessionState {
    /// True for states that hold scan, link or subscription resources.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Not connected"),
            Self::WaitingForAdapter => f.write_str("Waiting for Bluetooth..."),
            Self::Scanning => f.write_str("Scanning..."),
            Self::Connecting => f.write_str("Connecting..."),
            Self::DiscoveringServices => f.write_str("Discovering services..."),
            Self::DiscoveringCharacteristics => f.write_str("Discovering characteristics..."),
            Self::Subscribing => f.write_str("Subscribing..."),
            Self::Ready => f.write_str("Connected"),
            Self::Reconnecting => f.write_str("Reconnecting..."),
            Self::Failed(error) => write!(f, "Failed: {}", error),
        }
    }
}

/// Commands accepted by the session orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Read,
    Write(Vec<u8>),
    Refresh,
    Cancel,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Everything the session reports upward to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    PeripheralSelected(PeripheralHandle),
    ValueRead(CharacteristicValue),
    Notification(CharacteristicValue),
    WriteCompleted,
    OperationFailed {
        operation: Operation,
        error: BleError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ConnectionError;

    #[test]
    fn test_handle_from_advertisement_names_unknown() {
        let id = PeripheralId(Uuid::from_u128(1));
        let handle = PeripheralHandle::from(Advertisement {
            peripheral: id,
            local_name: Some(String::new()),
            service_uuids: vec![],
            rssi: -60,
        });
        assert_eq!(handle.name, "Unknown");
        assert_eq!(handle.id, id);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(SessionState::Ready.to_string(), "Connected");
        let failed = SessionState::Failed(ConnectionError::Timeout.into());
        assert_eq!(failed.to_string(), "Failed: connection timed out");
        assert!(!failed.is_active());
        assert!(SessionState::Scanning.is_active());
    }

    #[test]
    fn test_adapter_state_errors() {
        assert_eq!(AdapterState::PoweredOn.as_error(), None);
        assert_eq!(
            AdapterState::PoweredOff.as_error(),
            Some(AdapterError::PoweredOff)
        );
    }
}
