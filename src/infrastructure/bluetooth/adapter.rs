//! Adapter State Monitor
//!
//! Observes the local radio's power/availability state.

use crate::domain::models::AdapterState;
use crate::infrastructure::bluetooth::backend::BleBackend;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

#[derive(Clone)]
pub struct AdapterMonitor {
    backend: Arc<dyn BleBackend>,
}

impl AdapterMonitor {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self { backend }
    }

    pub fn current(&self) -> AdapterState {
        self.backend.adapter_state()
    }

    /// Stream of adapter states: the current state first, then every change.
    pub fn subscribe(&self) -> AdapterStateStream {
        // Subscribe before sampling so no change can fall between the two.
        let updates = self.backend.adapter_updates();
        AdapterStateStream {
            backend: self.backend.clone(),
            pending: Some(self.backend.adapter_state()),
            last: None,
            updates,
        }
    }
}

pub struct AdapterStateStream {
    backend: Arc<dyn BleBackend>,
    pending: Option<AdapterState>,
    last: Option<AdapterState>,
    updates: broadcast::Receiver<AdapterState>,
}

impl AdapterStateStream {
    /// Next distinct state. Consecutive repeats are collapsed.
    ///
    /// Returns `None` only once the backend has gone away.
    pub async fn next(&mut self) -> Option<AdapterState> {
        loop {
            let state = match self.pending.take() {
                Some(state) => state,
                None => match self.updates.recv().await {
                    Ok(state) => state,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Adapter state stream lagged by {} updates", skipped);
                        self.backend.adapter_state()
                    }
                    Err(RecvError::Closed) => return None,
                },
            };

            if self.last != Some(state) {
                self.last = Some(state);
                return Some(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::SimulatedBackend;

    #[tokio::test]
    async fn test_stream_starts_with_current_state() {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::Resetting));
        let monitor = AdapterMonitor::new(backend.clone());
        let mut stream = monitor.subscribe();

        assert_eq!(stream.next().await, Some(AdapterState::Resetting));

        backend.set_adapter_state(AdapterState::PoweredOn);
        assert_eq!(stream.next().await, Some(AdapterState::PoweredOn));
    }

    #[tokio::test]
    async fn test_each_subscription_restarts() {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOff));
        let monitor = AdapterMonitor::new(backend.clone());

        let mut first = monitor.subscribe();
        assert_eq!(first.next().await, Some(AdapterState::PoweredOff));
        backend.set_adapter_state(AdapterState::PoweredOn);

        let mut second = monitor.subscribe();
        assert_eq!(second.next().await, Some(AdapterState::PoweredOn));
        assert_eq!(first.next().await, Some(AdapterState::PoweredOn));
        assert_eq!(monitor.current(), AdapterState::PoweredOn);
    }
}
