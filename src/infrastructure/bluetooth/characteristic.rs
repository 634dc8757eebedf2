//! Characteristic Session
//!
//! Read, write and notify against one discovered characteristic over the
//! link owned by a [`ConnectionManager`](super::connection::ConnectionManager).
//! Every operation fails with `Disconnected` once that link is down.

use crate::domain::error::{BleError, OperationError, Result};
use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicValue, LinkState, PeripheralId,
};
use crate::infrastructure::bluetooth::backend::BleBackend;
use crate::infrastructure::bluetooth::connection::wait_for_drop;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct QueueState {
    values: VecDeque<CharacteristicValue>,
    /// Values evicted since the consumer last looked.
    dropped: u64,
    /// No further values will be pushed.
    finished: bool,
}

/// Single-consumer queue holding at most `capacity` values; a push into a
/// full queue evicts the oldest.
#[derive(Debug)]
struct NotificationQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl NotificationQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, value: CharacteristicValue) {
        {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            if state.values.len() == self.capacity {
                state.values.pop_front();
                state.dropped += 1;
            }
            state.values.push_back(value);
        }
        self.ready.notify_one();
    }

    /// The source ended; queued values can still be drained.
    fn finish(&self) {
        self.lock().finished = true;
        self.ready.notify_one();
    }

    /// The consumer is no longer wanted; queued values are discarded.
    fn cancel(&self) {
        {
            let mut state = self.lock();
            state.finished = true;
            state.values.clear();
        }
        self.ready.notify_one();
    }
}

struct Subscription {
    queue: Arc<NotificationQueue>,
    pump: JoinHandle<()>,
}

pub struct CharacteristicSession {
    backend: Arc<dyn BleBackend>,
    peripheral: PeripheralId,
    descriptor: CharacteristicDescriptor,
    link: watch::Receiver<LinkState>,
    last_value: Arc<Mutex<Option<CharacteristicValue>>>,
    sequence: Arc<AtomicU64>,
    subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl CharacteristicSession {
    pub fn new(
        backend: Arc<dyn BleBackend>,
        peripheral: PeripheralId,
        descriptor: CharacteristicDescriptor,
        link: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            backend,
            peripheral,
            descriptor,
            link,
            last_value: Arc::new(Mutex::new(None)),
            sequence: Arc::new(AtomicU64::new(0)),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Most recent value from a successful read or a notification.
    pub fn last_value(&self) -> Option<CharacteristicValue> {
        self.last_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn read(&self, timeout: Duration) -> Result<CharacteristicValue> {
        let data = self
            .guarded(
                timeout,
                OperationError::ReadTimeout,
                self.backend.read(&self.peripheral, &self.descriptor),
            )
            .await?;

        debug!("Read {} bytes from {}", data.len(), self.descriptor.uuid);
        let value = CharacteristicValue::read(data);
        *self
            .last_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        Ok(value)
    }

    /// Write `value` once. No automatic retry.
    pub async fn write(&self, value: &[u8], timeout: Duration) -> Result<()> {
        self.guarded(
            timeout,
            OperationError::WriteTimeout,
            self.backend.write(&self.peripheral, &self.descriptor, value),
        )
        .await?;

        debug!("Wrote {} bytes to {}", value.len(), self.descriptor.uuid);
        Ok(())
    }

    /// Run a one-shot operation bounded by `timeout` and by the link.
    async fn guarded<T>(
        &self,
        timeout: Duration,
        on_timeout: OperationError,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut link = self.link.clone();
        if self.closed.load(Ordering::SeqCst) || *link.borrow_and_update() != LinkState::Connected
        {
            return Err(BleError::disconnected());
        }

        tokio::select! {
            result = tokio::time::timeout(timeout, operation) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} after {:?}", on_timeout, timeout);
                    Err(on_timeout.into())
                }
            },
            _ = wait_for_drop(&mut link) => Err(BleError::disconnected()),
        }
    }

    /// Enable notifications. Any previous stream is ended first.
    ///
    /// At most `buffer_capacity` unconsumed values are queued; beyond that
    /// the oldest are dropped and the peripheral side never waits.
    pub async fn subscribe(&self, buffer_capacity: usize) -> Result<NotificationStream> {
        self.unsubscribe();

        let mut link = self.link.clone();
        if self.closed.load(Ordering::SeqCst) || *link.borrow_and_update() != LinkState::Connected
        {
            return Err(BleError::disconnected());
        }

        let mut notifications = tokio::select! {
            result = self.backend.subscribe(&self.peripheral, &self.descriptor) => result?,
            _ = wait_for_drop(&mut link) => return Err(BleError::disconnected()),
        };

        if self.closed.load(Ordering::SeqCst) {
            debug!("Subscription completed after close, disabling it");
            self.backend.unsubscribe(&self.peripheral, &self.descriptor);
            return Err(BleError::disconnected());
        }

        let queue = Arc::new(NotificationQueue::new(buffer_capacity));
        let sink = queue.clone();
        let last_value = self.last_value.clone();
        let sequence = self.sequence.clone();
        let uuid = self.descriptor.uuid;

        let pump = tokio::spawn(async move {
            while let Some(data) = notifications.recv().await {
                let value = CharacteristicValue::notification(
                    data,
                    sequence.fetch_add(1, Ordering::SeqCst) + 1,
                );
                *last_value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
                sink.push(value);
            }
            debug!("Notification source for {} closed", uuid);
            sink.finish();
        });

        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Subscription {
            queue: queue.clone(),
            pump,
        });

        info!("Notifications enabled on {}", uuid);
        Ok(NotificationStream { queue })
    }

    /// Disable notifications and end the current stream. Idempotent.
    pub fn unsubscribe(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.pump.abort();
            subscription.queue.cancel();
            self.backend.unsubscribe(&self.peripheral, &self.descriptor);
            info!("Notifications disabled on {}", self.descriptor.uuid);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// End the session: unsubscribe and refuse further operations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.unsubscribe();
    }
}

impl Drop for CharacteristicSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Values pushed by the peripheral, in the order it sent them.
#[derive(Debug)]
pub struct NotificationStream {
    queue: Arc<NotificationQueue>,
}

impl NotificationStream {
    /// Next notification, or `None` once unsubscribed or the link is gone.
    pub async fn next(&mut self) -> Option<CharacteristicValue> {
        loop {
            {
                let mut state = self.queue.lock();
                if state.dropped > 0 {
                    warn!("Dropped {} oldest notifications", state.dropped);
                    state.dropped = 0;
                }
                if let Some(value) = state.values.pop_front() {
                    return Some(value);
                }
                if state.finished {
                    return None;
                }
            }
            // A notify_one with no waiter leaves a permit, so no push is missed.
            self.queue.ready.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AdapterState, PeripheralHandle, ValueOrigin};
    use crate::infrastructure::bluetooth::connection::ConnectionManager;
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedPeripheral};

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        id: PeripheralId,
        _connection: ConnectionManager,
        session: CharacteristicSession,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let peripheral =
            SimulatedPeripheral::with_gatt("Ble-Demo", SERVICE_UUID, CHARACTERISTIC_UUID)
                .with_value("hello");
        let handle = PeripheralHandle {
            id: peripheral.id,
            name: peripheral.name.clone(),
            services: vec![SERVICE_UUID],
            rssi: peripheral.rssi,
        };
        let id = backend.add_peripheral(peripheral);

        let connection = ConnectionManager::new(backend.clone());
        connection
            .connect(&handle, Duration::from_secs(5), 4)
            .await
            .unwrap();
        let session = CharacteristicSession::new(
            backend.clone(),
            id,
            CharacteristicDescriptor {
                uuid: CHARACTERISTIC_UUID,
                service: SERVICE_UUID,
            },
            connection.link_state(),
        );

        Fixture {
            backend,
            id,
            _connection: connection,
            session,
        }
    }

    #[tokio::test]
    async fn test_read_updates_cache() {
        let f = fixture().await;
        assert_eq!(f.session.last_value(), None);

        let value = f.session.read(Duration::from_secs(5)).await.unwrap();
        assert_eq!(value.data, b"hello");
        assert_eq!(value.origin, ValueOrigin::Read);
        assert_eq!(f.session.last_value(), Some(value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_keeps_cache() {
        let f = fixture().await;
        f.session.read(Duration::from_secs(5)).await.unwrap();
        f.backend.set_read_hangs(&f.id, true);

        let err = f.session.read(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, BleError::Operation(OperationError::ReadTimeout));
        assert_eq!(f.session.last_value().unwrap().data, b"hello");
    }

    #[tokio::test]
    async fn test_pending_read_fails_on_link_drop() {
        let f = fixture().await;
        f.backend.set_read_hangs(&f.id, true);

        let backend = f.backend.clone();
        let id = f.id;
        let dropper = tokio::spawn(async move {
            tokio::task::yield_now().await;
            backend.drop_link(&id);
        });

        let err = f.session.read(Duration::from_secs(60)).await.unwrap_err();
        assert!(err.is_disconnected());
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_disconnected_write() {
        let f = fixture().await;
        f.session
            .write(b"hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(f.backend.writes(&f.id), vec![b"hello".to_vec()]);

        f.backend.drop_link(&f.id);
        tokio::task::yield_now().await;
        let err = f
            .session
            .write(b"again", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_disconnected());
        assert_eq!(f.backend.writes(&f.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout() {
        let f = fixture().await;
        f.backend.set_write_hangs(&f.id, true);
        let err = f
            .session
            .write(b"hello", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, BleError::Operation(OperationError::WriteTimeout));
    }

    #[tokio::test]
    async fn test_resubscribe_yields_independent_streams() {
        let f = fixture().await;

        let mut first = f.session.subscribe(8).await.unwrap();
        assert!(f.backend.notify(&f.id, "one"));
        let value = first.next().await.unwrap();
        assert_eq!(value.data, b"one");
        assert_eq!(value.origin, ValueOrigin::Notification { sequence: 1 });

        assert!(f.backend.notify(&f.id, "stale"));
        f.session.unsubscribe();
        assert!(!f.backend.is_subscribed(&f.id));
        assert_eq!(first.next().await, None);

        let mut second = f.session.subscribe(8).await.unwrap();
        assert!(f.backend.notify(&f.id, "two"));
        assert_eq!(second.next().await.unwrap().data, b"two");
        assert_eq!(first.next().await, None);
    }

    #[tokio::test]
    async fn test_slow_consumer_keeps_exactly_capacity_newest() {
        let f = fixture().await;
        let mut stream = f.session.subscribe(3).await.unwrap();

        for n in 1..=8 {
            assert!(f.backend.notify(&f.id, format!("n{}", n)));
        }
        while f.session.last_value().map(|v| v.origin)
            != Some(ValueOrigin::Notification { sequence: 8 })
        {
            tokio::task::yield_now().await;
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(stream.next().await.unwrap().as_text());
        }
        assert_eq!(received, vec!["n6", "n7", "n8"]);

        // Nothing older survived: the next value is a fresh one.
        assert!(f.backend.notify(&f.id, "n9"));
        assert_eq!(stream.next().await.unwrap().as_text(), "n9");
    }

    #[tokio::test]
    async fn test_stream_ends_on_link_drop() {
        let f = fixture().await;
        let mut stream = f.session.subscribe(4).await.unwrap();
        f.backend.drop_link(&f.id);
        assert_eq!(stream.next().await, None);
        assert!(matches!(
            f.session.subscribe(4).await,
            Err(e) if e.is_disconnected()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_completing_after_timeout_is_discarded() {
        let f = fixture().await;
        f.session.read(Duration::from_secs(5)).await.unwrap();
        f.session
            .write(b"late", Duration::from_secs(5))
            .await
            .unwrap();
        f.backend
            .set_read_delay(&f.id, Some(Duration::from_secs(8)));

        let result = f.session.read(Duration::from_secs(5)).await;
        assert_eq!(result, Err(BleError::Operation(OperationError::ReadTimeout)));

        // Let the platform read finish; its value must not surface.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.session.last_value().unwrap().as_text(), "hello");
    }

    #[tokio::test]
    async fn test_closed_session_refuses_operations() {
        let f = fixture().await;
        let mut stream = f.session.subscribe(4).await.unwrap();
        f.session.close();
        assert_eq!(stream.next().await, None);
        assert!(f
            .session
            .read(Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_disconnected());
    }
}
