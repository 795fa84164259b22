//! # Correlation engine
//!
//! Turns the gateway's asynchronous MQTT traffic into calls that look
//! synchronous, and fans unsolicited change notifications out to watchers.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► Broker::bootstrap ──────┐                ┌──► Publisher
//!  caller ──► Broker::write_property ─┼── api codec ───┤
//!  caller ──► Broker::watch ──┐       │                │
//!                             ▼       ▼                │
//!                       ┌───────────────────────┐      │
//!                       │ Directory   (RwLock)  │      │
//!                       │ PendingWrites (Mutex) │      │
//!                       │ ObserverSet (RwLock)  │      │
//!                       └───────────────────────┘      │
//!                             ▲                        │
//!  event loop ──► Broker::dispatch ◄── inbound publish ┘
//! ```
//!
//! ```text
//! broker/
//! ├── directory.rs  - device snapshot and lookup indices
//! ├── observers.rs  - watch registrations and fan-out
//! ├── pending.rs    - completion slots for in-flight writes
//! └── error.rs      - BrokerError and its classification
//! ```
//!
//! ## Locking
//!
//! No lock is ever held across an `.await`. When the directory and the
//! observer set are both needed, the directory is taken first.

pub mod directory;
pub mod error;
pub mod observers;
pub mod pending;

pub use directory::{Device, DeviceSelector, Directory};
pub use error::{BrokerError, ErrorKind};
pub use observers::{PropertyUpdate, Sink};

use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    self, GetNodesResponse, NodeValueUpdate, PropertyValue, ValueId, WriteValueRequest,
    WriteValueResponse,
};
use crate::mqtt::message_manager::{MessageKind, Route, Router};
use crate::publisher::Publisher;
use observers::ObserverSet;
use pending::{Completion, PendingWrites, SlotGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One line of the device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: u32,
    pub name: Option<String>,
    pub location: String,
    pub product: String,
    pub ready: bool,
    pub available: bool,
    pub properties: usize,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        let info = device.info();
        DeviceSummary {
            id: device.id(),
            name: device.name().map(str::to_string),
            location: info.loc.clone(),
            product: info.product_label.clone(),
            ready: info.ready,
            available: info.available,
            properties: device.properties().len(),
        }
    }
}

struct Inner {
    publisher: Box<dyn Publisher>,
    directory: RwLock<Directory>,
    pending: Mutex<PendingWrites>,
    observers: RwLock<ObserverSet>,
    bootstrap_gate: tokio::sync::Mutex<()>,
    bootstrap_waiter: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Inner")
    }
}

/// Handle to the correlation engine. Clones share the same state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("devices", &read(&self.inner.directory).len())
            .field("pending_writes", &self.pending_writes())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Broker {
    pub fn new(publisher: impl Publisher + 'static) -> Self {
        Broker {
            inner: Arc::new(Inner {
                publisher: Box::new(publisher),
                directory: RwLock::new(Directory::default()),
                pending: Mutex::new(PendingWrites::default()),
                observers: RwLock::new(ObserverSet::default()),
                bootstrap_gate: tokio::sync::Mutex::new(()),
                bootstrap_waiter: Mutex::new(None),
            }),
        }
    }

    /// Topic filters the embedding transport must subscribe to, joined onto
    /// the deployment prefix.
    pub fn subscriptions(topic_prefix: &str) -> Vec<Route> {
        Router::new(topic_prefix).routes().to_vec()
    }

    /// Requests the device listing and waits until it has been installed.
    ///
    /// Concurrent callers queue up; only one request is outstanding at a
    /// time. On failure the previously installed directory stays in place.
    pub async fn bootstrap(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let deadline = Instant::now().checked_add(timeout);

        let _gate = tokio::select! {
            gate = self.inner.bootstrap_gate.lock() => gate,
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            _ = expiry(deadline) => return Err(BrokerError::Timeout(timeout)),
        };

        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.bootstrap_waiter) = Some(tx);
        let _waiter = WaiterGuard(&self.inner.bootstrap_waiter);

        debug!("Requesting device directory");
        self.inner
            .publisher
            .publish(api::TOPIC_GET_NODES_REQ, Vec::new())?;

        wait_for(rx, deadline, timeout, cancel, || BrokerError::Shutdown).await
    }

    /// Writes `value` to a device property and waits for the gateway's
    /// acknowledgement.
    ///
    /// Fails with a not-found error, without publishing, when the device or
    /// property is unknown. A publish error is returned immediately.
    pub async fn write_property<V>(
        &self,
        selector: impl Into<DeviceSelector>,
        property: &str,
        value: &V,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>
    where
        V: Serialize + ?Sized,
    {
        let deadline = Instant::now().checked_add(timeout);
        let selector = selector.into();
        let key = {
            let directory = read(&self.inner.directory);
            let (device, target) = resolve(&directory, &selector, property)?;
            if !target.writeable {
                debug!(
                    "Property {} on {} is not marked writeable; sending anyway",
                    property, selector
                );
            }
            device.value_id(target)
        };

        let payload = WriteValueRequest::new(&key, value).encode()?;

        let (ticket, rx) = lock(&self.inner.pending).register(key.clone());
        let _slot = SlotGuard::new(&self.inner.pending, key.clone(), ticket);

        self.inner
            .publisher
            .publish(api::TOPIC_WRITE_VALUE_REQ, payload)?;
        debug!("Write to {} sent, waiting for acknowledgement", key);

        wait_for(rx, deadline, timeout, cancel, || BrokerError::Superseded(key.clone())).await
    }

    /// Registers `sink` for change notifications of one property.
    pub fn watch(
        &self,
        selector: impl Into<DeviceSelector>,
        property: &str,
        sink: Sink,
    ) -> Result<WatchHandle, BrokerError> {
        let selector = selector.into();
        let directory = read(&self.inner.directory);
        let (device, target) = resolve(&directory, &selector, property)?;
        let key = device.value_id(target);

        let token = write(&self.inner.observers).insert(key.clone(), sink);
        drop(directory);

        debug!("Watching {} (registration {})", key, token);
        Ok(WatchHandle {
            inner: Arc::downgrade(&self.inner),
            key,
            token,
        })
    }

    /// Routes one inbound payload to its handler. Errors are logged here and
    /// returned for the caller's own bookkeeping; none of them is fatal.
    pub fn dispatch(&self, kind: MessageKind, payload: &[u8]) -> Result<(), BrokerError> {
        let result = match kind {
            MessageKind::DirectoryResponse => self.handle_directory_response(payload),
            MessageKind::WriteAck => self.handle_write_ack(payload),
            MessageKind::ValueUpdated => self.handle_value_updated(payload),
        };
        if let Err(e) = &result {
            warn!("Failed to handle {}: {}", kind, e);
        }
        result
    }

    /// Installs a directory response. A waiting [`Broker::bootstrap`] gets
    /// the outcome; without a waiter the response is installed all the same.
    pub fn handle_directory_response(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let outcome = self.install_directory(payload);

        let waiter = lock(&self.inner.bootstrap_waiter).take();
        match waiter {
            Some(waiter) => {
                if let Err(e) = &outcome {
                    warn!("Bootstrap failed: {}", e);
                }
                if waiter.send(outcome).is_err() {
                    debug!("Bootstrap caller stopped waiting before the response");
                }
                Ok(())
            }
            None => outcome,
        }
    }

    fn install_directory(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let response = GetNodesResponse::decode(payload)?;
        if !response.success {
            return Err(BrokerError::RemoteFailure(response.message));
        }

        let fresh = Directory::build(response.result)?;
        let devices = fresh.len();

        let mut directory = write(&self.inner.directory);
        *directory = fresh;
        let pruned = write(&self.inner.observers).retain_keys(|key| directory.contains_value(key));
        drop(directory);

        if pruned > 0 {
            info!("Dropped {} watches on properties that disappeared", pruned);
        }
        info!("Installed device directory with {} devices", devices);
        Ok(())
    }

    /// Completes the write the acknowledgement refers to. Acknowledgements
    /// nobody is waiting for are dropped.
    pub fn handle_write_ack(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let ack = WriteValueResponse::decode(payload)?;
        let result = if ack.success {
            Ok(())
        } else {
            Err(BrokerError::RemoteFailure(ack.message.clone()))
        };

        if !lock(&self.inner.pending).resolve(&ack.value_id, result) {
            debug!("No pending write for acknowledgement of {}", ack.value_id);
        }

        if ack.success {
            Ok(())
        } else {
            Err(BrokerError::RemoteFailure(ack.message))
        }
    }

    /// Decodes a change notification and delivers it to the property's
    /// watchers.
    pub fn handle_value_updated(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let notification = NodeValueUpdate::decode(payload)?;
        let value_key = notification.delta.value_key();
        let value = notification
            .value()
            .ok_or_else(|| BrokerError::SnapshotValueNotFound(value_key.clone()))?;
        let decoded = value.decode()?;

        let node_id = notification.node.id;
        let (key, device_name) = {
            let directory = read(&self.inner.directory);
            let device = directory
                .by_id(node_id)
                .ok_or(BrokerError::UnknownNode(node_id))?;
            (device.value_id(value), device.name().map(str::to_string))
        };

        let update = PropertyUpdate {
            device_id: node_id,
            device_name,
            property: value.property.clone(),
            property_id: value.id.clone(),
            value: decoded,
            received_at: Local::now(),
        };

        let delivery = read(&self.inner.observers).deliver(&key, &update);
        if delivery.closed > 0 {
            let pruned = write(&self.inner.observers).prune_closed(&key);
            debug!("Pruned {} closed watchers of {}", pruned, key);
        }
        if delivery.dropped > 0 {
            debug!("{} watchers of {} were full; update dropped for them", delivery.dropped, key);
        }
        debug!("Update {} = {} delivered to {} watchers", key, update.value, delivery.delivered);
        Ok(())
    }

    /// Summaries of all known devices, ordered by id.
    pub fn devices(&self) -> Vec<DeviceSummary> {
        read(&self.inner.directory)
            .devices()
            .into_iter()
            .map(DeviceSummary::from)
            .collect()
    }

    pub fn device(&self, selector: impl Into<DeviceSelector>) -> Option<Device> {
        read(&self.inner.directory).get(&selector.into()).cloned()
    }

    /// Value of a property as captured by the last bootstrap.
    pub fn property_value(
        &self,
        selector: impl Into<DeviceSelector>,
        property: &str,
    ) -> Result<PropertyValue, BrokerError> {
        let selector = selector.into();
        let directory = read(&self.inner.directory);
        let (_, target) = resolve(&directory, &selector, property)?;
        Ok(target.decode()?)
    }

    pub fn pending_writes(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn observer_count(&self) -> usize {
        read(&self.inner.observers).len()
    }
}

fn resolve<'d>(
    directory: &'d Directory,
    selector: &DeviceSelector,
    property: &str,
) -> Result<(&'d Device, &'d api::Value), BrokerError> {
    let device = directory
        .get(selector)
        .ok_or_else(|| BrokerError::DeviceNotFound(selector.clone()))?;
    let target = device
        .property(property)
        .ok_or_else(|| BrokerError::PropertyNotFound {
            device: selector.to_string(),
            property: property.to_string(),
        })?;
    Ok((device, target))
}

/// Resolves at `deadline`; never resolves when there is none (the timeout
/// was too large to represent).
async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for(
    rx: oneshot::Receiver<Completion>,
    deadline: Option<Instant>,
    timeout: Duration,
    cancel: &CancellationToken,
    on_closed: impl FnOnce() -> BrokerError,
) -> Result<(), BrokerError> {
    tokio::select! {
        biased;
        result = rx => result.unwrap_or_else(|_| Err(on_closed())),
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        _ = expiry(deadline) => Err(BrokerError::Timeout(timeout)),
    }
}

/// Clears the bootstrap waiter when the bootstrap call exits.
struct WaiterGuard<'a>(&'a Mutex<Option<oneshot::Sender<Completion>>>);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

/// Registration returned by [`Broker::watch`].
#[derive(Debug, Clone)]
pub struct WatchHandle {
    inner: Weak<Inner>,
    key: ValueId,
    token: u64,
}

impl WatchHandle {
    pub fn key(&self) -> &ValueId {
        &self.key
    }

    /// Removes this registration. Calling it again, or after the broker is
    /// gone, does nothing.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if write(&inner.observers).remove(&self.key, self.token) {
                debug!("Stopped watching {} (registration {})", self.key, self.token);
            }
        }
    }
}
