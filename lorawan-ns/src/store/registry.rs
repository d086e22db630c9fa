//! Device registry
//!
//! Devices are keyed by `application.device` and indexed by EUIs and by
//! session DevAddr. Writes go through [`set_by_id`]: the transaction body
//! gets the current record and returns the fields it changed, which the
//! registry projects onto the stored record if nothing else wrote it in the
//! meantime.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::device::{DevAddr, Eui64};
use crate::device::{EndDevice, FieldPath};
use crate::error::{Error, ErrorKind, Reason, Result};

/// Stored device with its write version
pub type Versioned = (EndDevice, u64);

/// Device registry backend
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Device by `application.device` identifier
    async fn get_by_id(&self, uid: &str) -> Result<Option<Versioned>>;

    /// Device by JoinEUI and DevEUI
    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<Option<EndDevice>>;

    /// Devices whose session or pending session uses `dev_addr`
    async fn range_by_dev_addr(&self, dev_addr: DevAddr) -> Result<Vec<EndDevice>>;

    /// Create a device; fails with `AlreadyExists` if the identifier is taken
    async fn create(&self, device: EndDevice) -> Result<()>;

    /// Project `paths` of `device` onto the stored record
    ///
    /// Fails with `Aborted` if the stored version is not `version`.
    async fn commit(
        &self,
        uid: &str,
        version: u64,
        device: &EndDevice,
        paths: &[FieldPath],
    ) -> Result<u64>;
}

/// Result of a transaction body
#[derive(Debug)]
pub struct TxBody<T> {
    /// Updated device; `None` leaves the record untouched
    pub device: Option<EndDevice>,
    /// Fields of `device` to write
    pub paths: Vec<FieldPath>,
    /// Value returned to the caller
    pub value: T,
}

impl<T> TxBody<T> {
    /// Body that writes nothing
    pub fn read_only(value: T) -> Self {
        Self {
            device: None,
            paths: Vec::new(),
            value,
        }
    }

    /// Body that writes `paths` of `device`
    pub fn write(device: EndDevice, paths: Vec<FieldPath>, value: T) -> Self {
        Self {
            device: Some(device),
            paths,
            value,
        }
    }
}

/// Read-modify-write a device
///
/// `f` receives the stored device, or `None` if it does not exist. When the
/// write conflicts with a concurrent one, `f` runs once more against the
/// fresh record; a second conflict fails with `OutdatedData`.
pub async fn set_by_id<T, F, Fut>(registry: &dyn DeviceRegistry, uid: &str, mut f: F) -> Result<T>
where
    F: FnMut(Option<EndDevice>) -> Fut,
    Fut: Future<Output = Result<TxBody<T>>>,
{
    for attempt in 0..2 {
        let stored = registry.get_by_id(uid).await?;
        let version = stored.as_ref().map(|(_, v)| *v);
        let body = f(stored.map(|(dev, _)| dev)).await?;
        let (Some(device), false) = (body.device, body.paths.is_empty()) else {
            return Ok(body.value);
        };
        let result = match version {
            Some(version) => registry.commit(uid, version, &device, &body.paths).await,
            None => registry.create(device).await.map(|_| 0),
        };
        match result {
            Ok(_) => return Ok(body.value),
            Err(err) if err.kind() == ErrorKind::Aborted && attempt == 0 => {
                debug!(dev_uid = uid, "Registry conflict, retrying transaction");
            }
            Err(err) if err.kind() == ErrorKind::Aborted => break,
            Err(err) => return Err(err),
        }
    }
    Err(Error::outdated_data())
}

/// In-memory device registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<HashMap<String, Versioned>>,
}

impl MemoryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn get_by_id(&self, uid: &str) -> Result<Option<Versioned>> {
        Ok(self.devices.read().await.get(uid).cloned())
    }

    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<Option<EndDevice>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .find(|(dev, _)| dev.ids.join_eui == Some(join_eui) && dev.ids.dev_eui == Some(dev_eui))
            .map(|(dev, _)| dev.clone()))
    }

    async fn range_by_dev_addr(&self, dev_addr: DevAddr) -> Result<Vec<EndDevice>> {
        let uses = |dev: &EndDevice| {
            dev.session.as_ref().is_some_and(|s| s.dev_addr == dev_addr)
                || dev
                    .pending_session
                    .as_ref()
                    .is_some_and(|s| s.dev_addr == dev_addr)
        };
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|(dev, _)| uses(dev))
            .map(|(dev, _)| dev.clone())
            .collect())
    }

    async fn create(&self, device: EndDevice) -> Result<()> {
        let uid = device.uid();
        let mut devices = self.devices.write().await;
        if devices.contains_key(&uid) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                Reason::Store,
                format!("device `{uid}` already exists"),
            ));
        }
        devices.insert(uid, (device, 1));
        Ok(())
    }

    async fn commit(
        &self,
        uid: &str,
        version: u64,
        device: &EndDevice,
        paths: &[FieldPath],
    ) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let Some((stored, stored_version)) = devices.get_mut(uid) else {
            return Err(Error::not_found(
                Reason::DeviceNotFound,
                format!("device `{uid}` not found"),
            ));
        };
        if *stored_version != version {
            return Err(Error::new(
                ErrorKind::Aborted,
                Reason::OutdatedData,
                format!("device `{uid}` was modified concurrently"),
            ));
        }
        stored.apply_paths(device, paths);
        *stored_version += 1;
        Ok(*stored_version)
    }
}
