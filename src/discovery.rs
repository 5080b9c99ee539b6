//! Camera enumeration.
//!
//! [`CameraList`] is a snapshot of the devices attached when
//! [`CameraList::enumerate`] ran. Indexing takes a fresh device reference and
//! opens a new [`Camera`] on it; asking for the same index twice gives two
//! aliasing handle objects on one device. Serial lookups borrow a reference
//! and give it straight back.

use crate::camera::{Camera, SERIAL_NODE};
use crate::error::{SpinError, SpinResult};
use crate::native::{CameraListHandle, DeviceHandle};
use crate::system::SystemManager;
use std::fmt;
use std::sync::Arc;

/// Devices attached at enumeration time.
///
/// A live list keeps the system instance alive: releasing the system while a
/// list exists is deferred until the list is dropped.
pub struct CameraList {
    manager: Arc<SystemManager>,
    list: CameraListHandle,
    len: usize,
}

impl CameraList {
    /// Acquire the system (creating it on first use) and list attached devices.
    pub fn enumerate(manager: &Arc<SystemManager>) -> SpinResult<Self> {
        let system = manager.acquire()?;
        {
            let mut live = manager.registry().lock_live();
            if system.is_closed() {
                return Err(SpinError::Initialization {
                    operation: "camera_list",
                    reason: "system was released during enumeration".to_string(),
                    status: None,
                });
            }
            live.open_list();
        }

        let driver = manager.driver();
        let snapshot = system.handle().and_then(|handle| {
            driver
                .camera_list(handle)
                .map_err(|status| SpinError::native("camera_list", status))
        });
        let listed = snapshot.and_then(|list| match driver.camera_list_len(list) {
            Ok(len) => Ok((list, len)),
            Err(status) => {
                if let Err(status) = driver.camera_list_release(list) {
                    tracing::debug!(%status, "Camera list release failed");
                }
                Err(SpinError::native("camera_list_len", status))
            }
        });

        match listed {
            Ok((list, len)) => {
                tracing::debug!(count = len, "Enumerated cameras");
                Ok(Self {
                    manager: manager.clone(),
                    list,
                    len,
                })
            }
            Err(err) => {
                let mut live = manager.registry().lock_live();
                live.close_list();
                manager.retry_deferred_release_locked(&live);
                Err(err)
            }
        }
    }

    /// Number of devices in the snapshot.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no device was attached.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Open the device at `index`. Each call takes a new device reference.
    pub fn get(&self, index: usize) -> SpinResult<Camera> {
        Camera::open(&self.manager, self.reference(index)?)
    }

    /// Serial of the device at `index`, read from the transport layer
    /// without initializing the device.
    pub fn serial(&self, index: usize) -> SpinResult<String> {
        let device = self.reference(index)?;
        let driver = self.manager.driver();
        let serial = driver
            .get_property(device, SERIAL_NODE)
            .map(|value| value.to_string())
            .map_err(|status| SpinError::native(SERIAL_NODE, status));
        if let Err(status) = driver.device_release(device) {
            tracing::warn!(index, %status, "Device reference release failed");
        }
        serial
    }

    /// Serials of every listed device, in index order. Devices whose serial
    /// cannot be read are skipped.
    pub fn serials(&self) -> Vec<String> {
        (0..self.len())
            .filter_map(|index| match self.serial(index) {
                Ok(serial) => Some(serial),
                Err(err) => {
                    tracing::debug!(index, error = %err, "Skipping device with unreadable serial");
                    None
                }
            })
            .collect()
    }

    /// Index of the device with `serial`.
    pub fn find(&self, serial: &str) -> Option<usize> {
        (0..self.len()).find(|index| self.serial(*index).is_ok_and(|s| s == serial))
    }

    /// Open the device with `serial`.
    pub fn open_serial(&self, serial: &str) -> SpinResult<Camera> {
        let index = self
            .find(serial)
            .ok_or_else(|| SpinError::InvalidArgument(format!("no camera with serial {serial}")))?;
        self.get(index)
    }

    /// Open every listed device in turn.
    pub fn cameras(&self) -> impl Iterator<Item = SpinResult<Camera>> + '_ {
        (0..self.len()).map(move |index| self.get(index))
    }

    /// Manager this list was enumerated from.
    pub fn manager(&self) -> &Arc<SystemManager> {
        &self.manager
    }

    fn reference(&self, index: usize) -> SpinResult<DeviceHandle> {
        if index >= self.len {
            return Err(SpinError::InvalidArgument(format!(
                "camera index {index} out of range ({} attached)",
                self.len
            )));
        }
        self.manager
            .driver()
            .camera_list_get(self.list, index)
            .map_err(|status| SpinError::native("camera_list_get", status))
    }
}

impl Drop for CameraList {
    fn drop(&mut self) {
        if let Err(status) = self.manager.driver().camera_list_release(self.list) {
            tracing::warn!(%status, "Camera list release failed");
        }
        let mut live = self.manager.registry().lock_live();
        live.close_list();
        self.manager.retry_deferred_release_locked(&live);
    }
}

impl fmt::Debug for CameraList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraList").field("len", &self.len).finish()
    }
}
