//! System handle management.
//!
//! The driver exposes one process-wide system instance. Every camera handle and
//! camera list is derived from it, and the driver refuses to release the
//! system while any of them is still held. Release may be requested at any
//! moment (explicitly or from `Drop`), so [`SystemManager::release`] parks the
//! system in the registry's deferred slot while cameras or lists are live. The
//! release that empties the registry retries the parked release.
//!
//! The manager is the injected service object: it owns the driver, the
//! [`HandleRegistry`] and the configuration, and every camera keeps an `Arc` to
//! it.

use crate::config::DriverConfig;
use crate::error::{SpinError, SpinResult};
use crate::native::{NativeDriver, SystemHandle};
use crate::registry::{HandleRegistry, LiveInstances};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The process-wide system instance.
///
/// Holds the raw handle; `0` means closed.
pub struct System {
    handle: AtomicUsize,
}

impl System {
    fn new(handle: SystemHandle) -> Self {
        Self {
            handle: AtomicUsize::new(handle.raw()),
        }
    }

    /// Native handle, or `ClosedHandle` once released.
    pub fn handle(&self) -> SpinResult<SystemHandle> {
        match self.handle.load(Ordering::Acquire) {
            0 => Err(SpinError::ClosedHandle { kind: "system" }),
            raw => Ok(SystemHandle::from_raw(raw)),
        }
    }

    /// Whether the native instance has been released.
    pub fn is_closed(&self) -> bool {
        self.handle.load(Ordering::Acquire) == 0
    }

    /// Claim the handle for teardown. Only one caller ever gets `Some`.
    fn take(&self) -> Option<SystemHandle> {
        match self.handle.swap(0, Ordering::AcqRel) {
            0 => None,
            raw => Some(SystemHandle::from_raw(raw)),
        }
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("handle", &format_args!("{:#x}", self.handle.load(Ordering::Relaxed)))
            .finish()
    }
}

/// Owner of the system singleton and of the handle registry.
pub struct SystemManager {
    driver: Arc<dyn NativeDriver>,
    registry: HandleRegistry,
    current: Mutex<Option<Arc<System>>>,
    config: DriverConfig,
}

impl SystemManager {
    /// Manager over `driver`. No system instance is created until
    /// [`acquire`](Self::acquire).
    pub fn new(driver: Arc<dyn NativeDriver>, config: DriverConfig) -> Arc<Self> {
        tracing::debug!(driver = driver.name(), "Creating system manager");
        Arc::new(Self {
            registry: HandleRegistry::new(&config.registry),
            driver,
            current: Mutex::new(None),
            config,
        })
    }

    /// [`new`](Self::new) with [`DriverConfig::default`].
    pub fn with_defaults(driver: Arc<dyn NativeDriver>) -> Arc<Self> {
        Self::new(driver, DriverConfig::default())
    }

    /// The native driver every handle goes through.
    pub fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    /// Live-instance bookkeeping.
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Return the system singleton, creating it on first use.
    ///
    /// A system parked for deferred release is handed out again and its
    /// pending release is cancelled.
    pub fn acquire(&self) -> SpinResult<Arc<System>> {
        let mut current = self.current.lock();

        if let Some(system) = current.as_ref().filter(|s| !s.is_closed()) {
            let mut deferred = self.registry.lock_deferred();
            if deferred.as_ref().is_some_and(|parked| Arc::ptr_eq(parked, system)) {
                *deferred = None;
                tracing::debug!("Cancelled deferred system release");
            }
            return Ok(system.clone());
        }

        let handle = self
            .driver
            .system_get_instance()
            .map_err(|status| SpinError::Initialization {
                operation: "system_get_instance",
                reason: format!("driver returned {status}"),
                status: Some(status),
            })?;
        if handle.is_null() {
            return Err(SpinError::Initialization {
                operation: "system_get_instance",
                reason: "driver returned a null system handle".to_string(),
                status: None,
            });
        }

        tracing::info!(driver = self.driver.name(), "System instance acquired");
        let system = Arc::new(System::new(handle));
        *current = Some(system.clone());
        Ok(system)
    }

    /// Whether a system instance exists and is open.
    pub fn is_initialized(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Release `system`, or park it until the last camera is released.
    ///
    /// Idempotent; never fails. Native release errors are logged.
    pub fn release(&self, system: &Arc<System>) {
        if system.is_closed() {
            return;
        }

        let live = self.registry.lock_live();
        if live.holds_system() {
            let mut deferred = self.registry.lock_deferred();
            if let Some(previous) = deferred.replace(system.clone()) {
                if !Arc::ptr_eq(&previous, system) && !previous.is_closed() {
                    tracing::warn!(?previous, "Replacing a different parked system");
                }
            }
            tracing::debug!(
                live_cameras = live.len(),
                open_lists = live.lists(),
                "Cameras still live, deferring system release"
            );
            return;
        }

        // Closing under the live lock keeps cameras from registering mid-release.
        self.close(system);
        drop(live);
    }

    /// Release the current singleton, if any.
    pub fn release_current(&self) {
        let current = self.current.lock().clone();
        if let Some(system) = current {
            self.release(&system);
        }
    }

    /// Retry a parked release; no-op while cameras or lists are live.
    pub fn retry_deferred_release(&self) {
        let live = self.registry.lock_live();
        self.retry_deferred_release_locked(&live);
    }

    /// Body of [`retry_deferred_release`](Self::retry_deferred_release) for
    /// callers that already hold the live lock.
    pub(crate) fn retry_deferred_release_locked(&self, live: &LiveInstances) {
        if live.holds_system() {
            return;
        }
        let parked = self.registry.lock_deferred().take();
        if let Some(system) = parked {
            tracing::debug!("Last dependent released, retrying deferred system release");
            self.close(&system);
        }
    }

    /// Whether a system release is parked until the last dependent goes.
    pub fn has_deferred_release(&self) -> bool {
        self.registry.has_deferred_system()
    }

    /// Number of live camera instances across all serials.
    pub fn live_cameras(&self) -> usize {
        self.registry.live_count()
    }

    fn close(&self, system: &System) {
        let Some(handle) = system.take() else {
            return;
        };
        match self.driver.system_release_instance(handle) {
            Ok(()) => tracing::info!("System instance released"),
            Err(status) => tracing::warn!(%status, "System release failed, marking closed"),
        }
    }
}

impl fmt::Debug for SystemManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemManager")
            .field("driver", &self.driver.name())
            .field("current", &*self.current.lock())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Drop for SystemManager {
    fn drop(&mut self) {
        self.release_current();
    }
}
