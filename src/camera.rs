//! Camera handle management.
//!
//! A [`Camera`] owns one native device reference. Several `Camera` objects may
//! refer to the same physical device (same serial), for example when
//! [`CameraList::get`](crate::discovery::CameraList::get) is called twice for
//! one index. Each object registers itself in the [`HandleRegistry`] under its
//! serial. The first one initializes the device and publishes a
//! [`DeviceSession`]; later aliases join that session without touching the
//! device. Only the last one released for a serial tears the device down.
//!
//! ## Release
//!
//! [`Camera::release`] is idempotent and never fails. It runs from `Drop` as
//! well, on whichever thread drops the last owner. Open and release of one
//! serial are serialized by the registry's per-serial gate, and the "am I the
//! last alias" decision plus the native teardown happen under the live lock,
//! so two aliases can never both tear the device down.
//!
//! [`HandleRegistry`]: crate::registry::HandleRegistry

use crate::acquisition::FrameLedger;
use crate::discovery::CameraList;
use crate::error::{SpinError, SpinResult};
use crate::names::{ChunkNames, NameMap, CHUNK_ENABLE, CHUNK_MODE_ACTIVE, CHUNK_SELECTOR};
use crate::native::{DeviceHandle, NativeDriver, PropertyValue, Status};
use crate::registry::InstanceId;
use crate::system::SystemManager;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport-layer node holding the device serial.
pub const SERIAL_NODE: &str = "DeviceSerialNumber";
/// Transport-layer node holding the model name.
pub const MODEL_NODE: &str = "DeviceModelName";
/// Command node that reboots the device firmware.
pub const RESET_COMMAND: &str = "DeviceReset";

/// Lifecycle of one camera object.
///
/// `Initialized -> (Running <-> Stopped) -> Released`; `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// Opened, not streaming yet.
    Initialized,
    /// Streaming.
    Running,
    /// Streaming ended; may start again.
    Stopped,
    /// Handle given back.
    Released,
}

/// What the first open learned about an initialized device. Shared by every
/// alias of that device until the last one is released.
#[derive(Debug)]
pub(crate) struct DeviceSession {
    model: String,
    names: NameMap,
    chunks: ChunkNames,
    frames: FrameLedger,
}

impl DeviceSession {
    pub(crate) fn frames(&self) -> &FrameLedger {
        &self.frames
    }
}

/// One handle object on a physical camera.
pub struct Camera {
    id: InstanceId,
    handle: AtomicUsize,
    serial: String,
    state: Mutex<CameraState>,
    session: Arc<DeviceSession>,
    manager: Arc<SystemManager>,
}

impl Camera {
    /// Take ownership of the device reference `device` and open it.
    ///
    /// The first instance for a serial de-initializes the device and
    /// initializes it again, so it starts from a clean state regardless of
    /// what happened to it before. An alias joins the live device as it is.
    /// On failure the reference is released.
    pub fn open(manager: &Arc<SystemManager>, device: DeviceHandle) -> SpinResult<Self> {
        let driver = manager.driver().as_ref();
        if !manager.is_initialized() {
            if !device.is_null() {
                release_reference(driver, device, "");
            }
            return Err(not_initialized("system is not initialized"));
        }
        if device.is_null() {
            return Err(SpinError::DeviceInit {
                operation: "camera_open",
                status: Status::INVALID_HANDLE,
            });
        }

        let serial = match driver.get_property(device, SERIAL_NODE) {
            Ok(value) => value.to_string(),
            Err(status) => {
                release_reference(driver, device, "");
                return Err(SpinError::DeviceInit {
                    operation: SERIAL_NODE,
                    status,
                });
            }
        };

        let registry = manager.registry();
        let gate = registry.serial_gate(&serial);
        let _gate = registry.lock_gate(&gate);
        let id = registry.next_instance_id();

        let joined = {
            let mut live = registry.lock_live();
            if !manager.is_initialized() {
                drop(live);
                release_reference(driver, device, &serial);
                return Err(not_initialized("system was released while the camera was opening"));
            }
            live.register(&serial, id);
            live.session(&serial)
        };

        let session = match joined {
            Some(session) => session,
            None => match Self::initialize(driver, device, &serial) {
                Ok(session) => {
                    let session = Arc::new(session);
                    registry.lock_live().set_session(&serial, session.clone());
                    session
                }
                Err(err) => {
                    let mut live = registry.lock_live();
                    live.remove(&serial, id);
                    teardown(driver, device, &serial);
                    manager.retry_deferred_release_locked(&live);
                    return Err(err);
                }
            },
        };

        tracing::info!(
            serial = %serial,
            model = %session.model,
            instance = id,
            aliases = registry.lock_live().count_for(&serial).saturating_sub(1),
            "Camera opened"
        );

        Ok(Self {
            id,
            handle: AtomicUsize::new(device.raw()),
            serial,
            state: Mutex::new(CameraState::Initialized),
            session,
            manager: manager.clone(),
        })
    }

    /// Forced de-init, init, name resolution and chunk activation.
    fn initialize(
        driver: &dyn NativeDriver,
        device: DeviceHandle,
        serial: &str,
    ) -> SpinResult<DeviceSession> {
        if let Err(status) = driver.device_deinit(device) {
            tracing::trace!(serial, %status, "Pre-init de-init ignored");
        }
        driver
            .device_init(device)
            .map_err(|status| SpinError::DeviceInit {
                operation: "device_init",
                status,
            })?;

        let names = NameMap::resolve(|name| driver.get_property(device, name).is_ok());

        let model = match driver.get_property(device, MODEL_NODE) {
            Ok(value) => value.to_string(),
            Err(status) => {
                tracing::debug!(%status, serial, "Model name unavailable");
                String::new()
            }
        };

        if let Err(status) =
            driver.set_property(device, CHUNK_MODE_ACTIVE, &PropertyValue::Bool(true))
        {
            tracing::warn!(%status, serial, "Unable to activate chunk mode");
        }
        let chunks = ChunkNames::activate(|selector| {
            driver
                .set_property(device, CHUNK_SELECTOR, &PropertyValue::Enum(selector.to_string()))
                .and_then(|()| driver.set_property(device, CHUNK_ENABLE, &PropertyValue::Bool(true)))
                .is_ok()
        });

        Ok(DeviceSession {
            model,
            names,
            chunks,
            frames: FrameLedger::default(),
        })
    }

    /// Release this handle object. Idempotent; never fails.
    ///
    /// An alias only gives back its own device reference. When no other live
    /// object shares the serial, frames still held are reclaimed and the
    /// device is stopped, de-initialized and released. That last release also
    /// retries a deferred system release.
    pub fn release(&self) {
        if !self.is_open() {
            return;
        }
        let registry = self.manager.registry();
        let gate = registry.serial_gate(&self.serial);
        let _gate = registry.lock_gate(&gate);
        let mut live = registry.lock_live();
        let raw = self.handle.swap(0, Ordering::AcqRel);
        if raw == 0 {
            return;
        }
        let device = DeviceHandle::from_raw(raw);
        let driver = self.manager.driver().as_ref();
        *self.state.lock() = CameraState::Released;

        if !live.remove(&self.serial, self.id) {
            tracing::warn!(serial = %self.serial, instance = self.id, "Camera was not registered");
        }

        let remaining = live.count_for(&self.serial);
        if remaining > 0 {
            release_reference(driver, device, &self.serial);
            tracing::debug!(
                serial = %self.serial,
                instance = self.id,
                remaining,
                "Alias released, device stays open"
            );
            return;
        }

        reclaim_frames(driver, &self.session.frames, &self.serial);
        teardown(driver, device, &self.serial);
        tracing::info!(serial = %self.serial, instance = self.id, "Camera released");
        self.manager.retry_deferred_release_locked(&live);
    }

    /// Reboot the device firmware.
    ///
    /// This object is released. With `wait`, the device is re-enumerated every
    /// `reset.poll_interval_ms` until the same serial shows up again, and the
    /// new camera object is returned. The first attempt is made one poll
    /// interval after the reset, so the device has time to leave the bus.
    /// `timeout` defaults to `reset.timeout_ms`.
    pub fn reset(&self, wait: bool, timeout: Option<Duration>) -> SpinResult<Option<Camera>> {
        let device = self.device()?;
        self.manager
            .driver()
            .execute_command(device, RESET_COMMAND)
            .map_err(|status| SpinError::native(RESET_COMMAND, status))?;
        tracing::info!(serial = %self.serial, "Device reset issued");
        self.release();

        if !wait {
            return Ok(None);
        }

        let reset_config = &self.manager.config().reset;
        let timeout = timeout.unwrap_or_else(|| reset_config.timeout());
        let poll_interval = reset_config.poll_interval();
        let deadline = Instant::now() + timeout;
        std::thread::sleep(poll_interval.min(timeout));

        loop {
            match CameraList::enumerate(&self.manager).and_then(|list| list.open_serial(&self.serial)) {
                Ok(camera) => {
                    tracing::info!(serial = %self.serial, "Device back after reset");
                    return Ok(Some(camera));
                }
                Err(err) => {
                    tracing::debug!(serial = %self.serial, error = %err, "Device not back yet");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SpinError::Timeout {
                    operation: "reset",
                    waited: Some(timeout),
                });
            }
            std::thread::sleep(poll_interval.min(deadline - now));
        }
    }

    /// Begin streaming.
    pub fn start(&self) -> SpinResult<()> {
        let device = self.device()?;
        self.manager
            .driver()
            .start_stream(device)
            .map_err(|status| SpinError::native("start_stream", status))?;
        self.set_state(CameraState::Running);
        tracing::debug!(serial = %self.serial, "Acquisition started");
        Ok(())
    }

    /// End streaming. Frames already pulled stay valid.
    pub fn stop(&self) -> SpinResult<()> {
        let device = self.device()?;
        self.manager
            .driver()
            .stop_stream(device)
            .map_err(|status| SpinError::native("stop_stream", status))?;
        self.set_state(CameraState::Stopped);
        tracing::debug!(serial = %self.serial, "Acquisition stopped");
        Ok(())
    }

    /// Read a node, going through the firmware name map.
    pub fn get(&self, name: &str) -> SpinResult<PropertyValue> {
        let device = self.device()?;
        let name = self.session.names.get(name);
        self.manager
            .driver()
            .get_property(device, name)
            .map_err(|status| SpinError::native(format!("get {name}"), status))
    }

    /// Write a node, going through the firmware name map.
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> SpinResult<()> {
        let device = self.device()?;
        let name = self.session.names.get(name);
        let value = value.into();
        self.manager
            .driver()
            .set_property(device, name, &value)
            .map_err(|status| SpinError::native(format!("set {name}"), status))
    }

    /// Execute a command node.
    pub fn execute(&self, name: &str) -> SpinResult<()> {
        let device = self.device()?;
        let name = self.session.names.get(name);
        self.manager
            .driver()
            .execute_command(device, name)
            .map_err(|status| SpinError::native(format!("execute {name}"), status))
    }

    /// Device serial, read from the transport layer at open.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Model name, empty if the device did not report one.
    pub fn model(&self) -> &str {
        &self.session.model
    }

    /// Whether this object still holds its device reference.
    pub fn is_open(&self) -> bool {
        self.handle.load(Ordering::Acquire) != 0
    }

    /// Whether this object started acquisition and has not stopped it.
    pub fn is_streaming(&self) -> bool {
        *self.state.lock() == CameraState::Running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CameraState {
        *self.state.lock()
    }

    /// Node name this device answers to for logical `name`.
    pub fn resolved_name<'a>(&self, name: &'a str) -> &'a str {
        self.session.names.get(name)
    }

    /// Chunk selectors enabled on the device.
    pub fn chunks(&self) -> &ChunkNames {
        &self.session.chunks
    }

    /// The manager this camera was opened through.
    pub fn manager(&self) -> &Arc<SystemManager> {
        &self.manager
    }

    /// Frames pulled from this device and not yet given back.
    pub fn outstanding_frames(&self) -> usize {
        self.session.frames.len()
    }

    /// Live device handle, or `ClosedHandle` once released.
    pub(crate) fn device(&self) -> SpinResult<DeviceHandle> {
        match self.handle.load(Ordering::Acquire) {
            0 => Err(SpinError::ClosedHandle { kind: "camera" }),
            raw => Ok(DeviceHandle::from_raw(raw)),
        }
    }

    pub(crate) fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    fn set_state(&self, next: CameraState) {
        let mut state = self.state.lock();
        if *state != CameraState::Released {
            *state = next;
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("serial", &self.serial)
            .field("model", &self.session.model)
            .field("instance", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn not_initialized(reason: &str) -> SpinError {
    SpinError::Initialization {
        operation: "camera_open",
        reason: reason.to_string(),
        status: None,
    }
}

/// Give back one device reference without touching the device.
fn release_reference(driver: &dyn NativeDriver, device: DeviceHandle, serial: &str) {
    if let Err(status) = driver.device_release(device) {
        tracing::warn!(serial, %status, "Device reference release failed");
    }
}

/// Return frames the caller still holds before the device goes away.
fn reclaim_frames(driver: &dyn NativeDriver, frames: &FrameLedger, serial: &str) {
    let reclaimed = frames.close();
    if reclaimed.is_empty() {
        return;
    }
    tracing::warn!(serial, count = reclaimed.len(), "Reclaiming frames still held at release");
    for frame in reclaimed {
        if let Err(status) = driver.frame_release(frame) {
            tracing::debug!(serial, %status, "Reclaimed frame release failed");
        }
    }
}

/// Best-effort stop, de-init and release. Failures are logged, never returned.
fn teardown(driver: &dyn NativeDriver, device: DeviceHandle, serial: &str) {
    if let Err(status) = driver.stop_stream(device) {
        tracing::debug!(serial, %status, "Stop during teardown ignored");
    }
    if let Err(status) = driver.device_deinit(device) {
        tracing::warn!(serial, %status, "Device de-init failed during release");
    }
    if let Err(status) = driver.device_release(device) {
        tracing::warn!(serial, %status, "Device release failed during release");
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::native::mock::{MockDevice, MockDriver};
    use crate::native::Status;
    use tracing_test::traced_test;

    fn setup(serials: &[&str]) -> (Arc<MockDriver>, Arc<SystemManager>) {
        let driver = Arc::new(MockDriver::with_devices(
            serials.iter().map(|s| MockDevice::new(*s, "Blackfly S BFS-U3-16S2M")),
        ));
        let manager = SystemManager::with_defaults(driver.clone());
        (driver, manager)
    }

    #[test]
    fn open_requires_initialized_system() {
        let (_driver, manager) = setup(&["S1"]);
        let err = Camera::open(&manager, DeviceHandle::from_raw(1)).unwrap_err();
        assert!(matches!(err, SpinError::Initialization { .. }));
    }

    #[test]
    fn open_rejects_null_handle() {
        let (_driver, manager) = setup(&["S1"]);
        manager.acquire().unwrap();
        let err = Camera::open(&manager, DeviceHandle::NULL).unwrap_err();
        assert!(matches!(err, SpinError::DeviceInit { .. }));
    }

    #[test]
    fn open_forces_deinit_then_init() {
        let (driver, manager) = setup(&["S1"]);
        let list = CameraList::enumerate(&manager).unwrap();
        let camera = list.get(0).unwrap();
        assert_eq!(camera.serial(), "S1");
        assert_eq!(camera.model(), "Blackfly S BFS-U3-16S2M");
        assert_eq!(camera.state(), CameraState::Initialized);
        let calls = driver.calls();
        assert_eq!(calls.device_deinit, 1);
        assert_eq!(calls.device_init, 1);
    }

    #[test]
    fn alias_joins_session_without_reinit() {
        let (driver, manager) = setup(&["S1"]);
        let list = CameraList::enumerate(&manager).unwrap();
        let first = list.get(0).unwrap();
        first.set("ExposureTime", 5000.0).unwrap();
        let alias = list.get(0).unwrap();

        let calls = driver.calls();
        assert_eq!(calls.device_deinit, 1);
        assert_eq!(calls.device_init, 1);
        assert!(Arc::ptr_eq(first.session(), alias.session()));
        assert_eq!(alias.model(), first.model());

        drop(first);
        assert_eq!(driver.calls().device_deinit, 1);
        assert_eq!(driver.references("S1"), 1);
        assert!(alias.get("ExposureTime").is_ok());
    }

    #[test]
    fn init_failure_under_parked_system_completes_release() {
        let (driver, manager) = setup(&["S1"]);
        let list = CameraList::enumerate(&manager).unwrap();
        manager.release_current();
        driver.inject_failure("device_init", Status::IO, 1);
        assert!(list.get(0).is_err());
        assert_eq!(driver.outstanding_references(), 0);
        assert!(manager.has_deferred_release());

        drop(list);
        assert!(!driver.system_live());
        assert_eq!(driver.violations().total(), 0);
    }

    #[test]
    fn init_failure_is_device_init_error() {
        let (driver, manager) = setup(&["S1"]);
        let list = CameraList::enumerate(&manager).unwrap();
        driver.inject_failure("device_init", Status::ACCESS_DENIED, 1);
        match list.get(0) {
            Err(SpinError::DeviceInit { status, .. }) => assert_eq!(status, Status::ACCESS_DENIED),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.live_cameras(), 0);
    }

    #[test]
    fn operations_after_release_fail_closed() {
        let (_driver, manager) = setup(&["S1"]);
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();
        camera.release();
        assert!(!camera.is_open());
        assert_eq!(camera.state(), CameraState::Released);
        assert!(matches!(
            camera.get("ExposureTime"),
            Err(SpinError::ClosedHandle { kind: "camera" })
        ));
        assert!(matches!(camera.start(), Err(SpinError::ClosedHandle { .. })));
        assert!(matches!(
            camera.reset(false, None),
            Err(SpinError::ClosedHandle { .. })
        ));
    }

    #[test]
    fn start_stop_transitions() {
        let (_driver, manager) = setup(&["S1"]);
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();
        camera.start().unwrap();
        assert!(camera.is_streaming());
        camera.stop().unwrap();
        assert_eq!(camera.state(), CameraState::Stopped);
        camera.start().unwrap();
        assert_eq!(camera.state(), CameraState::Running);
    }

    #[test]
    fn properties_go_through_name_map() {
        let driver = Arc::new(MockDriver::with_devices([MockDevice::new("S1", "BFLY")
            .hide_property("GammaEnable")
            .with_property("GammaEnabled", PropertyValue::Bool(false))]));
        let manager = SystemManager::with_defaults(driver.clone());
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();

        assert_eq!(camera.resolved_name("GammaEnable"), "GammaEnabled");
        camera.set("GammaEnable", true).unwrap();
        assert_eq!(camera.get("GammaEnable").unwrap(), PropertyValue::Bool(true));
        assert_eq!(
            driver.property("S1", "GammaEnabled"),
            Some(PropertyValue::Bool(true))
        );
    }

    #[test]
    fn resource_in_use_surfaces_distinctly() {
        let (driver, manager) = setup(&["S1"]);
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();
        driver.inject_failure("get_property", Status::RESOURCE_IN_USE, 1);
        let err = camera.get("ExposureTime").unwrap_err();
        assert!(err.is_resource_in_use());
        assert!(camera.get("ExposureTime").is_ok());
    }

    #[test]
    #[traced_test]
    fn missing_chunks_warn_and_open_anyway() {
        let driver = Arc::new(MockDriver::with_devices([
            MockDevice::new("S1", "BFLY").with_chunk_selectors(&["ExposureTime"])
        ]));
        let manager = SystemManager::with_defaults(driver.clone());
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();

        assert!(camera.chunks().is_active(crate::names::ChunkKind::ExposureTime));
        assert!(!camera.chunks().is_active(crate::names::ChunkKind::FrameId));
        assert!(logs_contain("Unable to enable chunk data"));
        assert_eq!(driver.enabled_chunks("S1"), vec!["ExposureTime".to_string()]);
    }

    #[test]
    #[traced_test]
    fn alias_release_is_logged_without_teardown() {
        let (driver, manager) = setup(&["S1"]);
        let list = CameraList::enumerate(&manager).unwrap();
        let a = list.get(0).unwrap();
        let b = list.get(0).unwrap();
        a.release();
        assert!(logs_contain("Alias released, device stays open"));
        assert_eq!(driver.teardowns("S1"), 0);
        drop(b);
        assert!(logs_contain("Camera released"));
    }

    #[test]
    #[traced_test]
    fn held_frames_are_reclaimed_at_release() {
        let (driver, manager) = setup(&["S1"]);
        let camera = CameraList::enumerate(&manager).unwrap().get(0).unwrap();
        camera.start().unwrap();
        let frame = camera.pull_frame(crate::Wait::from_millis(100)).unwrap();

        camera.release();
        assert!(logs_contain("Reclaiming frames still held at release"));
        assert_eq!(driver.outstanding_frames(), 0);
        assert_eq!(camera.outstanding_frames(), 0);

        drop(frame);
        assert!(logs_contain("Frame was reclaimed at camera release"));
        assert_eq!(driver.violations().released_frame_use, 0);
    }
}
