//! Simulated Spinnaker driver.
//!
//! `MockDriver` behaves like the vendor driver where the lifecycle layer cares:
//! - one refcounted system instance, which refuses release while any device is
//!   initialized (`RESOURCE_IN_USE`);
//! - camera lists hand out a fresh device reference on every access, and the
//!   system cannot be released while lists or references are outstanding;
//! - `DeviceReset` takes the device offline for a while and invalidates every
//!   handle to it;
//! - frames come from an explicit queue or a generated test pattern.
//!
//! Every call is counted, and protocol violations (system released under a
//! live device or outstanding references, calls on released handles) are
//! recorded so tests can assert that none happened. Failures can be injected
//! per operation.

pub mod pattern;

use super::{
    CameraListHandle, DeviceHandle, FrameHandle, FrameInfo, ImageFileFormat, NativeDriver, NativeResult,
    PixelFormat, PropertyValue, Status, SystemHandle,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

/// Transport-layer nodes readable without `device_init`.
const TRANSPORT_NODES: &[&str] = &["DeviceSerialNumber", "DeviceModelName"];

/// Where a streaming device gets its frames from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// A fresh test pattern whenever the queue is empty.
    Pattern,
    /// Only frames pushed with [`MockDriver::push_frame`].
    Queue,
}

/// Description of one simulated camera.
#[derive(Debug, Clone)]
pub struct MockDevice {
    serial: String,
    model: String,
    properties: HashMap<String, PropertyValue>,
    hidden: HashSet<String>,
    chunk_selectors: Vec<String>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    frame_source: FrameSource,
    reset_downtime: Duration,
}

impl MockDevice {
    /// Camera with default nodes, chunk selectors and a 50 ms reset downtime.
    pub fn new(serial: impl Into<String>, model: impl Into<String>) -> Self {
        let serial = serial.into();
        let model = model.into();
        let mut properties = HashMap::new();
        let defaults = [
            ("DeviceSerialNumber", PropertyValue::Str(serial.clone())),
            ("DeviceModelName", PropertyValue::Str(model.clone())),
            ("DeviceTemperature", PropertyValue::Float(41.5)),
            ("ExposureTime", PropertyValue::Float(10_000.0)),
            ("ExposureAuto", PropertyValue::Enum("Off".to_string())),
            ("Gain", PropertyValue::Float(0.0)),
            ("GainAuto", PropertyValue::Enum("Off".to_string())),
            ("AcquisitionFrameRateEnable", PropertyValue::Bool(false)),
            ("AcquisitionFrameRate", PropertyValue::Float(30.0)),
            ("GammaEnable", PropertyValue::Bool(false)),
            ("Gamma", PropertyValue::Float(1.0)),
            ("TriggerMode", PropertyValue::Enum("Off".to_string())),
            ("ChunkModeActive", PropertyValue::Bool(false)),
            ("ChunkSelector", PropertyValue::Enum("FrameID".to_string())),
            ("ChunkEnable", PropertyValue::Bool(false)),
        ];
        for (name, value) in defaults {
            properties.insert(name.to_string(), value);
        }

        let mut device = Self {
            serial,
            model,
            properties,
            hidden: HashSet::new(),
            chunk_selectors: ["FrameID", "ExposureTime", "Timestamp"]
                .into_iter()
                .map(String::from)
                .collect(),
            width: 64,
            height: 48,
            pixel_format: PixelFormat::Mono8,
            frame_source: FrameSource::Pattern,
            reset_downtime: Duration::from_millis(50),
        };
        device.sync_geometry();
        device
    }

    /// Add or override a node.
    pub fn with_property(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// Make `name` unreadable and unwritable, like firmware that lacks it.
    pub fn hide_property(mut self, name: &str) -> Self {
        self.hidden.insert(name.to_string());
        self
    }

    /// Selector entries `ChunkSelector` accepts.
    pub fn with_chunk_selectors(mut self, selectors: &[&str]) -> Self {
        self.chunk_selectors = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Frame size and format of generated frames.
    pub fn with_geometry(mut self, width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.pixel_format = pixel_format;
        self.sync_geometry();
        self
    }

    /// Where frames come from.
    pub fn with_frame_source(mut self, source: FrameSource) -> Self {
        self.frame_source = source;
        self
    }

    /// How long the device stays off the bus after `DeviceReset`.
    pub fn with_reset_downtime(mut self, downtime: Duration) -> Self {
        self.reset_downtime = downtime;
        self
    }

    /// Serial the device reports.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn sync_geometry(&mut self) {
        self.properties
            .insert("Width".to_string(), PropertyValue::Int(i64::from(self.width)));
        self.properties
            .insert("Height".to_string(), PropertyValue::Int(i64::from(self.height)));
        self.properties.insert(
            "PixelFormat".to_string(),
            PropertyValue::Enum(self.pixel_format.symbolic().to_string()),
        );
    }
}

/// A frame queued for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct MockFrame {
    /// Buffer pixel format.
    pub pixel_format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw buffer bytes.
    pub data: Vec<u8>,
    /// `Some(image_status)` delivers the frame as incomplete.
    pub incomplete: Option<i32>,
}

impl MockFrame {
    /// Complete frame carrying `data`.
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            pixel_format,
            width,
            height,
            data,
            incomplete: None,
        }
    }

    /// Every sample set to raw `value`.
    pub fn uniform(pixel_format: PixelFormat, width: u32, height: u32, value: u16) -> Self {
        Self::new(
            pixel_format,
            width,
            height,
            pattern::uniform(pixel_format, width, height, value),
        )
    }

    /// A truncated frame reporting `image_status`.
    pub fn incomplete(image_status: i32) -> Self {
        Self {
            incomplete: Some(image_status),
            ..Self::uniform(PixelFormat::Mono8, 4, 4, 0)
        }
    }
}

/// Call counters, one field per driver operation of the same name.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub system_get_instance: u64,
    pub system_release_instance: u64,
    pub camera_list: u64,
    pub camera_list_release: u64,
    pub device_init: u64,
    pub device_deinit: u64,
    pub device_release: u64,
    pub start_stream: u64,
    pub stop_stream: u64,
    pub execute_command: u64,
    pub get_next_frame: u64,
    pub frame_release: u64,
    pub frame_save: u64,
}

/// Protocol violations observed by the simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockViolations {
    /// System release attempted while a device was initialized.
    pub system_released_with_live_devices: u64,
    /// System release attempted while camera lists or device references
    /// were still held.
    pub system_released_with_references: u64,
    /// Calls on device handles after `device_release`.
    pub released_device_handle_use: u64,
    /// Calls on frames after `frame_release`.
    pub released_frame_use: u64,
}

impl MockViolations {
    /// Sum of every counter.
    pub fn total(&self) -> u64 {
        self.system_released_with_live_devices
            + self.system_released_with_references
            + self.released_device_handle_use
            + self.released_frame_use
    }
}

#[derive(Debug)]
struct DeviceState {
    template: MockDevice,
    initialized: bool,
    streaming: bool,
    generation: u64,
    offline_until: Option<Instant>,
    selected_chunk: String,
    enabled_chunks: HashSet<String>,
    queue: VecDeque<MockFrame>,
    frame_counter: u64,
    deinits: u64,
    teardowns: u64,
}

#[derive(Debug)]
struct HandleEntry {
    device: usize,
    generation: u64,
    released: bool,
}

#[derive(Debug)]
struct FrameEntry {
    frame: MockFrame,
    frame_id: u64,
    timestamp_ns: u64,
    exposure_us: f64,
}

#[derive(Debug, Clone, Copy)]
struct Injected {
    status: Status,
    remaining: u32,
}

#[derive(Debug, Default)]
struct State {
    system: Option<(usize, u32)>,
    devices: Vec<DeviceState>,
    handles: HashMap<usize, HandleEntry>,
    lists: HashMap<usize, Vec<(usize, u64)>>,
    frames: HashMap<usize, FrameEntry>,
    released_frames: HashSet<usize>,
    next_handle: usize,
    calls: MockCalls,
    violations: MockViolations,
    failures: HashMap<&'static str, Injected>,
}

impl State {
    fn next_handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    /// Consume one injected failure for `operation`, if armed.
    fn check(&mut self, operation: &'static str) -> NativeResult<()> {
        let Some(injected) = self.failures.get_mut(operation) else {
            return Ok(());
        };
        let status = injected.status;
        injected.remaining = injected.remaining.saturating_sub(1);
        if injected.remaining == 0 {
            self.failures.remove(operation);
        }
        tracing::debug!(operation, %status, "Injected mock failure");
        Err(status)
    }

    /// Device index behind a live handle of the current generation.
    fn device_index(&mut self, handle: DeviceHandle) -> NativeResult<usize> {
        let Some(entry) = self.handles.get(&handle.raw()) else {
            return Err(Status::INVALID_HANDLE);
        };
        if entry.released {
            self.violations.released_device_handle_use += 1;
            return Err(Status::INVALID_HANDLE);
        }
        let index = entry.device;
        if self.devices[index].generation != entry.generation {
            return Err(Status::INVALID_HANDLE);
        }
        Ok(index)
    }

    fn outstanding_references(&self) -> usize {
        self.handles.values().filter(|entry| !entry.released).count()
    }

    fn initialized_device(&mut self, handle: DeviceHandle) -> NativeResult<&mut DeviceState> {
        let index = self.device_index(handle)?;
        let device = &mut self.devices[index];
        if !device.initialized {
            return Err(Status::NOT_INITIALIZED);
        }
        Ok(device)
    }

    fn frame(&mut self, handle: FrameHandle) -> NativeResult<&FrameEntry> {
        if self.released_frames.contains(&handle.raw()) {
            self.violations.released_frame_use += 1;
            return Err(Status::INVALID_HANDLE);
        }
        self.frames.get(&handle.raw()).ok_or(Status::INVALID_HANDLE)
    }

    fn device_by_serial(&self, serial: &str) -> Option<&DeviceState> {
        self.devices.iter().find(|d| d.template.serial == serial)
    }

    fn device_by_serial_mut(&mut self, serial: &str) -> Option<&mut DeviceState> {
        self.devices.iter_mut().find(|d| d.template.serial == serial)
    }
}

/// In-process [`NativeDriver`].
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<State>,
    frame_ready: Condvar,
}

impl MockDriver {
    /// A driver with one Blackfly S attached.
    pub fn new() -> Self {
        Self::with_devices([MockDevice::new("20270803", "Blackfly S BFS-U3-16S2M")])
    }

    /// Driver with `devices` attached.
    pub fn with_devices(devices: impl IntoIterator<Item = MockDevice>) -> Self {
        let driver = Self::default();
        for device in devices {
            driver.attach(device);
        }
        driver
    }

    /// Plug a device in.
    pub fn attach(&self, template: MockDevice) {
        let mut state = self.state.lock();
        state.devices.push(DeviceState {
            template,
            initialized: false,
            streaming: false,
            generation: 0,
            offline_until: None,
            selected_chunk: "FrameID".to_string(),
            enabled_chunks: HashSet::new(),
            queue: VecDeque::new(),
            frame_counter: 0,
            deinits: 0,
            teardowns: 0,
        });
    }

    /// Fail the next `count` calls of `operation` (a `NativeDriver` method
    /// name) with `status`.
    pub fn inject_failure(&self, operation: &'static str, status: Status, count: u32) {
        if count == 0 {
            return;
        }
        self.state.lock().failures.insert(
            operation,
            Injected {
                status,
                remaining: count,
            },
        );
    }

    /// Disarm every injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Queue a frame for `serial`; wakes blocked `get_next_frame` calls.
    pub fn push_frame(&self, serial: &str, frame: MockFrame) -> bool {
        let mut state = self.state.lock();
        let Some(device) = state.device_by_serial_mut(serial) else {
            return false;
        };
        device.queue.push_back(frame);
        drop(state);
        self.frame_ready.notify_all();
        true
    }

    /// Switch where `serial` gets frames from.
    pub fn set_frame_source(&self, serial: &str, source: FrameSource) {
        if let Some(device) = self.state.lock().device_by_serial_mut(serial) {
            device.template.frame_source = source;
        }
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> MockCalls {
        self.state.lock().calls
    }

    /// Snapshot of the violation counters.
    pub fn violations(&self) -> MockViolations {
        self.state.lock().violations
    }

    /// De-inits that took `serial` out of the initialized state.
    pub fn teardowns(&self, serial: &str) -> u64 {
        self.state
            .lock()
            .device_by_serial(serial)
            .map_or(0, |d| d.teardowns)
    }

    /// Successful `device_deinit` calls for `serial`, including the forced
    /// one at open.
    pub fn deinits(&self, serial: &str) -> u64 {
        self.state
            .lock()
            .device_by_serial(serial)
            .map_or(0, |d| d.deinits)
    }

    /// Whether `serial` is initialized.
    pub fn is_initialized(&self, serial: &str) -> bool {
        self.state
            .lock()
            .device_by_serial(serial)
            .is_some_and(|d| d.initialized)
    }

    /// Whether `serial` is streaming.
    pub fn is_streaming(&self, serial: &str) -> bool {
        self.state
            .lock()
            .device_by_serial(serial)
            .is_some_and(|d| d.streaming)
    }

    /// Whether `serial` would show up in a new camera list.
    pub fn is_online(&self, serial: &str) -> bool {
        self.state
            .lock()
            .device_by_serial(serial)
            .is_some_and(|d| d.offline_until.map_or(true, |t| Instant::now() >= t))
    }

    /// Whether the system instance is held.
    pub fn system_live(&self) -> bool {
        self.state.lock().system.is_some()
    }

    /// Device references handed out by `camera_list_get` and not released.
    pub fn outstanding_references(&self) -> usize {
        self.state.lock().outstanding_references()
    }

    /// Unreleased references to `serial`.
    pub fn references(&self, serial: &str) -> usize {
        let state = self.state.lock();
        let Some(index) = state.devices.iter().position(|d| d.template.serial == serial) else {
            return 0;
        };
        state
            .handles
            .values()
            .filter(|entry| entry.device == index && !entry.released)
            .count()
    }

    /// Camera lists not yet released.
    pub fn outstanding_lists(&self) -> usize {
        self.state.lock().lists.len()
    }

    /// Frames handed out and not yet released.
    pub fn outstanding_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Stored value of `name` on `serial`, bypassing init checks.
    pub fn property(&self, serial: &str, name: &str) -> Option<PropertyValue> {
        self.state
            .lock()
            .device_by_serial(serial)
            .and_then(|d| d.template.properties.get(name).cloned())
    }

    /// Chunk selectors enabled on `serial`.
    pub fn enabled_chunks(&self, serial: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut chunks: Vec<String> = state
            .device_by_serial(serial)
            .map(|d| d.enabled_chunks.iter().cloned().collect())
            .unwrap_or_default();
        chunks.sort();
        chunks
    }

    fn take_frame(state: &mut State, index: usize) -> Option<FrameEntry> {
        let device = &mut state.devices[index];
        let frame = match device.queue.pop_front() {
            Some(frame) => frame,
            None if device.template.frame_source == FrameSource::Pattern => MockFrame::new(
                device.template.pixel_format,
                device.template.width,
                device.template.height,
                pattern::generate_test_pattern(
                    device.template.pixel_format,
                    device.template.width,
                    device.template.height,
                    device.frame_counter,
                ),
            ),
            None => return None,
        };
        device.frame_counter += 1;
        let exposure_us = device
            .template
            .properties
            .get("ExposureTime")
            .and_then(PropertyValue::as_f64)
            .unwrap_or(0.0);
        Some(FrameEntry {
            frame,
            frame_id: device.frame_counter - 1,
            timestamp_ns: device.frame_counter * 33_333_333,
            exposure_us,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }
}

impl NativeDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn system_get_instance(&self) -> NativeResult<SystemHandle> {
        let mut state = self.lock();
        state.calls.system_get_instance += 1;
        state.check("system_get_instance")?;
        let handle = match state.system {
            Some((handle, refs)) => {
                state.system = Some((handle, refs + 1));
                handle
            }
            None => {
                let handle = state.next_handle();
                state.system = Some((handle, 1));
                handle
            }
        };
        Ok(SystemHandle::from_raw(handle))
    }

    fn system_release_instance(&self, system: SystemHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.system_release_instance += 1;
        state.check("system_release_instance")?;
        let Some((handle, refs)) = state.system else {
            return Err(Status::INVALID_HANDLE);
        };
        if handle != system.raw() {
            return Err(Status::INVALID_HANDLE);
        }
        if state.devices.iter().any(|d| d.initialized) {
            state.violations.system_released_with_live_devices += 1;
            tracing::warn!("Mock system release refused, devices still initialized");
            return Err(Status::RESOURCE_IN_USE);
        }
        let references = state.outstanding_references();
        if references > 0 || !state.lists.is_empty() {
            state.violations.system_released_with_references += 1;
            tracing::warn!(
                references,
                lists = state.lists.len(),
                "Mock system release refused, references still held"
            );
            return Err(Status::RESOURCE_IN_USE);
        }
        state.system = (refs > 1).then_some((handle, refs - 1));
        Ok(())
    }

    fn camera_list(&self, system: SystemHandle) -> NativeResult<CameraListHandle> {
        let mut state = self.lock();
        state.calls.camera_list += 1;
        state.check("camera_list")?;
        if state.system.map(|(h, _)| h) != Some(system.raw()) {
            return Err(Status::INVALID_HANDLE);
        }

        let now = Instant::now();
        let mut snapshot = Vec::new();
        for (index, device) in state.devices.iter_mut().enumerate() {
            match device.offline_until {
                Some(until) if now < until => continue,
                Some(_) => device.offline_until = None,
                None => {}
            }
            snapshot.push((index, device.generation));
        }
        let handle = state.next_handle();
        state.lists.insert(handle, snapshot);
        Ok(CameraListHandle::from_raw(handle))
    }

    fn camera_list_len(&self, list: CameraListHandle) -> NativeResult<usize> {
        let state = self.lock();
        state
            .lists
            .get(&list.raw())
            .map(Vec::len)
            .ok_or(Status::INVALID_HANDLE)
    }

    fn camera_list_get(&self, list: CameraListHandle, index: usize) -> NativeResult<DeviceHandle> {
        let mut state = self.lock();
        state.check("camera_list_get")?;
        let (device, generation) = *state
            .lists
            .get(&list.raw())
            .ok_or(Status::INVALID_HANDLE)?
            .get(index)
            .ok_or(Status::INVALID_INDEX)?;
        let handle = state.next_handle();
        state.handles.insert(
            handle,
            HandleEntry {
                device,
                generation,
                released: false,
            },
        );
        Ok(DeviceHandle::from_raw(handle))
    }

    fn camera_list_release(&self, list: CameraListHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.camera_list_release += 1;
        state.check("camera_list_release")?;
        state
            .lists
            .remove(&list.raw())
            .map(|_| ())
            .ok_or(Status::INVALID_HANDLE)
    }

    fn device_init(&self, device: DeviceHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.device_init += 1;
        state.check("device_init")?;
        let index = state.device_index(device)?;
        state.devices[index].initialized = true;
        Ok(())
    }

    fn device_deinit(&self, device: DeviceHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.device_deinit += 1;
        state.check("device_deinit")?;
        let index = state.device_index(device)?;
        let dev = &mut state.devices[index];
        if dev.initialized {
            dev.teardowns += 1;
        }
        dev.initialized = false;
        dev.streaming = false;
        dev.deinits += 1;
        drop(state);
        self.frame_ready.notify_all();
        Ok(())
    }

    fn device_release(&self, device: DeviceHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.device_release += 1;
        state.check("device_release")?;
        // A reference outlives a reset of its device and is still released.
        let Some(entry) = state.handles.get_mut(&device.raw()) else {
            return Err(Status::INVALID_HANDLE);
        };
        if entry.released {
            state.violations.released_device_handle_use += 1;
            return Err(Status::INVALID_HANDLE);
        }
        entry.released = true;
        Ok(())
    }

    fn get_property(&self, device: DeviceHandle, name: &str) -> NativeResult<PropertyValue> {
        let mut state = self.lock();
        state.check("get_property")?;
        let index = state.device_index(device)?;
        let dev = &state.devices[index];
        if !dev.initialized && !TRANSPORT_NODES.contains(&name) {
            return Err(Status::NOT_INITIALIZED);
        }
        if dev.template.hidden.contains(name) {
            return Err(Status::NOT_AVAILABLE);
        }
        match name {
            "ChunkSelector" => Ok(PropertyValue::Enum(dev.selected_chunk.clone())),
            "ChunkEnable" => Ok(PropertyValue::Bool(
                dev.enabled_chunks.contains(&dev.selected_chunk),
            )),
            _ => dev
                .template
                .properties
                .get(name)
                .cloned()
                .ok_or(Status::NOT_AVAILABLE),
        }
    }

    fn set_property(
        &self,
        device: DeviceHandle,
        name: &str,
        value: &PropertyValue,
    ) -> NativeResult<()> {
        let mut state = self.lock();
        state.check("set_property")?;
        let dev = state.initialized_device(device)?;
        if dev.template.hidden.contains(name) || !dev.template.properties.contains_key(name) {
            return Err(Status::NOT_AVAILABLE);
        }

        match name {
            "ChunkSelector" => {
                let selector = value.as_str().ok_or(Status::INVALID_PARAMETER)?;
                if !dev.template.chunk_selectors.iter().any(|s| s == selector) {
                    return Err(Status::INVALID_VALUE);
                }
                dev.selected_chunk = selector.to_string();
            }
            "ChunkEnable" => {
                let enable = value.as_bool().ok_or(Status::INVALID_PARAMETER)?;
                let selected = dev.selected_chunk.clone();
                if enable {
                    dev.enabled_chunks.insert(selected);
                } else {
                    dev.enabled_chunks.remove(&selected);
                }
            }
            "Width" | "Height" | "PixelFormat" if dev.streaming => {
                return Err(Status::ACCESS_DENIED);
            }
            "Width" | "Height" => {
                let v = value
                    .as_i64()
                    .and_then(|v| u32::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .ok_or(Status::INVALID_VALUE)?;
                if name == "Width" {
                    dev.template.width = v;
                } else {
                    dev.template.height = v;
                }
                dev.template.sync_geometry();
                return Ok(());
            }
            "PixelFormat" => {
                let format = value
                    .as_str()
                    .and_then(PixelFormat::from_symbolic)
                    .ok_or(Status::INVALID_VALUE)?;
                dev.template.pixel_format = format;
                dev.template.sync_geometry();
                return Ok(());
            }
            _ => {}
        }
        dev.template.properties.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn execute_command(&self, device: DeviceHandle, name: &str) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.execute_command += 1;
        state.check("execute_command")?;
        let dev = state.initialized_device(device)?;
        match name {
            "DeviceReset" => {
                dev.initialized = false;
                dev.streaming = false;
                dev.generation += 1;
                dev.offline_until = Some(Instant::now() + dev.template.reset_downtime);
                dev.enabled_chunks.clear();
                dev.queue.clear();
                tracing::debug!(serial = %dev.template.serial, "Mock device resetting");
            }
            "TriggerSoftware" if !dev.streaming => return Err(Status::NOT_AVAILABLE),
            "TriggerSoftware" => {
                let frame = MockFrame::new(
                    dev.template.pixel_format,
                    dev.template.width,
                    dev.template.height,
                    pattern::generate_test_pattern(
                        dev.template.pixel_format,
                        dev.template.width,
                        dev.template.height,
                        dev.frame_counter,
                    ),
                );
                dev.queue.push_back(frame);
            }
            _ => return Err(Status::NOT_AVAILABLE),
        }
        drop(state);
        self.frame_ready.notify_all();
        Ok(())
    }

    fn start_stream(&self, device: DeviceHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.start_stream += 1;
        state.check("start_stream")?;
        let dev = state.initialized_device(device)?;
        if dev.streaming {
            return Err(Status::RESOURCE_IN_USE);
        }
        dev.streaming = true;
        Ok(())
    }

    fn stop_stream(&self, device: DeviceHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.stop_stream += 1;
        state.check("stop_stream")?;
        let dev = state.initialized_device(device)?;
        if !dev.streaming {
            return Err(Status::NOT_AVAILABLE);
        }
        dev.streaming = false;
        drop(state);
        self.frame_ready.notify_all();
        Ok(())
    }

    fn get_next_frame(
        &self,
        device: DeviceHandle,
        timeout: Option<Duration>,
    ) -> NativeResult<FrameHandle> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        state.calls.get_next_frame += 1;
        state.check("get_next_frame")?;

        loop {
            let index = state.device_index(device)?;
            let dev = &state.devices[index];
            if !dev.initialized || !dev.streaming {
                return Err(Status::NOT_AVAILABLE);
            }
            if let Some(entry) = Self::take_frame(&mut state, index) {
                let handle = state.next_handle();
                state.frames.insert(handle, entry);
                return Ok(FrameHandle::from_raw(handle));
            }
            match deadline {
                None => self.frame_ready.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Status::TIMEOUT);
                    }
                    // Loop re-checks the queue once more before timing out
                    let _ = self.frame_ready.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn frame_is_complete(&self, frame: FrameHandle) -> NativeResult<bool> {
        let mut state = self.lock();
        Ok(state.frame(frame)?.frame.incomplete.is_none())
    }

    fn frame_get_status(&self, frame: FrameHandle) -> NativeResult<i32> {
        let mut state = self.lock();
        Ok(state
            .frame(frame)?
            .frame
            .incomplete
            .unwrap_or(super::image_status::NO_ERROR))
    }

    fn frame_info(&self, frame: FrameHandle) -> NativeResult<FrameInfo> {
        let mut state = self.lock();
        let entry = state.frame(frame)?;
        let f = &entry.frame;
        Ok(FrameInfo {
            width: f.width,
            height: f.height,
            stride: f.width as usize * f.pixel_format.channels() * f.pixel_format.bytes_per_sample(),
            pixel_format: f.pixel_format,
            frame_id: entry.frame_id,
            timestamp_ns: entry.timestamp_ns,
            exposure_us: entry.exposure_us,
        })
    }

    fn with_frame_data(
        &self,
        frame: FrameHandle,
        visit: &mut dyn FnMut(&[u8]),
    ) -> NativeResult<()> {
        let mut state = self.lock();
        let entry = state.frame(frame)?;
        visit(&entry.frame.data);
        Ok(())
    }

    fn frame_release(&self, frame: FrameHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.frame_release += 1;
        state.check("frame_release")?;
        state.frame(frame)?;
        state.frames.remove(&frame.raw());
        state.released_frames.insert(frame.raw());
        Ok(())
    }

    fn frame_save(
        &self,
        frame: FrameHandle,
        path: &Path,
        format: ImageFileFormat,
    ) -> NativeResult<()> {
        let mut state = self.lock();
        state.calls.frame_save += 1;
        state.check("frame_save")?;
        let frame = state.frame(frame)?.frame.clone();
        drop(state);
        save_frame(&frame, path, format)
    }
}

/// Encode `frame` with the `image` crate, or dump raw bytes.
fn save_frame(frame: &MockFrame, path: &Path, format: ImageFileFormat) -> NativeResult<()> {
    use image::{ColorType, ImageFormat};

    let target = match format {
        ImageFileFormat::Raw => {
            return std::fs::write(path, &frame.data).map_err(|err| {
                tracing::warn!(path = %path.display(), error = %err, "Raw frame write failed");
                Status::IO
            });
        }
        ImageFileFormat::Png => ImageFormat::Png,
        ImageFileFormat::Tiff => ImageFormat::Tiff,
        ImageFileFormat::Bmp => ImageFormat::Bmp,
        ImageFileFormat::Jpeg => ImageFormat::Jpeg,
        ImageFileFormat::Pgm => ImageFormat::Pnm,
    };

    let wide = frame.pixel_format.bytes_per_sample() == 2;
    let keep_wide = wide && matches!(format, ImageFileFormat::Png | ImageFileFormat::Tiff);
    let (buffer, color) = match (frame.pixel_format.channels(), wide, keep_wide) {
        (3, _, _) => (frame.data.clone(), ColorType::Rgb8),
        (_, true, true) => {
            // image expects native-endian 16-bit samples
            let native: Vec<u8> = frame
                .data
                .chunks_exact(2)
                .flat_map(|p| u16::from_le_bytes([p[0], p[1]]).to_ne_bytes())
                .collect();
            (native, ColorType::L16)
        }
        (_, true, false) => {
            let shift = frame.pixel_format.bit_depth().saturating_sub(8);
            let narrow: Vec<u8> = frame
                .data
                .chunks_exact(2)
                .map(|p| (u16::from_le_bytes([p[0], p[1]]) >> shift).min(255) as u8)
                .collect();
            (narrow, ColorType::L8)
        }
        (_, false, _) => (frame.data.clone(), ColorType::L8),
    };

    image::save_buffer_with_format(path, &buffer, frame.width, frame.height, color, target)
        .map_err(|err| {
            tracing::warn!(path = %path.display(), error = %err, "Mock frame save failed");
            Status::IO
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_device(driver: &MockDriver, system: SystemHandle) -> DeviceHandle {
        let list = driver.camera_list(system).unwrap();
        let device = driver.camera_list_get(list, 0).unwrap();
        driver.camera_list_release(list).unwrap();
        device
    }

    fn open_one(driver: &MockDriver) -> (SystemHandle, DeviceHandle) {
        let system = driver.system_get_instance().unwrap();
        let device = first_device(driver, system);
        driver.device_init(device).unwrap();
        (system, device)
    }

    #[test]
    fn system_release_refused_while_device_initialized() {
        let driver = MockDriver::new();
        let (system, device) = open_one(&driver);
        assert_eq!(
            driver.system_release_instance(system),
            Err(Status::RESOURCE_IN_USE)
        );
        assert_eq!(driver.violations().system_released_with_live_devices, 1);

        driver.device_deinit(device).unwrap();
        driver.device_release(device).unwrap();
        assert!(driver.system_release_instance(system).is_ok());
        assert!(!driver.system_live());
    }

    #[test]
    fn list_hands_out_fresh_references() {
        let driver = MockDriver::new();
        let system = driver.system_get_instance().unwrap();
        let list = driver.camera_list(system).unwrap();
        assert_eq!(driver.camera_list_len(list), Ok(1));
        let a = driver.camera_list_get(list, 0).unwrap();
        let b = driver.camera_list_get(list, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(driver.camera_list_get(list, 1), Err(Status::INVALID_INDEX));
        assert_eq!(driver.references("20270803"), 2);

        driver.device_release(a).unwrap();
        assert_eq!(driver.outstanding_references(), 1);
        assert!(driver.get_property(b, "DeviceSerialNumber").is_ok());
        driver.device_release(b).unwrap();
        driver.camera_list_release(list).unwrap();
        assert_eq!(driver.outstanding_lists(), 0);
    }

    #[test]
    fn system_release_refused_while_references_held() {
        let driver = MockDriver::new();
        let system = driver.system_get_instance().unwrap();
        let list = driver.camera_list(system).unwrap();
        assert_eq!(
            driver.system_release_instance(system),
            Err(Status::RESOURCE_IN_USE)
        );

        let device = driver.camera_list_get(list, 0).unwrap();
        driver.camera_list_release(list).unwrap();
        assert_eq!(
            driver.system_release_instance(system),
            Err(Status::RESOURCE_IN_USE)
        );
        assert_eq!(driver.violations().system_released_with_references, 2);

        driver.device_release(device).unwrap();
        assert!(driver.system_release_instance(system).is_ok());
    }

    #[test]
    fn released_handle_use_is_a_violation() {
        let driver = MockDriver::new();
        let (_system, device) = open_one(&driver);
        driver.device_deinit(device).unwrap();
        driver.device_release(device).unwrap();
        assert_eq!(driver.device_release(device), Err(Status::INVALID_HANDLE));
        assert_eq!(driver.violations().released_device_handle_use, 1);
    }

    #[test]
    fn transport_nodes_readable_before_init() {
        let driver = MockDriver::new();
        let system = driver.system_get_instance().unwrap();
        let device = first_device(&driver, system);
        assert_eq!(
            driver.get_property(device, "DeviceSerialNumber").unwrap(),
            PropertyValue::Str("20270803".to_string())
        );
        assert_eq!(
            driver.get_property(device, "ExposureTime"),
            Err(Status::NOT_INITIALIZED)
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let driver = MockDriver::new();
        driver.inject_failure("system_get_instance", Status::IO, 2);
        assert_eq!(driver.system_get_instance(), Err(Status::IO));
        assert_eq!(driver.system_get_instance(), Err(Status::IO));
        assert!(driver.system_get_instance().is_ok());
    }

    #[test]
    fn queued_frames_take_priority_and_timeout_when_empty() {
        let driver = MockDriver::with_devices([
            MockDevice::new("S1", "BFLY").with_frame_source(FrameSource::Queue)
        ]);
        let (_system, device) = open_one(&driver);
        driver.start_stream(device).unwrap();

        assert_eq!(
            driver.get_next_frame(device, Some(Duration::ZERO)),
            Err(Status::TIMEOUT)
        );

        driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono16, 2, 2, 7));
        let frame = driver.get_next_frame(device, None).unwrap();
        let info = driver.frame_info(frame).unwrap();
        assert_eq!((info.width, info.height, info.stride), (2, 2, 4));
        driver.frame_release(frame).unwrap();
        assert_eq!(driver.frame_release(frame), Err(Status::INVALID_HANDLE));
        assert_eq!(driver.violations().released_frame_use, 1);
    }

    #[test]
    fn reset_invalidates_handles_until_back_online() {
        let driver = MockDriver::with_devices([
            MockDevice::new("S1", "BFLY").with_reset_downtime(Duration::from_millis(30))
        ]);
        let (system, device) = open_one(&driver);
        driver.execute_command(device, "DeviceReset").unwrap();
        assert_eq!(
            driver.get_property(device, "DeviceSerialNumber"),
            Err(Status::INVALID_HANDLE)
        );
        let list = driver.camera_list(system).unwrap();
        assert_eq!(driver.camera_list_len(list), Ok(0));
        driver.camera_list_release(list).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        let list = driver.camera_list(system).unwrap();
        assert_eq!(driver.camera_list_len(list), Ok(1));
        driver.camera_list_release(list).unwrap();
        assert!(!driver.is_initialized("S1"));

        // The stale reference is still released normally
        driver.device_release(device).unwrap();
        assert_eq!(driver.outstanding_references(), 0);
        assert_eq!(driver.violations().total(), 0);
    }

    #[test]
    fn chunk_selector_rejects_unknown_entries() {
        let driver = MockDriver::with_devices([
            MockDevice::new("S1", "BFLY").with_chunk_selectors(&["FrameCounter", "ExposureTime"])
        ]);
        let (_system, device) = open_one(&driver);
        let select = |name: &str| {
            driver.set_property(device, "ChunkSelector", &PropertyValue::Enum(name.to_string()))
        };
        assert_eq!(select("FrameID"), Err(Status::INVALID_VALUE));
        assert!(select("FrameCounter").is_ok());
        driver
            .set_property(device, "ChunkEnable", &PropertyValue::Bool(true))
            .unwrap();
        assert_eq!(driver.enabled_chunks("S1"), vec!["FrameCounter".to_string()]);
    }
}
