//! Spinnaker C SDK backend.
//!
//! Handles are the SDK's opaque pointers stored as `usize`. Node reads and
//! writes look the name up in the GenICam node map first (available after
//! `spinCameraInit`) and fall back to the transport-layer device node map,
//! which is where serial and model live before init.

#![allow(unsafe_code)]

use super::{
    CameraListHandle, DeviceHandle, FrameHandle, FrameInfo, ImageFileFormat, NativeDriver,
    NativeResult, PixelFormat, PropertyValue, Status, SystemHandle,
};
use spinnaker_sys::*;
use std::ffi::{c_char, c_void, CString};
use std::path::Path;
use std::time::Duration;

/// Early-return the call's status unless it is `SPINNAKER_ERR_SUCCESS`.
macro_rules! checked {
    ($call:expr) => {
        match $call {
            0 => {}
            err => return Err(Status(err as i32)),
        }
    };
}

// `_spinNodeType` entries
const INTEGER_NODE: i32 = 2;
const BOOLEAN_NODE: i32 = 3;
const FLOAT_NODE: i32 = 4;
const COMMAND_NODE: i32 = 5;
const STRING_NODE: i32 = 6;
const ENUMERATION_NODE: i32 = 8;

const STRING_BUF_LEN: usize = 256;

fn ptr(raw: usize) -> *mut c_void {
    raw as *mut c_void
}

fn c_string(value: &str) -> NativeResult<CString> {
    CString::new(value).map_err(|_| Status::INVALID_PARAMETER)
}

/// Read a string through one of the SDK's `(handle, buf, *len)` getters.
fn read_string<H: Copy>(
    handle: H,
    getter: unsafe extern "C" fn(H, *mut c_char, *mut usize) -> spinError,
) -> NativeResult<String> {
    let mut buf = [0 as c_char; STRING_BUF_LEN];
    let mut len = STRING_BUF_LEN;
    // SAFETY: buf is writable for `len` bytes; the SDK writes at most `len`
    // bytes including the terminator and updates `len`.
    checked!(unsafe { getter(handle, buf.as_mut_ptr(), &mut len) });
    let len = len.min(STRING_BUF_LEN);
    let bytes: Vec<u8> = buf[..len.saturating_sub(1)]
        .iter()
        .map(|c| *c as u8)
        .collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The real driver.
#[derive(Debug, Default)]
pub struct SpinnakerSdk;

impl SpinnakerSdk {
    /// Driver backed by the linked Spinnaker C library.
    pub fn new() -> Self {
        Self
    }

    fn node(&self, device: DeviceHandle, name: &str) -> NativeResult<spinNodeHandle> {
        let name = c_string(name)?;
        let mut last = Status::NOT_AVAILABLE;

        for tl in [false, true] {
            let mut map: spinNodeMapHandle = std::ptr::null_mut();
            // SAFETY: device is a camera handle obtained from spinCameraListGet;
            // map is a valid out pointer.
            let status = unsafe {
                if tl {
                    spinCameraGetTLDeviceNodeMap(ptr(device.raw()), &mut map)
                } else {
                    spinCameraGetNodeMap(ptr(device.raw()), &mut map)
                }
            };
            if status != 0 {
                last = Status(status as i32);
                continue;
            }

            let mut node: spinNodeHandle = std::ptr::null_mut();
            // SAFETY: map came from the SDK above; name is NUL-terminated.
            let status = unsafe { spinNodeMapGetNode(map, name.as_ptr(), &mut node) };
            if status != 0 || node.is_null() {
                last = if status != 0 {
                    Status(status as i32)
                } else {
                    Status::NOT_AVAILABLE
                };
                continue;
            }

            let mut available: bool8_t = 0;
            // SAFETY: node is a live node handle.
            let status = unsafe { spinNodeIsAvailable(node, &mut available) };
            if status == 0 && available != 0 {
                return Ok(node);
            }
            last = Status::NOT_AVAILABLE;
        }
        Err(last)
    }

    fn node_type(node: spinNodeHandle) -> NativeResult<i32> {
        let mut node_type: spinNodeType = 0;
        // SAFETY: node is a live node handle; node_type is a valid out pointer.
        checked!(unsafe { spinNodeGetType(node, &mut node_type) });
        Ok(node_type as i32)
    }

    fn enum_entry_value(node: spinNodeHandle, symbolic: &str) -> NativeResult<i64> {
        let symbolic = c_string(symbolic)?;
        let mut entry: spinNodeHandle = std::ptr::null_mut();
        let mut value: i64 = 0;
        // SAFETY: node is an enumeration node; out pointers are valid.
        unsafe {
            checked!(spinEnumerationGetEntryByName(node, symbolic.as_ptr(), &mut entry));
            checked!(spinEnumerationEntryGetIntValue(entry, &mut value));
        }
        Ok(value)
    }
}

impl NativeDriver for SpinnakerSdk {
    fn name(&self) -> &'static str {
        "spinnaker"
    }

    fn system_get_instance(&self) -> NativeResult<SystemHandle> {
        let mut system: spinSystem = std::ptr::null_mut();
        // SAFETY: system is a valid out pointer.
        checked!(unsafe { spinSystemGetInstance(&mut system) });
        Ok(SystemHandle::from_raw(system as usize))
    }

    fn system_release_instance(&self, system: SystemHandle) -> NativeResult<()> {
        // SAFETY: system came from spinSystemGetInstance and is released once.
        checked!(unsafe { spinSystemReleaseInstance(ptr(system.raw())) });
        Ok(())
    }

    fn camera_list(&self, system: SystemHandle) -> NativeResult<CameraListHandle> {
        let mut list: spinCameraList = std::ptr::null_mut();
        // SAFETY: list is a valid out pointer; on failure the half-built list
        // is destroyed before returning.
        unsafe {
            checked!(spinCameraListCreateEmpty(&mut list));
            let status = spinSystemGetCameras(ptr(system.raw()), list);
            if status != 0 {
                let _ = spinCameraListDestroy(list);
                return Err(Status(status as i32));
            }
        }
        Ok(CameraListHandle::from_raw(list as usize))
    }

    fn camera_list_len(&self, list: CameraListHandle) -> NativeResult<usize> {
        let mut count: usize = 0;
        // SAFETY: list came from camera_list and is not destroyed yet.
        checked!(unsafe { spinCameraListGetSize(ptr(list.raw()), &mut count) });
        Ok(count)
    }

    fn camera_list_get(&self, list: CameraListHandle, index: usize) -> NativeResult<DeviceHandle> {
        let mut camera: spinCamera = std::ptr::null_mut();
        // SAFETY: as above; spinCameraListGet hands out a new reference that
        // stays valid after the list is cleared.
        checked!(unsafe { spinCameraListGet(ptr(list.raw()), index, &mut camera) });
        Ok(DeviceHandle::from_raw(camera as usize))
    }

    fn camera_list_release(&self, list: CameraListHandle) -> NativeResult<()> {
        // SAFETY: list is cleared and destroyed exactly once.
        unsafe {
            checked!(spinCameraListClear(ptr(list.raw())));
            checked!(spinCameraListDestroy(ptr(list.raw())));
        }
        Ok(())
    }

    fn device_init(&self, device: DeviceHandle) -> NativeResult<()> {
        // SAFETY: device is a camera reference from camera_list_get.
        checked!(unsafe { spinCameraInit(ptr(device.raw())) });
        Ok(())
    }

    fn device_deinit(&self, device: DeviceHandle) -> NativeResult<()> {
        // SAFETY: as above.
        checked!(unsafe { spinCameraDeInit(ptr(device.raw())) });
        Ok(())
    }

    fn device_release(&self, device: DeviceHandle) -> NativeResult<()> {
        // SAFETY: the reference is not used again after this call.
        checked!(unsafe { spinCameraRelease(ptr(device.raw())) });
        Ok(())
    }

    fn get_property(&self, device: DeviceHandle, name: &str) -> NativeResult<PropertyValue> {
        let node = self.node(device, name)?;
        let mut readable: bool8_t = 0;
        // SAFETY: node is live; every out pointer below is a local.
        unsafe {
            checked!(spinNodeIsReadable(node, &mut readable));
            if readable == 0 {
                return Err(Status::ACCESS_DENIED);
            }
            match Self::node_type(node)? {
                INTEGER_NODE => {
                    let mut value: i64 = 0;
                    checked!(spinIntegerGetValue(node, &mut value));
                    Ok(PropertyValue::Int(value))
                }
                FLOAT_NODE => {
                    let mut value: f64 = 0.0;
                    checked!(spinFloatGetValue(node, &mut value));
                    Ok(PropertyValue::Float(value))
                }
                BOOLEAN_NODE => {
                    let mut value: bool8_t = 0;
                    checked!(spinBooleanGetValue(node, &mut value));
                    Ok(PropertyValue::Bool(value != 0))
                }
                STRING_NODE => read_string(node, spinStringGetValue).map(PropertyValue::Str),
                ENUMERATION_NODE => {
                    let mut entry: spinNodeHandle = std::ptr::null_mut();
                    checked!(spinEnumerationGetCurrentEntry(node, &mut entry));
                    let symbolic = read_string(entry, spinEnumerationEntryGetSymbolic);
                    let _ = spinEnumerationReleaseNode(node, entry);
                    symbolic.map(PropertyValue::Enum)
                }
                _ => read_string(node, spinNodeToString).map(PropertyValue::Str),
            }
        }
    }

    fn set_property(
        &self,
        device: DeviceHandle,
        name: &str,
        value: &PropertyValue,
    ) -> NativeResult<()> {
        let node = self.node(device, name)?;
        let mut writable: bool8_t = 0;
        // SAFETY: node is live; string arguments are NUL-terminated locals.
        unsafe {
            checked!(spinNodeIsWritable(node, &mut writable));
            if writable == 0 {
                return Err(Status::ACCESS_DENIED);
            }
            match (Self::node_type(node)?, value) {
                (INTEGER_NODE, PropertyValue::Int(v)) => checked!(spinIntegerSetValue(node, *v)),
                (FLOAT_NODE, PropertyValue::Float(v)) => checked!(spinFloatSetValue(node, *v)),
                (FLOAT_NODE, PropertyValue::Int(v)) => {
                    checked!(spinFloatSetValue(node, *v as f64))
                }
                (BOOLEAN_NODE, PropertyValue::Bool(v)) => {
                    checked!(spinBooleanSetValue(node, bool8_t::from(*v)))
                }
                (ENUMERATION_NODE, PropertyValue::Enum(s) | PropertyValue::Str(s)) => {
                    let entry = Self::enum_entry_value(node, s)?;
                    checked!(spinEnumerationSetIntValue(node, entry))
                }
                (STRING_NODE, PropertyValue::Str(s)) => {
                    let s = c_string(s)?;
                    checked!(spinStringSetValue(node, s.as_ptr()))
                }
                _ => return Err(Status::INVALID_PARAMETER),
            }
        }
        Ok(())
    }

    fn execute_command(&self, device: DeviceHandle, name: &str) -> NativeResult<()> {
        let node = self.node(device, name)?;
        if Self::node_type(node)? != COMMAND_NODE {
            return Err(Status::INVALID_PARAMETER);
        }
        // SAFETY: node is a live command node.
        checked!(unsafe { spinCommandExecute(node) });
        Ok(())
    }

    fn start_stream(&self, device: DeviceHandle) -> NativeResult<()> {
        // SAFETY: device is an initialized camera.
        checked!(unsafe { spinCameraBeginAcquisition(ptr(device.raw())) });
        Ok(())
    }

    fn stop_stream(&self, device: DeviceHandle) -> NativeResult<()> {
        // SAFETY: device is an initialized camera.
        checked!(unsafe { spinCameraEndAcquisition(ptr(device.raw())) });
        Ok(())
    }

    fn get_next_frame(
        &self,
        device: DeviceHandle,
        timeout: Option<Duration>,
    ) -> NativeResult<FrameHandle> {
        let grab_timeout = match timeout {
            None => EVENT_TIMEOUT_INFINITE as u64,
            Some(t) => u64::try_from(t.as_millis()).unwrap_or(u64::MAX - 1),
        };
        let mut image: spinImage = std::ptr::null_mut();
        // SAFETY: device is streaming; image is a valid out pointer.
        checked!(unsafe { spinCameraGetNextImageEx(ptr(device.raw()), grab_timeout, &mut image) });
        Ok(FrameHandle::from_raw(image as usize))
    }

    fn frame_is_complete(&self, frame: FrameHandle) -> NativeResult<bool> {
        let mut incomplete: bool8_t = 0;
        // SAFETY: frame came from spinCameraGetNextImageEx and is unreleased.
        checked!(unsafe { spinImageIsIncomplete(ptr(frame.raw()), &mut incomplete) });
        Ok(incomplete == 0)
    }

    fn frame_get_status(&self, frame: FrameHandle) -> NativeResult<i32> {
        let mut status: spinImageStatus = 0;
        // SAFETY: as above.
        checked!(unsafe { spinImageGetStatus(ptr(frame.raw()), &mut status) });
        Ok(status as i32)
    }

    fn frame_info(&self, frame: FrameHandle) -> NativeResult<FrameInfo> {
        let image = ptr(frame.raw());
        let (mut width, mut height, mut stride) = (0usize, 0usize, 0usize);
        let (mut frame_id, mut timestamp) = (0u64, 0u64);
        let mut exposure: f64 = 0.0;
        // SAFETY: image is an unreleased image handle; out pointers are locals.
        unsafe {
            checked!(spinImageGetWidth(image, &mut width));
            checked!(spinImageGetHeight(image, &mut height));
            checked!(spinImageGetStride(image, &mut stride));
            checked!(spinImageGetFrameID(image, &mut frame_id));
            checked!(spinImageGetTimeStamp(image, &mut timestamp));
            let chunk = b"ChunkExposureTime\0";
            if spinImageChunkDataGetFloatValue(image, chunk.as_ptr().cast(), &mut exposure) != 0 {
                exposure = 0.0;
            }
        }
        let format_name = read_string(image, spinImageGetPixelFormatName)?;
        let pixel_format = PixelFormat::from_symbolic(&format_name).ok_or_else(|| {
            tracing::warn!(format = %format_name, "Unsupported pixel format");
            Status::NOT_IMPLEMENTED
        })?;

        Ok(FrameInfo {
            width: u32::try_from(width).map_err(|_| Status::INVALID_VALUE)?,
            height: u32::try_from(height).map_err(|_| Status::INVALID_VALUE)?,
            stride,
            pixel_format,
            frame_id,
            timestamp_ns: timestamp,
            exposure_us: exposure,
        })
    }

    fn with_frame_data(
        &self,
        frame: FrameHandle,
        visit: &mut dyn FnMut(&[u8]),
    ) -> NativeResult<()> {
        let image = ptr(frame.raw());
        let mut data: *mut c_void = std::ptr::null_mut();
        let mut size: usize = 0;
        // SAFETY: the buffer belongs to the unreleased image and stays valid
        // until spinImageRelease; it is only lent for the duration of `visit`.
        unsafe {
            checked!(spinImageGetData(image, &mut data));
            checked!(spinImageGetBufferSize(image, &mut size));
            if data.is_null() {
                return Err(Status::NO_DATA);
            }
            visit(std::slice::from_raw_parts(data as *const u8, size));
        }
        Ok(())
    }

    fn frame_release(&self, frame: FrameHandle) -> NativeResult<()> {
        // SAFETY: the frame is not used again after this call.
        checked!(unsafe { spinImageRelease(ptr(frame.raw())) });
        Ok(())
    }

    fn frame_save(
        &self,
        frame: FrameHandle,
        path: &Path,
        format: ImageFileFormat,
    ) -> NativeResult<()> {
        // `_spinImageFileFormat` entries
        let file_format = match format {
            ImageFileFormat::Pgm => 0,
            ImageFileFormat::Bmp => 2,
            ImageFileFormat::Jpeg => 3,
            ImageFileFormat::Tiff => 5,
            ImageFileFormat::Png => 6,
            ImageFileFormat::Raw => 7,
        };
        let path = path.to_str().ok_or(Status::INVALID_PARAMETER)?;
        let path = c_string(path)?;
        // SAFETY: image is unreleased; path is NUL-terminated.
        checked!(unsafe { spinImageSave(ptr(frame.raw()), path.as_ptr(), file_format) });
        Ok(())
    }
}

#[cfg(all(test, feature = "hardware_tests"))]
mod tests {
    use super::*;

    #[test]
    fn system_round_trip() {
        let sdk = SpinnakerSdk::new();
        let system = sdk.system_get_instance().unwrap();
        assert!(!system.is_null());
        let list = sdk.camera_list(system).unwrap();
        for index in 0..sdk.camera_list_len(list).unwrap() {
            let device = sdk.camera_list_get(list, index).unwrap();
            sdk.device_release(device).unwrap();
        }
        sdk.camera_list_release(list).unwrap();
        sdk.system_release_instance(system).unwrap();
    }
}
