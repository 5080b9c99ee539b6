//! Native driver seam.
//!
//! Everything the lifecycle core needs from the vendor driver goes through
//! [`NativeDriver`]. The core never sees SDK types: handles are address-sized
//! integers with `0` as the closed sentinel, failures are bare [`Status`] codes.
//!
//! Two implementations ship with the crate:
//! - [`mock::MockDriver`] (feature `mock`, default): in-process simulation with
//!   call counters, used by the test-suite.
//! - [`sdk::SpinnakerSdk`] (feature `spinnaker_sdk`): the real Spinnaker C SDK.

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "spinnaker_sdk")]
pub mod sdk;

use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Result of a raw driver call.
pub type NativeResult<T> = Result<T, Status>;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            /// The closed/null sentinel.
            pub const NULL: Self = Self(0);

            /// Wrap a raw driver handle value.
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            /// Raw driver handle value.
            pub const fn raw(self) -> usize {
                self.0
            }

            /// Whether this is the null sentinel.
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

native_handle!(
    /// Process-wide system instance handle.
    SystemHandle
);
native_handle!(
    /// Snapshot of the devices attached when it was taken.
    CameraListHandle
);
native_handle!(
    /// One reference to a physical device. Every `camera_list_get` hands out
    /// a new one, and each must go back through `device_release`.
    DeviceHandle
);
native_handle!(
    /// Driver-owned image buffer returned by `get_next_frame`.
    FrameHandle
);

/// Driver status code.
///
/// Values follow the Spinnaker `spinError` table; anything not listed is still
/// carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

// Names mirror the SDK's spinError table.
#[allow(missing_docs)]
impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const ERROR: Status = Status(-1001);
    pub const NOT_INITIALIZED: Status = Status(-1002);
    pub const NOT_IMPLEMENTED: Status = Status(-1003);
    pub const RESOURCE_IN_USE: Status = Status(-1004);
    pub const ACCESS_DENIED: Status = Status(-1005);
    pub const INVALID_HANDLE: Status = Status(-1006);
    pub const INVALID_ID: Status = Status(-1007);
    pub const NO_DATA: Status = Status(-1008);
    pub const INVALID_PARAMETER: Status = Status(-1009);
    pub const IO: Status = Status(-1010);
    pub const TIMEOUT: Status = Status(-1011);
    pub const ABORT: Status = Status(-1012);
    pub const INVALID_BUFFER: Status = Status(-1013);
    pub const NOT_AVAILABLE: Status = Status(-1014);
    pub const INVALID_ADDRESS: Status = Status(-1015);
    pub const BUFFER_TOO_SMALL: Status = Status(-1016);
    pub const INVALID_INDEX: Status = Status(-1017);
    pub const PARSING_CHUNK_DATA: Status = Status(-1018);
    pub const INVALID_VALUE: Status = Status(-1019);
    pub const RESOURCE_EXHAUSTED: Status = Status(-1020);
    pub const OUT_OF_MEMORY: Status = Status(-1021);
    pub const BUSY: Status = Status(-1022);
}

impl Status {
    /// Raw code.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether this is `SUCCESS`.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name, if the code is a known one.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "SUCCESS",
            -1001 => "ERROR",
            -1002 => "NOT_INITIALIZED",
            -1003 => "NOT_IMPLEMENTED",
            -1004 => "RESOURCE_IN_USE",
            -1005 => "ACCESS_DENIED",
            -1006 => "INVALID_HANDLE",
            -1007 => "INVALID_ID",
            -1008 => "NO_DATA",
            -1009 => "INVALID_PARAMETER",
            -1010 => "IO",
            -1011 => "TIMEOUT",
            -1012 => "ABORT",
            -1013 => "INVALID_BUFFER",
            -1014 => "NOT_AVAILABLE",
            -1015 => "INVALID_ADDRESS",
            -1016 => "BUFFER_TOO_SMALL",
            -1017 => "INVALID_INDEX",
            -1018 => "PARSING_CHUNK_DATA",
            -1019 => "INVALID_VALUE",
            -1020 => "RESOURCE_EXHAUSTED",
            -1021 => "OUT_OF_MEMORY",
            -1022 => "BUSY",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SPINNAKER_ERR_{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// Per-image status reported for incomplete buffers (`spinImageStatus`).
#[allow(missing_docs)]
pub mod image_status {
    pub const UNKNOWN_ERROR: i32 = -1;
    pub const NO_ERROR: i32 = 0;
    pub const CRC_CHECK_FAILED: i32 = 1;
    pub const DATA_OVERFLOW: i32 = 2;
    pub const MISSING_PACKETS: i32 = 3;
    pub const LEADER_BUFFER_SIZE_INCONSISTENT: i32 = 4;
    pub const TRAILER_BUFFER_SIZE_INCONSISTENT: i32 = 5;
    pub const PACKETID_INCONSISTENT: i32 = 6;
    pub const MISSING_LEADER: i32 = 7;
    pub const MISSING_TRAILER: i32 = 8;
    pub const DATA_INCOMPLETE: i32 = 9;
    pub const INFO_INCONSISTENT: i32 = 10;
    pub const CHUNK_DATA_INVALID: i32 = 11;
    pub const NO_SYSTEM_RESOURCES: i32 = 12;
}

/// Value read from or written to a device node.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Integer node.
    Int(i64),
    /// Float node.
    Float(f64),
    /// Boolean node.
    Bool(bool),
    /// String node.
    Str(String),
    /// Symbolic enumeration entry, e.g. `"Mono8"`.
    Enum(String),
}

impl PropertyValue {
    /// Text form of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) | PropertyValue::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Str(s) | PropertyValue::Enum(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

/// Pixel layout of a native buffer.
///
/// Multi-byte samples are little-endian and unpacked (one sample per 16-bit word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit mono.
    Mono8,
    /// 10-bit mono in 16-bit words.
    Mono10,
    /// 12-bit mono in 16-bit words.
    Mono12,
    /// 14-bit mono in 16-bit words.
    Mono14,
    /// 16-bit mono.
    Mono16,
    /// 8-bit RGB, three samples per pixel.
    Rgb8,
    /// 8-bit Bayer, RG tile.
    BayerRg8,
    /// 8-bit Bayer, GR tile.
    BayerGr8,
    /// 8-bit Bayer, GB tile.
    BayerGb8,
    /// 8-bit Bayer, BG tile.
    BayerBg8,
    /// 16-bit Bayer, RG tile.
    BayerRg16,
}

impl PixelFormat {
    /// Parse the driver's symbolic name (`"Mono8"`, `"RGB8Packed"`, ...).
    pub fn from_symbolic(name: &str) -> Option<Self> {
        let format = match name {
            "Mono8" => PixelFormat::Mono8,
            "Mono10" => PixelFormat::Mono10,
            "Mono12" => PixelFormat::Mono12,
            "Mono14" => PixelFormat::Mono14,
            "Mono16" => PixelFormat::Mono16,
            "RGB8" | "RGB8Packed" => PixelFormat::Rgb8,
            "BayerRG8" => PixelFormat::BayerRg8,
            "BayerGR8" => PixelFormat::BayerGr8,
            "BayerGB8" => PixelFormat::BayerGb8,
            "BayerBG8" => PixelFormat::BayerBg8,
            "BayerRG16" => PixelFormat::BayerRg16,
            _ => return None,
        };
        Some(format)
    }

    /// Symbolic name as the driver spells it.
    pub fn symbolic(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono14 => "Mono14",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::BayerRg8 => "BayerRG8",
            PixelFormat::BayerGr8 => "BayerGR8",
            PixelFormat::BayerGb8 => "BayerGB8",
            PixelFormat::BayerBg8 => "BayerBG8",
            PixelFormat::BayerRg16 => "BayerRG16",
        }
    }

    /// Samples per pixel.
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            _ => 1,
        }
    }

    /// Bytes per sample in the native buffer.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::Mono8
            | PixelFormat::Rgb8
            | PixelFormat::BayerRg8
            | PixelFormat::BayerGr8
            | PixelFormat::BayerGb8
            | PixelFormat::BayerBg8 => 1,
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono14
            | PixelFormat::Mono16
            | PixelFormat::BayerRg16 => 2,
        }
    }

    /// Significant bits per sample.
    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Mono10 => 10,
            PixelFormat::Mono12 => 12,
            PixelFormat::Mono14 => 14,
            PixelFormat::Mono16 | PixelFormat::BayerRg16 => 16,
            _ => 8,
        }
    }

    /// Largest raw sample magnitude.
    pub fn max_value(self) -> u32 {
        (1u32 << self.bit_depth()) - 1
    }

    /// Bytes for a tightly packed `width` x `height` buffer.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.channels() * self.bytes_per_sample()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbolic())
    }
}

/// File format understood by the driver's native save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFileFormat {
    /// Portable graymap.
    Pgm,
    /// Windows bitmap.
    Bmp,
    /// JPEG.
    Jpeg,
    /// TIFF.
    Tiff,
    /// PNG.
    Png,
    /// Buffer bytes as-is.
    Raw,
}

impl ImageFileFormat {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        let format = match ext.as_str() {
            "pgm" => ImageFileFormat::Pgm,
            "bmp" => ImageFileFormat::Bmp,
            "jpg" | "jpeg" => ImageFileFormat::Jpeg,
            "tif" | "tiff" => ImageFileFormat::Tiff,
            "png" => ImageFileFormat::Png,
            "raw" | "bin" => ImageFileFormat::Raw,
            _ => return None,
        };
        Some(format)
    }
}

/// Dimensions and chunk metadata of a pulled frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row including padding.
    pub stride: usize,
    /// Buffer pixel format.
    pub pixel_format: PixelFormat,
    /// Chunk frame id.
    pub frame_id: u64,
    /// Chunk timestamp in nanoseconds (device clock).
    pub timestamp_ns: u64,
    /// Chunk exposure time in microseconds.
    pub exposure_us: f64,
}

/// The vendor driver as seen by the lifecycle core.
///
/// Implementations must be callable from any thread. Calls are treated as
/// atomic: they either complete or fail with a status code.
pub trait NativeDriver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn system_get_instance(&self) -> NativeResult<SystemHandle>;
    fn system_release_instance(&self, system: SystemHandle) -> NativeResult<()>;

    /// Snapshot the attached devices. Release with `camera_list_release`.
    fn camera_list(&self, system: SystemHandle) -> NativeResult<CameraListHandle>;
    fn camera_list_len(&self, list: CameraListHandle) -> NativeResult<usize>;
    /// A new device reference for `index`; the caller owns it.
    fn camera_list_get(&self, list: CameraListHandle, index: usize) -> NativeResult<DeviceHandle>;
    fn camera_list_release(&self, list: CameraListHandle) -> NativeResult<()>;

    fn device_init(&self, device: DeviceHandle) -> NativeResult<()>;
    fn device_deinit(&self, device: DeviceHandle) -> NativeResult<()>;
    /// Drop one reference. The device itself stays initialized.
    fn device_release(&self, device: DeviceHandle) -> NativeResult<()>;

    /// Read a named node. Transport-layer nodes (serial, model) are readable
    /// before `device_init`.
    fn get_property(&self, device: DeviceHandle, name: &str) -> NativeResult<PropertyValue>;
    fn set_property(
        &self,
        device: DeviceHandle,
        name: &str,
        value: &PropertyValue,
    ) -> NativeResult<()>;
    /// Execute a command node, e.g. `DeviceReset`.
    fn execute_command(&self, device: DeviceHandle, name: &str) -> NativeResult<()>;

    fn start_stream(&self, device: DeviceHandle) -> NativeResult<()>;
    fn stop_stream(&self, device: DeviceHandle) -> NativeResult<()>;

    /// Next frame; `None` blocks indefinitely, `Some(ZERO)` polls once.
    fn get_next_frame(
        &self,
        device: DeviceHandle,
        timeout: Option<Duration>,
    ) -> NativeResult<FrameHandle>;
    fn frame_is_complete(&self, frame: FrameHandle) -> NativeResult<bool>;
    fn frame_get_status(&self, frame: FrameHandle) -> NativeResult<i32>;
    fn frame_info(&self, frame: FrameHandle) -> NativeResult<FrameInfo>;
    /// Lend the pixel buffer to `visit` for the duration of the call.
    fn with_frame_data(
        &self,
        frame: FrameHandle,
        visit: &mut dyn FnMut(&[u8]),
    ) -> NativeResult<()>;
    fn frame_release(&self, frame: FrameHandle) -> NativeResult<()>;
    fn frame_save(
        &self,
        frame: FrameHandle,
        path: &Path,
        format: ImageFileFormat,
    ) -> NativeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_names_known_codes() {
        assert_eq!(
            Status::RESOURCE_IN_USE.to_string(),
            "SPINNAKER_ERR_RESOURCE_IN_USE (-1004)"
        );
        assert_eq!(Status(-4242).to_string(), "status -4242");
        assert!(Status::SUCCESS.is_success());
    }

    #[test]
    fn pixel_format_geometry() {
        assert_eq!(PixelFormat::Mono8.max_value(), 255);
        assert_eq!(PixelFormat::Mono12.max_value(), 4095);
        assert_eq!(PixelFormat::Mono16.max_value(), 65535);
        assert_eq!(PixelFormat::Rgb8.buffer_len(4, 2), 24);
        assert_eq!(PixelFormat::Mono16.buffer_len(4, 2), 16);
        assert_eq!(
            PixelFormat::from_symbolic("RGB8Packed"),
            Some(PixelFormat::Rgb8)
        );
        assert_eq!(PixelFormat::from_symbolic("YUV422"), None);
    }

    #[test]
    fn file_format_from_extension() {
        assert_eq!(
            ImageFileFormat::from_path(Path::new("a/b.TIFF")),
            Some(ImageFileFormat::Tiff)
        );
        assert_eq!(ImageFileFormat::from_path(Path::new("x")), None);
    }

    #[test]
    fn null_handles() {
        assert!(DeviceHandle::NULL.is_null());
        assert!(!DeviceHandle::from_raw(7).is_null());
        assert_eq!(FrameHandle::from_raw(3).raw(), 3);
    }
}
