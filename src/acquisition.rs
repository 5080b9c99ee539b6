//! Frame acquisition.
//!
//! [`Camera::pull_frame`] hands out a [`Frame`] that borrows a driver-owned
//! buffer. The buffer goes back to the driver when the frame is dropped, when
//! [`Frame::release`] is called, or never if the caller detaches it with
//! [`Frame::into_handle`].
//!
//! Every device keeps a ledger of the frames it handed out. When the last
//! camera object for a device is released, frames still held are given back
//! to the driver before the device is torn down; afterwards those `Frame`s
//! report [`SpinError::ClosedHandle`].
//!
//! Pixel copies go through [`copy_frame`], which converts the native sample
//! type into any [`Pixel`] destination, optionally normalized into `[0, 1]`.

use crate::camera::{Camera, DeviceSession};
use crate::error::{SpinError, SpinResult};
use crate::names::ChunkKind;
use crate::native::{
    image_status, FrameHandle, FrameInfo, ImageFileFormat, NativeDriver, PixelFormat,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long `pull_frame` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until a frame arrives.
    Forever,
    /// Block at most this long. `Duration::ZERO` polls once.
    For(Duration),
}

impl Wait {
    /// Check once without blocking.
    pub const POLL: Wait = Wait::For(Duration::ZERO);

    /// Bounded wait of `millis` milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Wait::For(Duration::from_millis(millis))
    }

    /// Bound passed to the driver; `None` means no timeout.
    pub fn timeout(self) -> Option<Duration> {
        match self {
            Wait::Forever => None,
            Wait::For(duration) => Some(duration),
        }
    }
}

impl From<Duration> for Wait {
    fn from(duration: Duration) -> Self {
        Wait::For(duration)
    }
}

impl From<Option<Duration>> for Wait {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Wait::Forever, Wait::For)
    }
}

/// Dimensions and chunk metadata of one frame.
///
/// Chunk fields are `None` when the camera could not enable that chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Buffer pixel format.
    pub pixel_format: PixelFormat,
    /// Chunk frame counter.
    pub frame_id: Option<u64>,
    /// Chunk timestamp in nanoseconds (device clock).
    pub timestamp_ns: Option<u64>,
    /// Chunk exposure time in microseconds.
    pub exposure_us: Option<f64>,
}

impl FrameMeta {
    fn from_info(info: &FrameInfo, camera: &Camera) -> Self {
        let chunks = camera.chunks();
        Self {
            width: info.width,
            height: info.height,
            pixel_format: info.pixel_format,
            frame_id: chunks
                .is_active(ChunkKind::FrameId)
                .then_some(info.frame_id),
            timestamp_ns: chunks
                .is_active(ChunkKind::Timestamp)
                .then_some(info.timestamp_ns),
            exposure_us: chunks
                .is_active(ChunkKind::ExposureTime)
                .then_some(info.exposure_us),
        }
    }

    /// Samples in a tightly packed copy of the frame.
    pub fn sample_count(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.channels()
    }
}

/// Frames pulled from one device and not yet given back.
#[derive(Debug, Default)]
pub(crate) struct FrameLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    outstanding: HashSet<FrameHandle>,
    closed: bool,
}

impl FrameLedger {
    /// Record a pulled frame. `false` once the device has been torn down.
    fn track(&self, frame: FrameHandle) -> bool {
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }
        state.outstanding.insert(frame)
    }

    /// Run `access` while `frame` cannot be reclaimed. `None` if it already was.
    fn while_held<R>(&self, frame: FrameHandle, access: impl FnOnce() -> R) -> Option<R> {
        let state = self.inner.lock();
        state.outstanding.contains(&frame).then(access)
    }

    /// Stop tracking `frame` and run `release` in the same critical section.
    fn give_back<R>(&self, frame: FrameHandle, release: impl FnOnce() -> R) -> Option<R> {
        let mut state = self.inner.lock();
        state.outstanding.remove(&frame).then(release)
    }

    /// Close the ledger and hand back every frame still outstanding.
    pub(crate) fn close(&self) -> Vec<FrameHandle> {
        let mut state = self.inner.lock();
        state.closed = true;
        state.outstanding.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().outstanding.len()
    }
}

/// A pulled frame whose buffer still belongs to the driver.
pub struct Frame {
    handle: FrameHandle,
    driver: Arc<dyn NativeDriver>,
    session: Arc<DeviceSession>,
    info: FrameInfo,
    meta: FrameMeta,
    released: bool,
}

impl Frame {
    /// Dimensions and chunk metadata.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.meta.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.meta.height
    }

    /// Buffer pixel format.
    pub fn pixel_format(&self) -> PixelFormat {
        self.meta.pixel_format
    }

    /// Raw driver handle. Still owned by this frame.
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// Run `visit` over the raw native buffer.
    pub fn with_data<R>(&self, visit: impl FnOnce(&[u8]) -> R) -> SpinResult<R> {
        let mut visit = Some(visit);
        let mut result = None;
        self.session
            .frames()
            .while_held(self.handle, || {
                self.driver.with_frame_data(self.handle, &mut |data: &[u8]| {
                    if let Some(visit) = visit.take() {
                        result = Some(visit(data));
                    }
                })
            })
            .ok_or(SpinError::ClosedHandle { kind: "frame" })?
            .map_err(|status| SpinError::native("frame_data", status))?;
        result.ok_or_else(|| SpinError::native("frame_data", crate::native::Status::NO_DATA))
    }

    /// Write the frame with the driver's native encoder.
    pub fn save(&self, path: &Path, format: ImageFileFormat) -> SpinResult<()> {
        self.session
            .frames()
            .while_held(self.handle, || self.driver.frame_save(self.handle, path, format))
            .ok_or(SpinError::ClosedHandle { kind: "frame" })?
            .map_err(|status| SpinError::native("frame_save", status))
    }

    /// Return the buffer to the driver now.
    ///
    /// Fails with `ClosedHandle` if the camera was released first; the buffer
    /// was given back then.
    pub fn release(mut self) -> SpinResult<()> {
        self.released = true;
        self.session
            .frames()
            .give_back(self.handle, || self.driver.frame_release(self.handle))
            .ok_or(SpinError::ClosedHandle { kind: "frame" })?
            .map_err(|status| SpinError::native("frame_release", status))
    }

    /// Detach the native buffer. The caller becomes responsible for
    /// `NativeDriver::frame_release`, and must do so before the camera is
    /// released.
    pub fn into_handle(mut self) -> FrameHandle {
        self.released = true;
        self.session.frames().give_back(self.handle, || ());
        self.handle
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self
            .session
            .frames()
            .give_back(self.handle, || self.driver.frame_release(self.handle))
        {
            Some(Ok(())) => {}
            Some(Err(status)) => tracing::warn!(%status, "Failed to release frame buffer"),
            None => tracing::debug!(frame = ?self.handle, "Frame was reclaimed at camera release"),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("handle", &self.handle)
            .field("meta", &self.meta)
            .field("released", &self.released)
            .finish()
    }
}

/// Destination sample type for [`copy_frame`].
pub trait Pixel: Copy + Default + Send + 'static {
    /// Raw magnitude, saturated to the type's range.
    fn from_raw(value: u32) -> Self;
    /// `fraction` in `[0, 1]` of the type's range (floats store it directly).
    fn from_fraction(fraction: f64) -> Self;
}

macro_rules! int_pixel {
    ($($ty:ty),*) => {$(
        impl Pixel for $ty {
            fn from_raw(value: u32) -> Self {
                value.min(<$ty>::MAX as u32) as $ty
            }

            fn from_fraction(fraction: f64) -> Self {
                (fraction * <$ty>::MAX as f64).round() as $ty
            }
        }
    )*};
}

int_pixel!(u8, u16, u32);

impl Pixel for f32 {
    fn from_raw(value: u32) -> Self {
        value as f32
    }

    fn from_fraction(fraction: f64) -> Self {
        fraction as f32
    }
}

impl Pixel for f64 {
    fn from_raw(value: u32) -> Self {
        value as f64
    }

    fn from_fraction(fraction: f64) -> Self {
        fraction
    }
}

/// Copy the frame's pixels into `dest`, row-major and tightly packed.
///
/// With `normalize`, each sample becomes its fraction of the pixel format's
/// maximum magnitude. Returns the number of samples written.
pub fn copy_frame<T: Pixel>(frame: &Frame, dest: &mut [T], normalize: bool) -> SpinResult<usize> {
    let format = frame.info.pixel_format;
    let samples = frame.meta.sample_count();
    if dest.len() < samples {
        return Err(SpinError::InvalidArgument(format!(
            "destination holds {} samples, frame needs {}",
            dest.len(),
            samples
        )));
    }

    let row_samples = frame.info.width as usize * format.channels();
    let row_bytes = row_samples * format.bytes_per_sample();
    let stride = if frame.info.stride == 0 {
        row_bytes
    } else {
        frame.info.stride
    };
    if stride < row_bytes {
        return Err(SpinError::InvalidArgument(format!(
            "stride {stride} shorter than row ({row_bytes} bytes)"
        )));
    }
    let height = frame.info.height as usize;
    let max = f64::from(format.max_value());

    frame.with_data(|data| {
        let needed = if height == 0 {
            0
        } else {
            (height - 1) * stride + row_bytes
        };
        if data.len() < needed {
            return Err(SpinError::IncompleteFrame {
                image_status: image_status::DATA_INCOMPLETE,
            });
        }

        let convert = |raw: u32| {
            if normalize {
                T::from_fraction((f64::from(raw) / max).min(1.0))
            } else {
                T::from_raw(raw)
            }
        };

        for row in 0..height {
            let src = &data[row * stride..row * stride + row_bytes];
            let out = &mut dest[row * row_samples..(row + 1) * row_samples];
            if format.bytes_per_sample() == 1 {
                for (o, &b) in out.iter_mut().zip(src) {
                    *o = convert(u32::from(b));
                }
            } else {
                for (o, pair) in out.iter_mut().zip(src.chunks_exact(2)) {
                    *o = convert(u32::from(u16::from_le_bytes([pair[0], pair[1]])));
                }
            }
        }
        Ok(samples)
    })?
}

/// Completeness check and geometry of a freshly pulled frame.
fn inspect(driver: &dyn NativeDriver, handle: FrameHandle, serial: &str) -> SpinResult<FrameInfo> {
    let complete = driver
        .frame_is_complete(handle)
        .map_err(|status| SpinError::native("frame_is_complete", status))?;
    if !complete {
        let image_status = driver
            .frame_get_status(handle)
            .unwrap_or(image_status::UNKNOWN_ERROR);
        tracing::debug!(serial, image_status, "Incomplete frame dropped");
        return Err(SpinError::IncompleteFrame { image_status });
    }
    driver
        .frame_info(handle)
        .map_err(|status| SpinError::native("frame_info", status))
}

/// Pixels copied out of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Samples per pixel.
    pub channels: usize,
    /// Row-major samples, channels interleaved.
    pub data: Vec<T>,
    /// Metadata of the source frame.
    pub meta: FrameMeta,
}

impl<T: Pixel> Image<T> {
    /// Sample at column `x`, row `y`, channel `c`.
    pub fn sample(&self, x: u32, y: u32, c: usize) -> Option<T> {
        if x >= self.width || y >= self.height || c >= self.channels {
            return None;
        }
        let index = (y as usize * self.width as usize + x as usize) * self.channels + c;
        self.data.get(index).copied()
    }
}

impl Camera {
    /// Pull the next frame.
    ///
    /// Incomplete frames are returned to the driver before
    /// [`SpinError::IncompleteFrame`] is reported.
    pub fn pull_frame(&self, wait: Wait) -> SpinResult<Frame> {
        let device = self.device()?;
        let driver = self.manager().driver().clone();
        let session = self.session().clone();
        let handle = driver
            .get_next_frame(device, wait.timeout())
            .map_err(|status| SpinError::native_wait("pull_frame", status, wait.timeout()))?;

        if !session.frames().track(handle) {
            if let Err(status) = driver.frame_release(handle) {
                tracing::debug!(%status, "Failed to release frame pulled during release");
            }
            return Err(SpinError::ClosedHandle { kind: "camera" });
        }

        let inspected = session
            .frames()
            .while_held(handle, || inspect(driver.as_ref(), handle, self.serial()))
            .unwrap_or(Err(SpinError::ClosedHandle { kind: "frame" }));
        let info = match inspected {
            Ok(info) => info,
            Err(err) => {
                let released = session
                    .frames()
                    .give_back(handle, || driver.frame_release(handle));
                if let Some(Err(status)) = released {
                    tracing::warn!(%status, "Failed to release rejected frame");
                }
                return Err(err);
            }
        };

        let meta = FrameMeta::from_info(&info, self);
        tracing::trace!(serial = %self.serial(), frame_id = ?meta.frame_id, "Frame pulled");

        Ok(Frame {
            handle,
            driver,
            session,
            info,
            meta,
            released: false,
        })
    }

    /// [`pull_frame`](Self::pull_frame) with the configured default wait.
    pub fn next_frame(&self) -> SpinResult<Frame> {
        self.pull_frame(self.manager().config().acquisition.default_wait())
    }

    /// [`get_image`](Self::get_image) with the configured default wait and
    /// `acquisition.normalize`.
    pub fn next_image<T: Pixel>(&self) -> SpinResult<Image<T>> {
        let acquisition = &self.manager().config().acquisition;
        self.get_image(acquisition.default_wait(), acquisition.normalize)
    }

    /// Pull a frame, copy it into a new image and release the buffer.
    pub fn get_image<T: Pixel>(&self, wait: Wait, normalize: bool) -> SpinResult<Image<T>> {
        let frame = self.pull_frame(wait)?;
        let meta = frame.meta().clone();
        let mut data = vec![T::default(); meta.sample_count()];
        copy_frame(&frame, &mut data, normalize)?;
        frame.release()?;
        Ok(Image {
            width: meta.width,
            height: meta.height,
            channels: meta.pixel_format.channels(),
            data,
            meta,
        })
    }

    /// Pull a frame into a caller-owned buffer and release it.
    pub fn get_image_into<T: Pixel>(
        &self,
        dest: &mut [T],
        wait: Wait,
        normalize: bool,
    ) -> SpinResult<FrameMeta> {
        let frame = self.pull_frame(wait)?;
        copy_frame(&frame, dest, normalize)?;
        let meta = frame.meta().clone();
        frame.release()?;
        Ok(meta)
    }

    /// Pull a frame and write it with the driver's native encoder.
    ///
    /// `format` defaults to the one implied by the file extension.
    pub fn save_image(
        &self,
        path: impl AsRef<Path>,
        format: Option<ImageFileFormat>,
        wait: Wait,
    ) -> SpinResult<FrameMeta> {
        let path = path.as_ref();
        let format = format
            .or_else(|| ImageFileFormat::from_path(path))
            .ok_or_else(|| {
                SpinError::InvalidArgument(format!(
                    "cannot infer image format from {}",
                    path.display()
                ))
            })?;
        let frame = self.pull_frame(wait)?;
        frame.save(path, format)?;
        let meta = frame.meta().clone();
        frame.release()?;
        tracing::debug!(path = %path.display(), ?format, "Frame saved");
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_bounds() {
        assert_eq!(Wait::Forever.timeout(), None);
        assert_eq!(Wait::POLL.timeout(), Some(Duration::ZERO));
        assert_eq!(Wait::from(None), Wait::Forever);
        assert_eq!(Wait::from_millis(5), Wait::For(Duration::from_millis(5)));
    }

    #[test]
    fn integer_pixels_saturate_and_scale() {
        assert_eq!(u8::from_raw(4095), 255);
        assert_eq!(u16::from_raw(4095), 4095);
        assert_eq!(u8::from_fraction(1.0), 255);
        assert_eq!(u16::from_fraction(0.5), 32768);
        assert_eq!(u32::from_fraction(0.0), 0);
    }

    #[test]
    fn float_pixels_keep_fraction() {
        assert_eq!(f32::from_fraction(1.0), 1.0);
        assert_eq!(f64::from_raw(4095), 4095.0);
    }
}
