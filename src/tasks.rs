//! Async wrappers for the blocking operations.
//!
//! Device open, `pull_frame` without a bound and reset-and-wait can block for
//! a long time. These wrappers move them onto tokio's blocking pool so they
//! can be awaited from an async runtime without stalling a worker thread.

use crate::acquisition::{Frame, Image, Pixel, Wait};
use crate::camera::Camera;
use crate::discovery::CameraList;
use crate::error::{SpinError, SpinResult};
use crate::system::SystemManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

/// [`CameraList::enumerate`] on the blocking pool.
pub async fn enumerate(manager: Arc<SystemManager>) -> SpinResult<CameraList> {
    task::spawn_blocking(move || CameraList::enumerate(&manager)).await?
}

/// Enumerate and open the camera with `serial`.
pub async fn open_serial(manager: Arc<SystemManager>, serial: String) -> SpinResult<Camera> {
    task::spawn_blocking(move || CameraList::enumerate(&manager)?.open_serial(&serial)).await?
}

/// [`Camera::pull_frame`] on the blocking pool.
pub async fn pull_frame(camera: Arc<Camera>, wait: Wait) -> SpinResult<Frame> {
    task::spawn_blocking(move || camera.pull_frame(wait)).await?
}

/// [`Camera::get_image`] on the blocking pool.
pub async fn get_image<T: Pixel>(
    camera: Arc<Camera>,
    wait: Wait,
    normalize: bool,
) -> SpinResult<Image<T>> {
    task::spawn_blocking(move || camera.get_image::<T>(wait, normalize)).await?
}

/// Reset the camera and wait for it to come back.
pub async fn reset_and_wait(camera: Arc<Camera>, timeout: Option<Duration>) -> SpinResult<Camera> {
    let reopened = task::spawn_blocking(move || camera.reset(true, timeout)).await??;
    reopened.ok_or_else(|| SpinError::Timeout {
        operation: "reset",
        waited: timeout,
    })
}

/// Release off the async thread; teardown may wait on the driver.
pub async fn release(camera: Arc<Camera>) -> SpinResult<()> {
    task::spawn_blocking(move || camera.release()).await?;
    Ok(())
}
