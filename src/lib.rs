//! # Spinnaker camera driver
//!
//! Lifecycle-safe access to FLIR/Teledyne Spinnaker machine-vision cameras.
//! Parameter access and image copies are thin; the crate exists to get the
//! ownership of the driver's native handles right when many objects, threads
//! and `Drop` calls share them.
//!
//! ## Crate Structure
//!
//! - **`native`**: The [`NativeDriver`] trait every driver call goes through,
//!   plus the mock backend (feature `mock`) and the real SDK backend (feature
//!   `spinnaker_sdk`).
//! - **`registry`**: Live camera instances per serial and the deferred system
//!   release slot, each behind its own poll-acquired lock.
//! - **`system`**: The process-wide system singleton. Release is deferred while
//!   any camera is live and retried by the last camera release.
//! - **`camera`**: Camera handle objects. Several may alias one physical
//!   device; only the last release tears it down.
//! - **`acquisition`**: Frame pulls with blocking or bounded waits, RAII frame
//!   buffers and pixel copies.
//! - **`discovery`**: [`CameraList`] enumeration.
//! - **`names`**: Firmware node-name variants and chunk selector probing.
//! - **`tasks`**: `async` wrappers over the blocking operations.
//! - **`config`** / **`logging`** / **`error`**: Figment configuration, tracing
//!   setup and the [`SpinError`] taxonomy.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "mock")]
//! # fn main() -> Result<(), daq_driver_spinnaker::SpinError> {
//! use daq_driver_spinnaker::native::mock::MockDriver;
//! use daq_driver_spinnaker::{CameraList, SystemManager, Wait};
//! use std::sync::Arc;
//!
//! let manager = SystemManager::with_defaults(Arc::new(MockDriver::new()));
//! let cameras = CameraList::enumerate(&manager)?;
//! let camera = cameras.get(0)?;
//! camera.start()?;
//! let image = camera.get_image::<u16>(Wait::from_millis(500), false)?;
//! println!("{}x{} frame {:?}", image.width, image.height, image.meta.frame_id);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "mock"))]
//! # fn main() {}
//! ```

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod names;
pub mod native;
pub mod registry;
pub mod system;
pub mod tasks;

pub use acquisition::{copy_frame, Frame, FrameMeta, Image, Pixel, Wait};
pub use camera::{Camera, CameraState};
pub use config::DriverConfig;
pub use discovery::CameraList;
pub use error::{SpinError, SpinResult};
pub use native::{NativeDriver, PixelFormat, PropertyValue, Status};
pub use system::{System, SystemManager};
