//! Error types for the Spinnaker lifecycle layer.
//!
//! `SpinError` is the single error type returned by every fallible operation in
//! this crate. It is built with `thiserror` and keeps the native status code
//! attached wherever one exists, so callers can branch on it.
//!
//! ## Error Hierarchy
//!
//! - **`Initialization`**: the system handle (or a precondition of a camera,
//!   such as an initialized system) could not be obtained.
//! - **`DeviceInit`**: a device handle was null or failed to initialize.
//! - **`ClosedHandle`**: the camera or system was already released.
//! - **`IncompleteFrame`**: a frame arrived truncated; the buffer has already
//!   been returned to the driver.
//! - **`Timeout`**: a bounded wait ran out.
//! - **`ResourceInUse`**: the driver reported `RESOURCE_IN_USE`. Expected when
//!   several handle objects drive the same physical camera; callers usually
//!   retry.
//! - **`DeviceCommand`**: every other native failure.
//!
//! Release paths never return these: teardown is best-effort and only logs.

use crate::native::Status;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SpinResult<T> = std::result::Result<T, SpinError>;

/// Primary error type.
#[derive(Error, Debug)]
pub enum SpinError {
    /// System handle acquisition failed or returned null.
    #[error("Initialization error in {operation}: {reason}")]
    Initialization {
        /// Step that failed.
        operation: &'static str,
        /// Human-readable cause.
        reason: String,
        /// Native status, when the driver reported one.
        status: Option<Status>,
    },

    /// Device handle was null or the device failed to initialize.
    #[error("Device initialization failed ({operation}): {status}")]
    DeviceInit {
        /// Step that failed.
        operation: &'static str,
        /// Native status.
        status: Status,
    },

    /// Operation attempted on a released handle.
    #[error("{kind} handle is closed")]
    ClosedHandle {
        /// `"system"`, `"camera"` or `"frame"`.
        kind: &'static str,
    },

    /// Frame arrived but is incomplete; carries the driver's image status.
    #[error("Incomplete frame (image status {image_status})")]
    IncompleteFrame {
        /// See [`image_status`](crate::native::image_status).
        image_status: i32,
    },

    /// Bounded wait exceeded.
    #[error("Timed out in {operation} after {waited:?}")]
    Timeout {
        /// Operation that gave up.
        operation: &'static str,
        /// Bound that was exceeded, if known.
        waited: Option<Duration>,
    },

    /// Native `RESOURCE_IN_USE`.
    #[error("Resource in use during {operation}")]
    ResourceInUse {
        /// Driver call that reported it.
        operation: String,
    },

    /// Any other native failure.
    #[error("Device command '{operation}' failed: {status}")]
    DeviceCommand {
        /// Driver call or node name.
        operation: String,
        /// Native status.
        status: Status,
    },

    /// Caller-side misuse (bad index, destination too small, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Figment could not load or extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task spawned by the async wrappers panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SpinError {
    /// Map a native status from `operation` onto the taxonomy.
    pub fn native(operation: impl Into<String>, status: Status) -> Self {
        let operation = operation.into();
        match status {
            Status::RESOURCE_IN_USE => SpinError::ResourceInUse { operation },
            _ => SpinError::DeviceCommand { operation, status },
        }
    }

    /// Like [`SpinError::native`], but `TIMEOUT` becomes [`SpinError::Timeout`].
    pub fn native_wait(
        operation: &'static str,
        status: Status,
        waited: Option<Duration>,
    ) -> Self {
        if status == Status::TIMEOUT {
            SpinError::Timeout { operation, waited }
        } else {
            SpinError::native(operation, status)
        }
    }

    /// Native status code carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            SpinError::Initialization { status, .. } => *status,
            SpinError::DeviceInit { status, .. } | SpinError::DeviceCommand { status, .. } => {
                Some(*status)
            }
            SpinError::ResourceInUse { .. } => Some(Status::RESOURCE_IN_USE),
            SpinError::Timeout { .. } => Some(Status::TIMEOUT),
            _ => None,
        }
    }

    /// Whether retrying (or re-opening) can reasonably succeed.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            SpinError::ClosedHandle { .. }
                | SpinError::IncompleteFrame { .. }
                | SpinError::Timeout { .. }
                | SpinError::ResourceInUse { .. }
        )
    }

    /// Whether the driver reported the resource busy.
    pub fn is_resource_in_use(&self) -> bool {
        matches!(self, SpinError::ResourceInUse { .. })
    }

    /// Whether a bounded wait ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SpinError::Timeout { .. })
    }
}

impl From<figment::Error> for SpinError {
    fn from(err: figment::Error) -> Self {
        SpinError::Config(Box::new(err))
    }
}
