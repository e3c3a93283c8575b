//! Error types for parameter and device access.
//!
//! `DeviceError` is the single error type surfaced by the framework. Every
//! failure is local and synchronous: it is returned to the immediate caller,
//! or captured on a [`TaskHandle`](crate::executor::TaskHandle) when the call
//! went through the worker pool and returned from `wait()`.
//!
//! ## Error Hierarchy
//!
//! - **Lookup**: `Parameter`, `TypeMismatch`
//! - **Access**: `ReadAccess`, `WriteAccess`
//! - **Validation**: `Unit`, `Limit`, `InvalidName`
//! - **Registration**: `DuplicateParameter`, `AlreadyOwned`
//! - **Driver**: `Hardware`, `Other`
//! - **Execution**: `TaskFailed`, `ReleaseFailed`
//!
//! Nothing here is retried by the framework. Retry policy belongs to the
//! orchestration layer.

use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type Result<T, E = DeviceError> = std::result::Result<T, E>;

/// Primary error type for parameter and device access.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A parameter name was looked up that the device does not have.
    #[error("`{0}' is not a parameter")]
    Parameter(String),

    /// The parameter has no getter.
    #[error("parameter `{0}' cannot be read")]
    ReadAccess(String),

    /// The parameter has no setter, or the caller is not its owner.
    #[error("parameter `{0}' cannot be written")]
    WriteAccess(String),

    /// A value was passed whose unit is incompatible with the parameter unit.
    #[error("`{parameter}' can only receive values of unit {unit} but got {value}")]
    Unit {
        /// Parameter that rejected the value.
        parameter: String,
        /// Unit the parameter expects.
        unit: String,
        /// Rejected value, rendered for display.
        value: String,
    },

    /// The limiter rejected the value.
    #[error("{value} for `{parameter}' is out of range")]
    Limit {
        /// Parameter that rejected the value.
        parameter: String,
        /// Rejected value, rendered for display.
        value: String,
    },

    /// Parameter names must match `^[A-Za-z][A-Za-z0-9_-]*$`.
    #[error("{0} is not a valid parameter name")]
    InvalidName(String),

    /// A device already holds a parameter with this name or accessor name.
    #[error("device `{device}' already has a parameter `{parameter}'")]
    DuplicateParameter {
        /// Device the registration was attempted on.
        device: String,
        /// Colliding parameter name.
        parameter: String,
    },

    /// Parameters are attached to exactly one device and never reparented.
    #[error("parameter `{parameter}' is already owned by `{owner}'")]
    AlreadyOwned {
        /// Parameter being attached.
        parameter: String,
        /// Device that already owns it.
        owner: String,
    },

    /// Typed lookup asked for a different value type than the parameter holds.
    #[error("parameter `{parameter}' holds {actual}, not {expected}")]
    TypeMismatch {
        /// Parameter name.
        parameter: String,
        /// Requested value type.
        expected: &'static str,
        /// Actual value type.
        actual: &'static str,
    },

    /// Failure reported by a driver getter, setter or operation.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Generic value could not be converted to or from JSON.
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A pooled task panicked or was dropped before completing.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// One or more resources failed to release on multi-lock exit.
    ///
    /// Every release is attempted before this is reported.
    #[error("Release failed for {} resource(s)", .0.len())]
    ReleaseFailed(Vec<DeviceError>),

    /// `restore()` was called without a matching `stash()`.
    #[error("device `{0}' has no stashed parameter values")]
    NothingStashed(String),

    /// Escape hatch for drivers built on `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeviceError {
    /// Shorthand for driver failures.
    pub fn hardware(message: impl Into<String>) -> Self {
        Self::Hardware(message.into())
    }

    /// True for the errors raised by the validation pipeline before any
    /// driver code runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ReadAccess(_) | Self::WriteAccess(_) | Self::Unit { .. } | Self::Limit { .. }
        )
    }
}
