//! Simulated beamline devices.
//!
//! Drivers in this crate implement the driver contract of `beamline-core`
//! without hardware: parameters are backed by in-memory state, operations
//! send their messages on the device bus, and timing follows
//! [`SimulationMode`].
//!
//! # Available drivers
//!
//! - [`DummyDevice`] - a single integer `value`
//! - [`Motor`] - linear (mm) or rotation (deg) axis with hard limits, optionally
//!   continuous with a signed `velocity`
//! - [`Camera`] - area detector with owner-only trigger mode
//! - [`Shutter`] - open/closed beam shutter
//! - [`Monochromator`] - photon energy with derived wavelength
//!
//! # Building from configuration
//!
//! ```rust
//! use beamline_core::bus::default_bus;
//! use beamline_core::config::BeamlineConfig;
//! use beamline_driver_dummy::build_devices;
//!
//! let config: BeamlineConfig = toml::from_str(
//!     r#"
//!     [[devices]]
//!     id = "stage-x"
//!     type = "motor"
//!     "#,
//! )?;
//! let devices = build_devices(&config, default_bus())?;
//! assert_eq!(devices[0].0, "stage-x");
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod camera;
pub mod common;
pub mod dummy;
pub mod factory;
pub mod monochromator;
pub mod motor;
pub mod shutter;

pub use camera::{Camera, CameraAsync, CameraSettings, Frame, TriggerMode};
pub use common::{SimRng, SimulationMode};
pub use dummy::{DummyDevice, DummyDeviceAsync};
pub use factory::{build_devices, DriverFactory, DriverInstance, DriverRegistry};
pub use monochromator::{Monochromator, MonochromatorAsync, MonochromatorSettings};
pub use motor::{AxisKind, Motor, MotorAsync, MotorSettings, MotorState};
pub use shutter::{Shutter, ShutterAsync, ShutterSettings};
