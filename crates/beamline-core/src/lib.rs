//! `beamline-core`
//!
//! Synchronous, thread-safe access to hardware device parameters.
//!
//! A device (motor, camera, shutter, pump) is a named collection of
//! [`Parameter`]s. Each parameter validates writes against ownership,
//! capability, unit and limits before calling into the driver, and announces
//! every successful write on a [`NotificationBus`]. Device operations can be
//! moved onto a bounded [`WorkerPool`] with [`AsyncWrapper`], and several
//! devices can be locked together with a [`MultiLock`].
//!
//! ## Modules
//!
//! - [`units`]: units, quantities and the unit-compatibility predicate
//! - [`bus`]: keyed publish/subscribe and the default [`Dispatcher`]
//! - [`messaging`]: message kinds and the [`MessageSource`] capability
//! - [`parameter`]: [`Parameter`] and its write pipeline
//! - [`device`]: [`Device`], accessor generation, stash/restore
//! - [`scope`]: [`MultiLock`] over [`ScopedResource`]s
//! - [`executor`]: [`WorkerPool`], [`TaskHandle`], [`AsyncWrapper`]
//! - [`config`] / [`logging`]: Figment configuration and tracing setup
//!
//! ## Example
//!
//! ```rust
//! use beamline_core::{Device, Parameter, Quantity};
//! use beamline_core::units::MILLIMETER;
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! let cell = Arc::new(Mutex::new(Quantity::new(0.0, MILLIMETER)));
//! let (r, w) = (cell.clone(), cell.clone());
//! let position = Parameter::new("position")?
//!     .with_getter(move || Ok(*r.lock()))
//!     .with_setter(move |v| {
//!         *w.lock() = v;
//!         Ok(())
//!     })
//!     .with_unit(MILLIMETER);
//!
//! let stage = Device::new("stage").with_parameter(position)?;
//! stage
//!     .parameter::<Quantity>("position")?
//!     .set(Quantity::new(2.0, MILLIMETER))?;
//! println!("{stage}");
//! # Ok::<(), beamline_core::DeviceError>(())
//! ```

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod logging;
pub mod messaging;
pub mod parameter;
pub mod scope;
pub mod units;

pub use bus::{Callback, Dispatcher, NotificationBus, SenderId};
pub use device::{AsDevice, Device};
pub use error::{DeviceError, Result};
pub use executor::{AsyncWrapper, TaskHandle, WorkerPool};
pub use messaging::{MessageKind, MessageSource, CHANGED};
pub use parameter::{Parameter, ParameterAny};
pub use scope::{MultiLock, ScopedResource};
pub use units::{ParameterValue, Quantity, Unit};
