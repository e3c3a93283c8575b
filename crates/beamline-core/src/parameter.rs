//! Parameter<T> - validated, observable device attributes
//!
//! A parameter is a named attribute of a device, such as a motor position or a
//! camera exposure time. It carries metadata (unit, limiter, documentation)
//! and forwards reads and writes to driver callables:
//!
//! - the **getter** reads the current value from hardware,
//! - the **setter** writes a value to hardware.
//!
//! Each is optional; its presence is what makes a parameter readable or
//! writable.
//!
//! # Write Pipeline
//!
//! ```text
//! param.set_as(value, requester)
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 1. owner_only: requester must be the owner        │ ─► WriteAccess
//! │ 2. setter present                                 │ ─► WriteAccess
//! │ 3. unit: value compatible with declared unit      │ ─► Unit
//! │ 4. limiter(value) == true                         │ ─► Limit
//! └───────────────────────────────────────────────────┘
//!         │ (nothing has touched hardware yet)
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 5. setter(value)                                  │ ─► driver error, as is
//! └───────────────────────────────────────────────────┘
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 6. send CHANGED with the parameter as sender      │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! Either every check passes and the setter runs exactly once followed by
//! exactly one notification, or nothing reaches the driver and nothing is
//! published.
//!
//! # Example
//!
//! ```rust
//! use beamline_core::parameter::Parameter;
//! use beamline_core::units::{Quantity, MILLIMETER};
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! let stored = Arc::new(Mutex::new(Quantity::new(0.0, MILLIMETER)));
//! let (r, w) = (stored.clone(), stored.clone());
//!
//! let position = Parameter::new("position")?
//!     .with_getter(move || Ok(*r.lock()))
//!     .with_setter(move |v| {
//!         *w.lock() = v;
//!         Ok(())
//!     })
//!     .with_unit(MILLIMETER)
//!     .with_range(Quantity::new(-10.0, MILLIMETER), Quantity::new(10.0, MILLIMETER));
//!
//! position.set(Quantity::new(5.0, MILLIMETER))?;
//! assert_eq!(position.get()?, Quantity::new(5.0, MILLIMETER));
//! assert!(position.set(Quantity::new(50.0, MILLIMETER)).is_err());
//! # Ok::<(), beamline_core::DeviceError>(())
//! ```

use once_cell::sync::{Lazy, OnceCell};
use regex_lite::Regex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::{default_bus, NotificationBus, SenderId};
use crate::error::{DeviceError, Result};
use crate::messaging::CHANGED;
use crate::units::{ParameterValue, Unit};

/// Driver read callable.
pub type Getter<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

/// Driver write callable.
pub type Setter<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

/// Predicate a candidate value must satisfy before it is written.
pub type Limiter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid regex"));

/// Check if a parameter `name` is a valid identifier.
pub fn parameter_name_valid(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Name of the generated accessor for a parameter (`motion-velocity` →
/// `motion_velocity`).
pub fn accessor_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Weak back-reference from a parameter to the device that registered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    id: SenderId,
    name: Arc<str>,
}

impl OwnerRef {
    pub fn new(id: SenderId, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Parameter<T>
// =============================================================================

/// A named attribute with optional read and write capability.
///
/// Clones share identity and owner; a clone is the same parameter.
pub struct Parameter<T: ParameterValue> {
    name: Arc<str>,
    id: SenderId,
    unit: Option<Unit>,
    limiter: Option<Limiter<T>>,
    owner_only: bool,
    getter: Option<Getter<T>>,
    setter: Option<Setter<T>>,
    doc: Option<Arc<str>>,
    owner: Arc<OnceCell<OwnerRef>>,
    bus: Arc<dyn NotificationBus>,
}

impl<T: ParameterValue> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            id: self.id,
            unit: self.unit,
            limiter: self.limiter.clone(),
            owner_only: self.owner_only,
            getter: self.getter.clone(),
            setter: self.setter.clone(),
            doc: self.doc.clone(),
            owner: self.owner.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<T: ParameterValue> fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("unit", &self.unit.map(|u| u.symbol()))
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("owner_only", &self.owner_only)
            .field("owner", &self.owner.get().map(OwnerRef::name))
            .finish_non_exhaustive()
    }
}

impl<T: ParameterValue> Parameter<T> {
    /// Placeholder parameter with no capabilities. Fails with
    /// [`DeviceError::InvalidName`] if `name` is not an identifier.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !parameter_name_valid(&name) {
            return Err(DeviceError::InvalidName(name));
        }

        Ok(Self {
            name: name.into(),
            id: SenderId::next(),
            unit: None,
            limiter: None,
            owner_only: false,
            getter: None,
            setter: None,
            doc: None,
            owner: Arc::new(OnceCell::new()),
            bus: default_bus(),
        })
    }

    /// Make the parameter readable through `getter`.
    pub fn with_getter(mut self, getter: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Make the parameter writable through `setter`.
    pub fn with_setter(mut self, setter: impl Fn(T) -> Result<()> + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Reject writes for which `limiter` returns false.
    pub fn with_limiter(mut self, limiter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    /// Limiter accepting `min <= value <= max`.
    ///
    /// Values that cannot be compared with the bounds are rejected.
    pub fn with_range(self, min: T, max: T) -> Self
    where
        T: PartialOrd,
    {
        self.with_limiter(move |v| *v >= min && *v <= max)
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into().into());
        self
    }

    /// Only accept writes that present the owning device's identity.
    pub fn owner_only(mut self) -> Self {
        self.owner_only = true;
        self
    }

    /// Publish change notifications on `bus` instead of the global dispatcher.
    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity used as sender of this parameter's notifications.
    pub fn sender_id(&self) -> SenderId {
        self.id
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn is_owner_only(&self) -> bool {
        self.owner_only
    }

    /// Device this parameter is registered with, if any.
    pub fn owner(&self) -> Option<&OwnerRef> {
        self.owner.get()
    }

    /// Return `true` if the parameter can be read.
    pub fn is_readable(&self) -> bool {
        self.getter.is_some()
    }

    /// Return `true` if the parameter can be written.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Read and return the current value.
    pub fn get(&self) -> Result<T> {
        let getter = self.getter.as_ref().ok_or_else(|| {
            warn!(parameter = %self.name, "Invalid read access");
            DeviceError::ReadAccess(self.name.to_string())
        })?;
        getter()
    }

    /// Write `value` without presenting an owner identity.
    pub fn set(&self, value: T) -> Result<()> {
        self.set_as(value, None)
    }

    /// Write `value`, presenting `requester` for owner-only checks.
    ///
    /// Once the setter has returned successfully, a [`CHANGED`] message is
    /// sent with this parameter as sender.
    pub fn set_as(&self, value: T, requester: Option<SenderId>) -> Result<()> {
        if self.owner_only && requester != self.owner.get().map(OwnerRef::id) {
            warn!(parameter = %self.name, ?requester, "Invalid write access by non-owner");
            return Err(DeviceError::WriteAccess(self.name.to_string()));
        }

        let Some(setter) = &self.setter else {
            warn!(parameter = %self.name, "Invalid write access");
            return Err(DeviceError::WriteAccess(self.name.to_string()));
        };

        if let Some(unit) = &self.unit {
            if !value.is_compatible(unit) {
                return Err(DeviceError::Unit {
                    parameter: self.name.to_string(),
                    unit: unit.to_string(),
                    value: value.to_string(),
                });
            }
        }

        if let Some(limiter) = &self.limiter {
            if !limiter(&value) {
                return Err(DeviceError::Limit {
                    parameter: self.name.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let device = self.owner.get().map_or("<unowned>", OwnerRef::name);
        info!(device, parameter = %self.name, value = %value, "try");
        setter(value.clone())?;
        info!(device, parameter = %self.name, value = %value, "set");

        self.notify();
        Ok(())
    }

    /// Notify that the parameter value has changed.
    pub fn notify(&self) {
        self.bus.send(self.id, &CHANGED);
    }

    fn attach_owner(&self, owner: OwnerRef) -> Result<()> {
        self.owner.set(owner).map_err(|_| DeviceError::AlreadyOwned {
            parameter: self.name.to_string(),
            owner: self
                .owner
                .get()
                .map_or_else(String::new, |o| o.name().to_string()),
        })
    }
}

// =============================================================================
// ParameterAny - type-erased access for device collections
// =============================================================================

/// Type-erased parameter, as stored by a [`Device`](crate::device::Device).
///
/// Values cross this boundary as JSON; use
/// [`Device::parameter`](crate::device::Device::parameter) for typed access.
pub trait ParameterAny: Send + Sync {
    fn name(&self) -> &str;

    fn sender_id(&self) -> SenderId;

    fn unit(&self) -> Option<Unit>;

    fn doc(&self) -> Option<&str>;

    fn is_readable(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn is_owner_only(&self) -> bool;

    fn owner(&self) -> Option<OwnerRef>;

    /// Set the owner back-reference. Fails if already attached.
    fn attach(&self, owner: OwnerRef) -> Result<()>;

    /// Read the current value as JSON.
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Deserialize `value` and write it through the full pipeline.
    fn set_json(&self, value: serde_json::Value, requester: Option<SenderId>) -> Result<()>;

    /// Read the current value rendered for humans.
    fn display_value(&self) -> Result<String>;

    /// Type name of the value, e.g. `beamline_core::units::Quantity`.
    fn type_name(&self) -> &'static str;

    /// For downcasting to the concrete `Parameter<T>`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: ParameterValue> ParameterAny for Parameter<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn sender_id(&self) -> SenderId {
        self.id
    }

    fn unit(&self) -> Option<Unit> {
        self.unit
    }

    fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    fn is_readable(&self) -> bool {
        Parameter::is_readable(self)
    }

    fn is_writable(&self) -> bool {
        Parameter::is_writable(self)
    }

    fn is_owner_only(&self) -> bool {
        self.owner_only
    }

    fn owner(&self) -> Option<OwnerRef> {
        self.owner.get().cloned()
    }

    fn attach(&self, owner: OwnerRef) -> Result<()> {
        self.attach_owner(owner)
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.get()?)?)
    }

    fn set_json(&self, value: serde_json::Value, requester: Option<SenderId>) -> Result<()> {
        let typed: T = serde_json::from_value(value)?;
        self.set_as(typed, requester)
    }

    fn display_value(&self) -> Result<String> {
        Ok(self.get()?.to_string())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
