//! Device - a named collection of parameters with an advisory lock
//!
//! A [`Device`] holds its parameters in insertion order and owns every one of
//! them: adding a parameter sets its owner back-reference, after which the
//! parameter can never join another device.
//!
//! Driver types compose a `Device` and expose it through [`AsDevice`]. Typed
//! accessor methods for their parameters are generated with
//! [`parameter_accessors!`](crate::parameter_accessors).
//!
//! # Locking
//!
//! The device lock is advisory. Single-parameter access never takes it;
//! callers that need several reads and writes to happen together use
//! [`Device::lock`], [`Device::critical`] or a
//! [`MultiLock`](crate::scope::MultiLock) over several devices.

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::{default_bus, NotificationBus, SenderId};
use crate::error::{DeviceError, Result};
use crate::messaging::{MessageKind, MessageSource, MessageTable};
use crate::parameter::{accessor_name, OwnerRef, Parameter, ParameterAny};
use crate::scope::{ScopeExit, ScopedResource};
use crate::units::ParameterValue;

type Snapshot = Vec<(String, serde_json::Value)>;

/// A named, ordered collection of parameters.
pub struct Device {
    name: Arc<str>,
    id: SenderId,
    parameters: IndexMap<String, Arc<dyn ParameterAny>>,
    accessors: HashMap<String, String>,
    lock: Mutex<()>,
    bus: Arc<dyn NotificationBus>,
    messages: MessageTable,
    stash: Mutex<Vec<Snapshot>>,
}

impl Device {
    /// Empty device publishing on the process-wide bus.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into(),
            id: SenderId::next(),
            parameters: IndexMap::new(),
            accessors: HashMap::new(),
            lock: Mutex::new(()),
            bus: default_bus(),
            messages: MessageTable::new(),
            stash: Mutex::new(Vec::new()),
        }
    }

    /// Add every parameter in order. Fails on the first rejected one.
    pub fn with_parameters(
        mut self,
        parameters: impl IntoIterator<Item = Arc<dyn ParameterAny>>,
    ) -> Result<Self> {
        for parameter in parameters {
            self.insert(parameter)?;
        }
        Ok(self)
    }

    /// Builder form of [`Device::add_parameter`].
    pub fn with_parameter(mut self, parameter: impl ParameterAny + 'static) -> Result<Self> {
        self.add_parameter(parameter)?;
        Ok(self)
    }

    /// Publish device messages on `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Seed the message table with the kinds a driver type declares.
    pub fn with_messages(self, kinds: &[MessageKind]) -> Self {
        for kind in kinds {
            self.messages.register(kind.clone());
        }
        self
    }

    /// Register `parameter` and make this device its owner.
    ///
    /// Rejects a name (or accessor name) that is already taken, and a
    /// parameter that already belongs to a device.
    pub fn add_parameter(&mut self, parameter: impl ParameterAny + 'static) -> Result<()> {
        self.insert(Arc::new(parameter))
    }

    fn insert(&mut self, parameter: Arc<dyn ParameterAny>) -> Result<()> {
        let name = parameter.name().to_string();
        let accessor = accessor_name(&name);

        if self.parameters.contains_key(&name) || self.accessors.contains_key(&accessor) {
            return Err(DeviceError::DuplicateParameter {
                device: self.name.to_string(),
                parameter: name,
            });
        }

        parameter.attach(OwnerRef::new(self.id, self.name.clone()))?;
        debug!(device = %self.name, parameter = %name, "parameter added");

        self.accessors.insert(accessor, name.clone());
        self.parameters.insert(name, parameter);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the device as owner and message sender.
    pub fn id(&self) -> SenderId {
        self.id
    }

    /// Parameter called `name`.
    pub fn lookup(&self, name: &str) -> Result<&dyn ParameterAny> {
        self.parameters
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| DeviceError::Parameter(name.to_string()))
    }

    /// Parameter by name or accessor name (`motion_velocity` finds
    /// `motion-velocity`).
    pub fn resolve(&self, name: &str) -> Result<&dyn ParameterAny> {
        if let Ok(parameter) = self.lookup(name) {
            return Ok(parameter);
        }
        self.accessors
            .get(name)
            .and_then(|full| self.parameters.get(full))
            .map(|p| p.as_ref())
            .ok_or_else(|| DeviceError::Parameter(name.to_string()))
    }

    /// Typed parameter called `name`.
    pub fn parameter<T: ParameterValue>(&self, name: &str) -> Result<&Parameter<T>> {
        let erased = self.lookup(name)?;
        erased
            .as_any()
            .downcast_ref::<Parameter<T>>()
            .ok_or_else(|| DeviceError::TypeMismatch {
                parameter: name.to_string(),
                expected: std::any::type_name::<T>(),
                actual: erased.type_name(),
            })
    }

    /// Parameters in insertion order. Each call starts a fresh pass.
    pub fn iter(&self) -> Parameters<'_> {
        Parameters {
            inner: self.parameters.values(),
        }
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Read a parameter as JSON.
    pub fn get_json(&self, name: &str) -> Result<serde_json::Value> {
        self.resolve(name)?.get_json()
    }

    /// Write a parameter from JSON. No owner identity is presented, so
    /// owner-only parameters reject this.
    pub fn set_json(&self, name: &str, value: serde_json::Value) -> Result<()> {
        self.resolve(name)?.set_json(value, None)
    }

    /// Acquire the device lock until the guard is dropped.
    pub fn lock(&self) -> DeviceGuard<'_> {
        DeviceGuard {
            _guard: self.lock.lock(),
        }
    }

    /// Acquire the device lock if it is free.
    pub fn try_lock(&self) -> Option<DeviceGuard<'_>> {
        self.lock.try_lock().map(|guard| DeviceGuard { _guard: guard })
    }

    /// Run `body` while holding the device lock.
    pub fn critical<R>(&self, body: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.lock();
        body(self)
    }

    /// Two-column `Parameter`/`Value` table of every readable parameter,
    /// sorted by name.
    ///
    /// Each parameter is read independently. A failed read shows the error
    /// in its value cell.
    pub fn table(&self) -> String {
        let mut rows: Vec<(&str, String)> = self
            .iter()
            .filter(|p| p.is_readable())
            .map(|p| {
                let value = p.display_value().unwrap_or_else(|e| {
                    warn!(device = %self.name, parameter = p.name(), error = %e, "read failed");
                    format!("<{e}>")
                });
                (p.name(), value)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let width = rows
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max("Parameter".len());

        let mut out = format!(" {:<width$}  Value\n", "Parameter");
        for (name, value) in rows {
            out.push_str(&format!(" {name:<width$}  {value}\n"));
        }
        out
    }

    /// Save the values of every readable and writable parameter.
    ///
    /// Snapshots stack: each [`Device::restore`] pops the latest one.
    pub fn stash(&self) -> Result<()> {
        let snapshot = self
            .iter()
            .filter(|p| p.is_readable() && p.is_writable())
            .map(|p| Ok((p.name().to_string(), p.get_json()?)))
            .collect::<Result<Snapshot>>()?;

        debug!(device = %self.name, parameters = snapshot.len(), "stash");
        self.stash.lock().push(snapshot);
        Ok(())
    }

    /// Write back the most recently stashed values, as the owner.
    pub fn restore(&self) -> Result<()> {
        let snapshot = self
            .stash
            .lock()
            .pop()
            .ok_or_else(|| DeviceError::NothingStashed(self.name.to_string()))?;

        debug!(device = %self.name, parameters = snapshot.len(), "restore");
        for (name, value) in snapshot {
            self.lookup(&name)?.set_json(value, Some(self.id))?;
        }
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Iterator over a device's parameters.
pub struct Parameters<'a> {
    inner: indexmap::map::Values<'a, String, Arc<dyn ParameterAny>>,
}

impl<'a> Iterator for Parameters<'a> {
    type Item = &'a dyn ParameterAny;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|p| p.as_ref())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Parameters<'_> {}

impl<'a> IntoIterator for &'a Device {
    type Item = &'a dyn ParameterAny;
    type IntoIter = Parameters<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Held device lock.
pub struct DeviceGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ScopeExit for DeviceGuard<'_> {
    fn exit(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl MessageSource for Device {
    fn sender_id(&self) -> SenderId {
        self.id
    }

    fn bus(&self) -> &Arc<dyn NotificationBus> {
        &self.bus
    }

    fn message_table(&self) -> &MessageTable {
        &self.messages
    }
}

// =============================================================================
// AsDevice - driver types composing a Device
// =============================================================================

/// Access to the [`Device`] a driver type is built around.
pub trait AsDevice {
    fn device(&self) -> &Device;
}

impl AsDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl<D: AsDevice> ScopedResource for D {
    fn enter(&self) -> Result<Box<dyn ScopeExit + '_>> {
        Ok(Box::new(self.device().lock()))
    }
}

/// Generate typed accessor methods for parameters of a driver type.
///
/// Each entry names the getter, optionally the setter, the value type and the
/// parameter name. Setters write without an owner identity.
///
/// ```rust
/// use beamline_core::device::{AsDevice, Device};
/// use beamline_core::parameter::Parameter;
/// use beamline_core::parameter_accessors;
///
/// struct Lamp {
///     device: Device,
/// }
///
/// impl AsDevice for Lamp {
///     fn device(&self) -> &Device {
///         &self.device
///     }
/// }
///
/// parameter_accessors! {
///     Lamp {
///         power / set_power: bool => "power";
///     }
/// }
///
/// let power = Parameter::new("power")?
///     .with_getter(|| Ok(true))
///     .with_setter(|_| Ok(()));
/// let lamp = Lamp { device: Device::new("lamp").with_parameter(power)? };
/// assert!(lamp.power()?);
/// # Ok::<(), beamline_core::DeviceError>(())
/// ```
#[macro_export]
macro_rules! parameter_accessors {
    (
        $ty:ty {
            $( $getter:ident $( / $setter:ident )? : $value:ty => $name:literal; )*
        }
    ) => {
        impl $ty {
            $(
                #[doc = concat!("Read `", $name, "`.")]
                pub fn $getter(&self) -> $crate::error::Result<$value> {
                    $crate::device::AsDevice::device(self)
                        .parameter::<$value>($name)?
                        .get()
                }

                $(
                    #[doc = concat!("Write `", $name, "`.")]
                    pub fn $setter(&self, value: $value) -> $crate::error::Result<()> {
                        $crate::device::AsDevice::device(self)
                            .parameter::<$value>($name)?
                            .set(value)
                    }
                )?
            )*
        }
    };
}
