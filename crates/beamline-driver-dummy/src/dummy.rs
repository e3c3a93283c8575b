//! Device with a single integer `value`.

use beamline_core::bus::{default_bus, NotificationBus};
use beamline_core::{async_interface, parameter_accessors, AsDevice, Device, Parameter, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{pause, SimRng, SimulationMode};

/// Writes to `value` take up to 20 ms in realistic mode.
const MAX_WRITE_DELAY: Duration = Duration::from_millis(20);

/// A device with one readable and writable `value`.
pub struct DummyDevice {
    device: Device,
}

impl DummyDevice {
    /// Instant-mode device named `dummy` on the process-wide bus.
    pub fn new() -> Result<Self> {
        Self::with_options("dummy", SimulationMode::Instant, default_bus())
    }

    pub fn with_options(
        name: &str,
        mode: SimulationMode,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        let value = Arc::new(Mutex::new(0_i64));
        let rng = Arc::new(SimRng::default());
        let (r, w) = (value.clone(), value);

        let parameter = Parameter::new("value")?
            .with_getter(move || Ok(*r.lock()))
            .with_setter(move |v| {
                pause(mode.scale(MAX_WRITE_DELAY.mul_f64(rng.next_f64())));
                *w.lock() = v;
                Ok(())
            })
            .with_doc("Arbitrary integer")
            .with_bus(bus.clone());

        Ok(Self {
            device: Device::new(name).with_bus(bus).with_parameter(parameter)?,
        })
    }
}

impl AsDevice for DummyDevice {
    fn device(&self) -> &Device {
        &self.device
    }
}

parameter_accessors! {
    DummyDevice {
        value / set_value: i64 => "value";
    }
}

async_interface! {
    /// Pooled access to [`DummyDevice`].
    pub trait DummyDeviceAsync for DummyDevice {
        fn value() -> i64;
        fn set_value(value: i64) -> ();
    }
}
