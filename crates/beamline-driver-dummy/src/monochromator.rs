//! Simulated X-ray monochromator.
//!
//! `energy` is the primary axis. `wavelength` is derived from it through
//! E = hc/λ and writing it moves the energy; both announce the change.

use beamline_core::bus::{default_bus, NotificationBus};
use beamline_core::units::{ELECTRONVOLT, METER};
use beamline_core::{async_interface, parameter_accessors, AsDevice, Device, Parameter, Quantity, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{pause, SimulationMode};

/// Planck constant times speed of light, in eV·m.
pub const HC_EV_M: f64 = 1.239_841_984e-6;

/// Crystal rotation time for a move in realistic mode.
const SETTLE: Duration = Duration::from_millis(100);

/// λ = hc/E.
pub fn energy_to_wavelength(energy: Quantity) -> Quantity {
    Quantity::new(HC_EV_M / energy.to(ELECTRONVOLT).magnitude(), METER)
}

/// E = hc/λ.
pub fn wavelength_to_energy(wavelength: Quantity) -> Quantity {
    Quantity::new(HC_EV_M / wavelength.to(METER).magnitude(), ELECTRONVOLT)
}

/// Construction settings; energies in eV.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonochromatorSettings {
    pub energy: f64,
    pub range: (f64, f64),
    pub mode: SimulationMode,
}

impl Default for MonochromatorSettings {
    fn default() -> Self {
        Self {
            energy: 8_000.0,
            range: (2_000.0, 30_000.0),
            mode: SimulationMode::Instant,
        }
    }
}

pub struct Monochromator {
    device: Device,
}

impl Monochromator {
    /// Default settings on the process-wide bus.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_settings(name, MonochromatorSettings::default(), default_bus())
    }

    pub fn with_settings(
        name: &str,
        settings: MonochromatorSettings,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        let mode = settings.mode;
        let (lower, upper) = settings.range;
        let energy = Arc::new(Mutex::new(Quantity::new(settings.energy, ELECTRONVOLT)));

        let (reader, writer) = (energy.clone(), energy.clone());
        let energy_param = Parameter::new("energy")?
            .with_getter(move || Ok(*reader.lock()))
            .with_setter(move |v: Quantity| {
                pause(mode.scale(SETTLE));
                *writer.lock() = v.to(ELECTRONVOLT);
                Ok(())
            })
            .with_unit(ELECTRONVOLT)
            .with_range(
                Quantity::new(lower, ELECTRONVOLT),
                Quantity::new(upper, ELECTRONVOLT),
            )
            .with_doc("Photon energy")
            .with_bus(bus.clone());

        // Higher energy, shorter wavelength.
        let (reader, writer) = (energy.clone(), energy);
        let energy_changed = energy_param.clone();
        let wavelength_param = Parameter::new("wavelength")?
            .with_getter(move || Ok(energy_to_wavelength(*reader.lock())))
            .with_setter(move |v: Quantity| {
                pause(mode.scale(SETTLE));
                *writer.lock() = wavelength_to_energy(v);
                energy_changed.notify();
                Ok(())
            })
            .with_unit(METER)
            .with_range(
                energy_to_wavelength(Quantity::new(upper, ELECTRONVOLT)),
                energy_to_wavelength(Quantity::new(lower, ELECTRONVOLT)),
            )
            .with_doc("Photon wavelength")
            .with_bus(bus.clone());

        Ok(Self {
            device: Device::new(name)
                .with_bus(bus)
                .with_parameter(energy_param)?
                .with_parameter(wavelength_param)?,
        })
    }
}

impl AsDevice for Monochromator {
    fn device(&self) -> &Device {
        &self.device
    }
}

parameter_accessors! {
    Monochromator {
        energy / set_energy: Quantity => "energy";
        wavelength / set_wavelength: Quantity => "wavelength";
    }
}

async_interface! {
    /// Pooled monochromator moves.
    pub trait MonochromatorAsync for Monochromator {
        fn set_energy(energy: Quantity) -> ();
        fn set_wavelength(wavelength: Quantity) -> ();
    }
}
