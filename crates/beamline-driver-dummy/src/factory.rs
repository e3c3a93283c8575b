//! Building simulated devices from `[[devices]]` configuration entries.
//!
//! Every driver type has a [`DriverFactory`] keyed by the `type` field of its
//! entry. Factories validate the `settings` table up front so that a bad
//! entry is reported before any device is constructed.
//!
//! ```toml
//! [[devices]]
//! id = "sample-x"
//! type = "motor"
//! settings = { kind = "linear", hard_limits = [-50.0, 50.0] }
//! ```

use anyhow::{bail, Context, Result};
use beamline_core::bus::NotificationBus;
use beamline_core::config::{BeamlineConfig, DeviceDefinition};
use beamline_core::{AsDevice, Device};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::camera::{Camera, CameraSettings};
use crate::common::SimulationMode;
use crate::dummy::DummyDevice;
use crate::monochromator::{Monochromator, MonochromatorSettings};
use crate::motor::{AxisKind, Motor, MotorSettings};
use crate::shutter::{Shutter, ShutterSettings};

/// A constructed simulated device.
pub enum DriverInstance {
    Dummy(DummyDevice),
    Motor(Motor),
    Camera(Camera),
    Shutter(Shutter),
    Monochromator(Monochromator),
}

impl DriverInstance {
    /// The motor, if this is one.
    pub fn as_motor(&self) -> Option<&Motor> {
        match self {
            DriverInstance::Motor(motor) => Some(motor),
            _ => None,
        }
    }

    pub fn as_camera(&self) -> Option<&Camera> {
        match self {
            DriverInstance::Camera(camera) => Some(camera),
            _ => None,
        }
    }

    /// Short type label for listings.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverInstance::Dummy(_) => "dummy",
            DriverInstance::Motor(_) => "motor",
            DriverInstance::Camera(_) => "camera",
            DriverInstance::Shutter(_) => "shutter",
            DriverInstance::Monochromator(_) => "monochromator",
        }
    }
}

impl AsDevice for DriverInstance {
    fn device(&self) -> &Device {
        match self {
            DriverInstance::Dummy(d) => d.device(),
            DriverInstance::Motor(d) => d.device(),
            DriverInstance::Camera(d) => d.device(),
            DriverInstance::Shutter(d) => d.device(),
            DriverInstance::Monochromator(d) => d.device(),
        }
    }
}

impl std::fmt::Debug for DriverInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverInstance")
            .field("kind", &self.kind())
            .field("name", &self.device().name())
            .finish()
    }
}

/// Constructs one driver type from its configuration entry.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `type` field this factory handles.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// Check `settings` without constructing anything.
    fn validate(&self, settings: &toml::Value) -> Result<()>;

    /// Construct the device named `id` on `bus`.
    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance>;
}

pub struct DummyFactory;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DummyEntry {
    mode: SimulationMode,
}

impl DriverFactory for DummyFactory {
    fn driver_type(&self) -> &'static str {
        "dummy"
    }

    fn name(&self) -> &'static str {
        "Dummy Device"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let _: DummyEntry = settings.clone().try_into()?;
        Ok(())
    }

    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        let entry: DummyEntry = settings.try_into()?;
        Ok(DriverInstance::Dummy(DummyDevice::with_options(
            id, entry.mode, bus,
        )?))
    }
}

pub struct MotorFactory;

/// Overrides on top of the preset selected by `kind`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MotorEntry {
    kind: AxisKind,
    position: Option<f64>,
    velocity: Option<f64>,
    hard_limits: Option<(f64, f64)>,
    soft_limits: Option<(f64, f64)>,
    continuous: bool,
    max_velocity: Option<f64>,
    mode: SimulationMode,
}

impl MotorEntry {
    fn into_settings(self) -> MotorSettings {
        let preset = match (self.kind, self.continuous) {
            (AxisKind::Linear, false) => MotorSettings::linear(),
            (AxisKind::Linear, true) => MotorSettings::continuous_linear(),
            (AxisKind::Rotation, false) => MotorSettings::rotation(),
            (AxisKind::Rotation, true) => MotorSettings::continuous_rotation(),
        };
        MotorSettings {
            kind: self.kind,
            position: self.position.unwrap_or(preset.position),
            velocity: self.velocity.unwrap_or(preset.velocity),
            hard_limits: self.hard_limits.unwrap_or(preset.hard_limits),
            soft_limits: self.soft_limits.or(preset.soft_limits),
            continuous: self.continuous,
            max_velocity: self.max_velocity.unwrap_or(preset.max_velocity),
            mode: self.mode,
        }
    }
}

impl DriverFactory for MotorFactory {
    fn driver_type(&self) -> &'static str {
        "motor"
    }

    fn name(&self) -> &'static str {
        "Step Motor"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let entry: MotorEntry = settings.clone().try_into()?;
        let settings = entry.into_settings();
        let (lower, upper) = settings.hard_limits;
        if !(lower.is_finite() && upper.is_finite()) || lower >= upper {
            bail!("hard limits [{lower}, {upper}] are empty");
        }
        if !(lower..=upper).contains(&settings.position) {
            bail!("position {} lies outside the hard limits", settings.position);
        }
        if let Some((soft_lower, soft_upper)) = settings.soft_limits {
            if soft_lower >= soft_upper || soft_lower < lower || soft_upper > upper {
                bail!("soft limits [{soft_lower}, {soft_upper}] must lie inside the hard limits");
            }
        }
        for (name, speed) in [
            ("velocity", settings.velocity),
            ("max_velocity", settings.max_velocity),
        ] {
            if !(speed.is_finite() && speed > 0.0) {
                bail!("{name} must be positive");
            }
        }
        Ok(())
    }

    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        let entry: MotorEntry = settings.try_into()?;
        Ok(DriverInstance::Motor(Motor::with_settings(
            id,
            entry.into_settings(),
            bus,
        )?))
    }
}

pub struct CameraFactory;

impl DriverFactory for CameraFactory {
    fn driver_type(&self) -> &'static str {
        "camera"
    }

    fn name(&self) -> &'static str {
        "Area Detector"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: CameraSettings = settings.clone().try_into()?;
        if cfg.width == 0 || cfg.height == 0 {
            bail!("camera resolution must be non-zero");
        }
        if !(cfg.exposure_time.is_finite() && cfg.exposure_time > 0.0) {
            bail!("exposure must be positive");
        }
        if !(cfg.frame_rate.is_finite() && cfg.frame_rate > 0.0) {
            bail!("frame rate must be positive");
        }
        Ok(())
    }

    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        let cfg: CameraSettings = settings.try_into()?;
        Ok(DriverInstance::Camera(Camera::with_settings(id, cfg, bus)?))
    }
}

pub struct ShutterFactory;

impl DriverFactory for ShutterFactory {
    fn driver_type(&self) -> &'static str {
        "shutter"
    }

    fn name(&self) -> &'static str {
        "Beam Shutter"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let _: ShutterSettings = settings.clone().try_into()?;
        Ok(())
    }

    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        let cfg: ShutterSettings = settings.try_into()?;
        Ok(DriverInstance::Shutter(Shutter::with_settings(id, cfg, bus)?))
    }
}

pub struct MonochromatorFactory;

impl DriverFactory for MonochromatorFactory {
    fn driver_type(&self) -> &'static str {
        "monochromator"
    }

    fn name(&self) -> &'static str {
        "Monochromator"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: MonochromatorSettings = settings.clone().try_into()?;
        let (lower, upper) = cfg.range;
        if lower <= 0.0 || lower >= upper {
            bail!("energy range [{lower}, {upper}] eV is invalid");
        }
        if !(lower..=upper).contains(&cfg.energy) {
            bail!("energy {} eV lies outside the range", cfg.energy);
        }
        Ok(())
    }

    fn build(
        &self,
        id: &str,
        settings: toml::Value,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        let cfg: MonochromatorSettings = settings.try_into()?;
        Ok(DriverInstance::Monochromator(Monochromator::with_settings(
            id, cfg, bus,
        )?))
    }
}

/// Factories keyed by driver type.
pub struct DriverRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every simulated driver of this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DummyFactory));
        registry.register(Box::new(MotorFactory));
        registry.register(Box::new(CameraFactory));
        registry.register(Box::new(ShutterFactory));
        registry.register(Box::new(MonochromatorFactory));
        registry
    }

    /// Add `factory`, replacing any factory for the same type.
    pub fn register(&mut self, factory: Box<dyn DriverFactory>) {
        debug!(driver_type = factory.driver_type(), "registered driver factory");
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn factory(&self, definition: &DeviceDefinition) -> Result<&dyn DriverFactory> {
        match self.factories.get(definition.r#type.as_str()) {
            Some(factory) => Ok(factory.as_ref()),
            None => bail!(
                "device `{}': unknown driver type `{}' (known: {})",
                definition.id,
                definition.r#type,
                self.driver_types().join(", ")
            ),
        }
    }

    /// Check one entry without building it.
    pub fn validate(&self, definition: &DeviceDefinition) -> Result<()> {
        self.factory(definition)?
            .validate(&definition.settings)
            .with_context(|| format!("invalid settings for device `{}'", definition.id))
    }

    /// Validate and build one entry.
    pub fn build(
        &self,
        definition: &DeviceDefinition,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<DriverInstance> {
        self.validate(definition)?;
        let factory = self.factory(definition)?;
        let instance = factory
            .build(&definition.id, definition.settings.clone(), bus)
            .with_context(|| format!("failed to build device `{}'", definition.id))?;
        info!(device = %definition.id, driver = factory.name(), "device ready");
        Ok(instance)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Build every enabled device of `config`, in file order.
///
/// All entries are validated before the first device is built.
pub fn build_devices(
    config: &BeamlineConfig,
    bus: Arc<dyn NotificationBus>,
) -> Result<Vec<(String, DriverInstance)>> {
    let registry = DriverRegistry::with_builtin();
    for definition in config.enabled_devices() {
        registry.validate(definition)?;
    }
    config
        .enabled_devices()
        .map(|definition| {
            let instance = registry.build(definition, bus.clone())?;
            Ok((definition.id.clone(), instance))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::bus::RecordingBus;
    use beamline_core::units::{DEGREE, MILLIMETER, MILLIMETER_PER_SECOND};
    use beamline_core::Quantity;

    fn definition(id: &str, r#type: &str, settings: &str) -> DeviceDefinition {
        DeviceDefinition {
            id: id.to_string(),
            r#type: r#type.to_string(),
            enabled: true,
            settings: toml::from_str(settings).unwrap(),
        }
    }

    #[test]
    fn test_builtin_types() {
        assert_eq!(
            DriverRegistry::with_builtin().driver_types(),
            vec!["camera", "dummy", "monochromator", "motor", "shutter"]
        );
    }

    #[test]
    fn test_unknown_type() {
        let registry = DriverRegistry::with_builtin();
        let err = registry
            .validate(&definition("x", "laser", ""))
            .unwrap_err();
        assert!(err.to_string().contains("unknown driver type `laser'"));
    }

    #[test]
    fn test_rotation_preset_with_override() {
        let registry = DriverRegistry::with_builtin();
        let def = definition("rot", "motor", "kind = \"rotation\"\nposition = 45.0");
        let instance = registry.build(&def, RecordingBus::new()).unwrap();

        let motor = instance.as_motor().unwrap();
        assert_eq!(motor.kind(), AxisKind::Rotation);
        assert_eq!(motor.position().unwrap(), Quantity::new(45.0, DEGREE));
        assert!(motor.set_position(Quantity::new(400.0, DEGREE)).is_err());
        assert_eq!(instance.device().name(), "rot");
    }

    #[test]
    fn test_continuous_motor_entry() {
        let registry = DriverRegistry::with_builtin();
        let def = definition("belt", "motor", "continuous = true\nmax_velocity = 8.0");
        let instance = registry.build(&def, RecordingBus::new()).unwrap();

        let motor = instance.as_motor().unwrap();
        assert!(motor.is_continuous());
        assert!(motor.set_velocity(Quantity::new(9.0, MILLIMETER_PER_SECOND)).is_err());
        assert!(motor.in_velocity_hard_limit());
        motor.set_velocity(Quantity::new(8.0, MILLIMETER_PER_SECOND)).unwrap();
        assert_eq!(motor.position().unwrap(), Quantity::new(50.0, MILLIMETER));
        assert!(instance.as_camera().is_none());
    }

    #[test]
    fn test_camera_entry() {
        let registry = DriverRegistry::with_builtin();
        let def = definition("det", "camera", "width = 8\nheight = 2");
        let instance = registry.build(&def, RecordingBus::new()).unwrap();

        let camera = instance.as_camera().unwrap();
        camera.record().unwrap();
        camera.trigger().unwrap();
        assert_eq!(camera.grab().unwrap().pixels.len(), 16);
        assert!(instance.as_motor().is_none());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry
            .validate(&definition("m", "motor", "hard_limits = [5.0, -5.0]"))
            .is_err());
        assert!(registry
            .validate(&definition("m", "motor", "speed = 3.0"))
            .is_err());
        assert!(registry
            .validate(&definition("c", "camera", "width = 0"))
            .is_err());
        assert!(registry
            .validate(&definition("c", "camera", "exposure_time = inf"))
            .is_err());
        assert!(registry
            .validate(&definition("m", "motor", "soft_limits = [-200.0, 0.0]"))
            .is_err());
        assert!(registry
            .validate(&definition("m", "motor", "max_velocity = 0.0"))
            .is_err());
        assert!(registry
            .validate(&definition("mono", "monochromator", "energy = 100.0"))
            .is_err());
    }

    #[test]
    fn test_build_devices_skips_disabled() {
        let mut config = BeamlineConfig::default();
        config.devices = vec![
            definition("d", "dummy", ""),
            definition("sh", "shutter", "open = true"),
            DeviceDefinition {
                enabled: false,
                ..definition("cam", "camera", "")
            },
        ];

        let devices = build_devices(&config, RecordingBus::new()).unwrap();
        let ids: Vec<_> = devices.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["d", "sh"]);
        assert_eq!(devices[1].1.kind(), "shutter");
    }

    #[test]
    fn test_one_bad_entry_builds_nothing() {
        let mut config = BeamlineConfig::default();
        config.devices = vec![
            definition("d", "dummy", ""),
            definition("c", "camera", "exposure_time = -1.0"),
        ];
        assert!(build_devices(&config, RecordingBus::new()).is_err());
    }
}
