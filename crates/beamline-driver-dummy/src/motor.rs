//! Simulated step motors.
//!
//! A [`Motor`] has a `position`, a `motion-velocity` and a read-only `state`.
//! Writing `position` runs a motion towards the target:
//!
//! - in [`SimulationMode::Instant`] the motion completes in one step,
//! - in [`SimulationMode::Realistic`] it advances in 10 ms steps at the
//!   current velocity and can be interrupted with [`Motor::stop`].
//!
//! Crossing a hard limit parks the motor on that limit, puts it in the
//! `hard-limit` state, sends `limit-reached` and fails the write.
//!
//! Linear motors work in millimeters, rotation motors in degrees.
//!
//! Continuous motors ([`MotorSettings::continuous_linear`],
//! [`MotorSettings::continuous_rotation`]) add a signed `velocity`
//! parameter: a positive velocity drives towards the upper soft limit, a
//! negative one towards the lower soft limit and zero stops the motor.
//! Speeds above `max_velocity` put the motor in its velocity hard limit.

use beamline_core::bus::{default_bus, NotificationBus, SenderId};
use beamline_core::messaging::{MessageKind, MessageSource, MessageTable};
use beamline_core::units::{
    Unit, DEGREE, DEGREE_PER_SECOND, MILLIMETER, MILLIMETER_PER_SECOND,
};
use beamline_core::{
    async_interface, parameter_accessors, AsDevice, Device, DeviceError, Parameter, Quantity,
    Result,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::common::{pause, SimulationMode};

/// Sent after a successful [`Motor::home`].
pub const HOMED: MessageKind = MessageKind::from_static("homed");
/// Sent by [`Motor::stop`].
pub const STOPPED: MessageKind = MessageKind::from_static("stopped");
/// Sent when a motion ran into a hard limit.
pub const LIMIT_REACHED: MessageKind = MessageKind::from_static("limit-reached");

const MOTION_STEP: Duration = Duration::from_millis(10);

/// Motor state as reported by the `state` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Standby,
    Moving,
    HardLimit,
}

impl MotorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotorState::Standby => "standby",
            MotorState::Moving => "moving",
            MotorState::HardLimit => "hard-limit",
        }
    }
}

/// Linear (mm) or rotational (deg) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    #[default]
    Linear,
    Rotation,
}

impl AxisKind {
    /// Unit of position.
    pub fn unit(&self) -> Unit {
        match self {
            AxisKind::Linear => MILLIMETER,
            AxisKind::Rotation => DEGREE,
        }
    }

    /// Unit of motion velocity.
    pub fn velocity_unit(&self) -> Unit {
        match self {
            AxisKind::Linear => MILLIMETER_PER_SECOND,
            AxisKind::Rotation => DEGREE_PER_SECOND,
        }
    }
}

/// Construction settings. Magnitudes are in the axis units.
#[derive(Debug, Clone)]
pub struct MotorSettings {
    pub kind: AxisKind,
    pub position: f64,
    pub velocity: f64,
    pub hard_limits: (f64, f64),
    /// Optional limiter on `position`, checked before any motion starts.
    pub soft_limits: Option<(f64, f64)>,
    /// Adds the signed `velocity` parameter.
    pub continuous: bool,
    /// Largest speed accepted by `velocity`.
    pub max_velocity: f64,
    pub mode: SimulationMode,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self::linear()
    }
}

impl MotorSettings {
    /// Linear motor at 0 mm, 2 mm/s, hard limits at ±100 mm.
    pub fn linear() -> Self {
        Self {
            kind: AxisKind::Linear,
            position: 0.0,
            velocity: 2.0,
            hard_limits: (-100.0, 100.0),
            soft_limits: None,
            continuous: false,
            max_velocity: 20.0,
            mode: SimulationMode::Instant,
        }
    }

    /// Rotation motor at 0°, 5°/s, hard limits at ±720° and soft limits at
    /// ±360°.
    pub fn rotation() -> Self {
        Self {
            kind: AxisKind::Rotation,
            position: 0.0,
            velocity: 5.0,
            hard_limits: (-720.0, 720.0),
            soft_limits: Some((-360.0, 360.0)),
            continuous: false,
            max_velocity: 90.0,
            mode: SimulationMode::Instant,
        }
    }

    /// Linear motor with a `velocity` parameter sweeping between soft
    /// limits at ±50 mm.
    pub fn continuous_linear() -> Self {
        Self {
            soft_limits: Some((-50.0, 50.0)),
            continuous: true,
            ..Self::linear()
        }
    }

    /// Rotation motor with a `velocity` parameter.
    pub fn continuous_rotation() -> Self {
        Self {
            continuous: true,
            ..Self::rotation()
        }
    }

    /// Targets of a positive and a negative `velocity`.
    fn sweep_bounds(&self) -> (f64, f64) {
        self.soft_limits.unwrap_or(self.hard_limits)
    }
}

#[derive(Debug)]
struct Axis {
    position: f64,
    velocity: f64,
    state: MotorState,
    homed: bool,
    /// Sign of the running continuous motion.
    direction: f64,
    velocity_limited: bool,
}

/// Simulated step motor.
pub struct Motor {
    device: Device,
    axis: Arc<Mutex<Axis>>,
    motion: Arc<Motion>,
    kind: AxisKind,
}

impl Motor {
    /// Linear motor with default settings on the process-wide bus.
    pub fn linear(name: &str) -> Result<Self> {
        Self::with_settings(name, MotorSettings::linear(), default_bus())
    }

    /// Rotation motor with default settings on the process-wide bus.
    pub fn rotation(name: &str) -> Result<Self> {
        Self::with_settings(name, MotorSettings::rotation(), default_bus())
    }

    pub fn with_settings(
        name: &str,
        settings: MotorSettings,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        let unit = settings.kind.unit();
        let velocity_unit = settings.kind.velocity_unit();
        let axis = Arc::new(Mutex::new(Axis {
            position: settings.position,
            velocity: settings.velocity,
            state: MotorState::Standby,
            homed: false,
            direction: 0.0,
            velocity_limited: false,
        }));

        let mut device = Device::new(name)
            .with_bus(bus.clone())
            .with_messages(Self::MESSAGES);
        let motion = Arc::new(Motion {
            axis: axis.clone(),
            abort: AtomicBool::new(false),
            hard_limits: settings.hard_limits,
            mode: settings.mode,
            bus: bus.clone(),
            sender: device.id(),
            device: name.to_string(),
        });

        let reader = axis.clone();
        let mover = motion.clone();
        let soft_limits = settings.soft_limits;
        let position = Parameter::new("position")?
            .with_getter(move || Ok(Quantity::new(reader.lock().position, unit)))
            .with_setter(move |target: Quantity| mover.run(target.to(unit).magnitude()))
            .with_unit(unit)
            .with_limiter(move |target: &Quantity| {
                let target = target.to(unit).magnitude();
                target.is_finite()
                    && soft_limits.map_or(true, |(lower, upper)| (lower..=upper).contains(&target))
            })
            .with_doc("Axis position")
            .with_bus(bus.clone());

        let (reader, writer) = (axis.clone(), axis.clone());
        let velocity = Parameter::new("motion-velocity")?
            .with_getter(move || Ok(Quantity::new(reader.lock().velocity, velocity_unit)))
            .with_setter(move |v: Quantity| {
                writer.lock().velocity = v.to(velocity_unit).magnitude();
                Ok(())
            })
            .with_unit(velocity_unit)
            .with_limiter(|v: &Quantity| v.magnitude().is_finite() && v.magnitude() > 0.0)
            .with_doc("Speed of subsequent motions")
            .with_bus(bus.clone());

        let reader = axis.clone();
        let state = Parameter::new("state")?
            .with_getter(move || Ok(reader.lock().state.as_str().to_string()))
            .with_doc("standby, moving or hard-limit")
            .with_bus(bus.clone());

        device.add_parameter(position)?;
        device.add_parameter(velocity)?;
        device.add_parameter(state)?;

        if settings.continuous {
            let reader = axis.clone();
            let driver = motion.clone();
            let (lower, upper) = settings.sweep_bounds();
            let max_velocity = settings.max_velocity;
            let sweep = Parameter::new("velocity")?
                .with_getter(move || {
                    let axis = reader.lock();
                    let speed = match axis.state {
                        MotorState::Moving => axis.direction * axis.velocity,
                        _ => 0.0,
                    };
                    Ok(Quantity::new(speed, velocity_unit))
                })
                .with_setter(move |v: Quantity| {
                    let v = v.to(velocity_unit).magnitude();
                    if v.abs() > max_velocity {
                        driver.axis.lock().velocity_limited = true;
                        driver.bus.send(driver.sender, &LIMIT_REACHED);
                        return Err(DeviceError::hardware(format!(
                            "{} cannot exceed {max_velocity} {velocity_unit}",
                            driver.device
                        )));
                    }
                    {
                        let mut axis = driver.axis.lock();
                        axis.velocity_limited = false;
                        if v != 0.0 {
                            axis.velocity = v.abs();
                            axis.direction = v.signum();
                        }
                    }
                    if v == 0.0 {
                        driver.halt();
                        Ok(())
                    } else if v > 0.0 {
                        driver.run(upper)
                    } else {
                        driver.run(lower)
                    }
                })
                .with_unit(velocity_unit)
                .with_limiter(|v: &Quantity| v.magnitude().is_finite())
                .with_doc("Signed continuous velocity, zero stops")
                .with_bus(bus);
            device.add_parameter(sweep)?;
        }

        Ok(Self {
            device,
            axis,
            motion,
            kind: settings.kind,
        })
    }

    pub fn kind(&self) -> AxisKind {
        self.kind
    }

    /// Move by `delta` relative to the current position.
    pub fn move_by(&self, delta: Quantity) -> Result<()> {
        let current = self.position()?;
        let target = current.checked_add(&delta).ok_or_else(|| DeviceError::Unit {
            parameter: "position".to_string(),
            unit: self.kind.unit().to_string(),
            value: delta.to_string(),
        })?;
        self.set_position(target)
    }

    /// Move to zero and mark the axis as homed.
    pub fn home(&self) -> Result<()> {
        self.set_position(Quantity::new(0.0, self.kind.unit()))?;
        self.axis.lock().homed = true;
        self.send(&HOMED);
        Ok(())
    }

    /// Interrupt a running motion.
    pub fn stop(&self) -> Result<()> {
        self.motion.halt();
        Ok(())
    }

    pub fn is_homed(&self) -> bool {
        self.axis.lock().homed
    }

    /// Whether the motor sits on a hard limit.
    pub fn in_hard_limit(&self) -> bool {
        self.axis.lock().state == MotorState::HardLimit
    }

    /// Whether the last `velocity` write asked for more than the motor's
    /// maximum speed.
    pub fn in_velocity_hard_limit(&self) -> bool {
        self.axis.lock().velocity_limited
    }

    /// Whether the motor has the signed `velocity` parameter.
    pub fn is_continuous(&self) -> bool {
        self.device.lookup("velocity").is_ok()
    }
}

/// Writes the `position` parameter by simulating the motion.
struct Motion {
    axis: Arc<Mutex<Axis>>,
    abort: AtomicBool,
    hard_limits: (f64, f64),
    mode: SimulationMode,
    bus: Arc<dyn NotificationBus>,
    sender: SenderId,
    device: String,
}

impl Motion {
    fn halt(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let mut axis = self.axis.lock();
        if axis.state == MotorState::Moving {
            axis.state = MotorState::Standby;
        }
        drop(axis);
        debug!(device = %self.device, "stop");
        self.bus.send(self.sender, &STOPPED);
    }

    fn run(&self, target: f64) -> Result<()> {
        self.abort.store(false, Ordering::SeqCst);
        let (lower, upper) = self.hard_limits;

        loop {
            let mut axis = self.axis.lock();
            let remaining = target - axis.position;
            if remaining == 0.0 {
                axis.state = MotorState::Standby;
                return Ok(());
            }
            if self.abort.load(Ordering::SeqCst) {
                debug!(device = %self.device, position = axis.position, "motion aborted");
                axis.state = MotorState::Standby;
                return Ok(());
            }

            let next = match self.mode {
                SimulationMode::Instant => target,
                SimulationMode::Realistic => {
                    let max = axis.velocity * MOTION_STEP.as_secs_f64();
                    if remaining.abs() <= max {
                        target
                    } else {
                        axis.position + max.copysign(remaining)
                    }
                }
            };

            if next < lower || next > upper {
                axis.position = next.clamp(lower, upper);
                axis.state = MotorState::HardLimit;
                drop(axis);
                self.bus.send(self.sender, &LIMIT_REACHED);
                return Err(DeviceError::hardware(format!(
                    "{} reached a hard limit",
                    self.device
                )));
            }

            axis.position = next;
            axis.state = MotorState::Moving;
            drop(axis);
            pause(self.mode.scale(MOTION_STEP));
        }
    }
}

impl AsDevice for Motor {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl MessageSource for Motor {
    const MESSAGES: &'static [MessageKind] = &[HOMED, STOPPED, LIMIT_REACHED];

    fn sender_id(&self) -> SenderId {
        self.device.id()
    }

    fn bus(&self) -> &Arc<dyn NotificationBus> {
        self.device.bus()
    }

    fn message_table(&self) -> &MessageTable {
        self.device.message_table()
    }
}

parameter_accessors! {
    Motor {
        position / set_position: Quantity => "position";
        motion_velocity / set_motion_velocity: Quantity => "motion-velocity";
        state: String => "state";
        velocity / set_velocity: Quantity => "velocity";
    }
}

async_interface! {
    /// Pooled motion commands for [`Motor`].
    pub trait MotorAsync for Motor {
        fn set_position(target: Quantity) -> ();
        fn move_by(delta: Quantity) -> ();
        fn home() -> ();
        fn stop() -> ();
        fn position() -> Quantity;
        fn set_velocity(velocity: Quantity) -> ();
    }
}
