//! Simulated area detector.
//!
//! The camera has to be recording before it accepts triggers. Each trigger
//! exposes for `exposure-time` (in realistic mode), produces a noisy
//! [`Frame`] and sends `frame`. The trigger mode belongs to the camera
//! itself: only [`Camera::configure_trigger`] can change it.

use beamline_core::bus::{default_bus, NotificationBus, SenderId};
use beamline_core::messaging::{MessageKind, MessageSource, MessageTable};
use beamline_core::units::SECOND;
use beamline_core::{
    async_interface, parameter_accessors, AsDevice, Device, DeviceError, Parameter, Quantity,
    Result,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::common::{pause, SimRng, SimulationMode};

/// Sent by [`Camera::record`].
pub const RECORDING: MessageKind = MessageKind::from_static("recording");
/// Sent by [`Camera::stop`].
pub const STOPPED: MessageKind = MessageKind::from_static("stopped");
/// Sent for every acquired frame.
pub const FRAME: MessageKind = MessageKind::from_static("frame");

/// Dark level of simulated frames.
const DARK_LEVEL: u16 = 100;
/// Peak-to-peak noise on top of the dark level.
const NOISE: u16 = 64;

/// What starts an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Free-running; [`Camera::trigger`] is accepted.
    #[default]
    Auto,
    /// Exposures only on [`Camera::trigger`].
    Software,
    /// Exposures on an external signal; software triggers are rejected.
    External,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Auto => "auto",
            TriggerMode::Software => "software",
            TriggerMode::External => "external",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(TriggerMode::Auto),
            "software" => Ok(TriggerMode::Software),
            "external" => Ok(TriggerMode::External),
            other => Err(DeviceError::Limit {
                parameter: "trigger-mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// One acquired image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub number: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&p| u64::from(p)).sum();
        sum as f64 / self.pixels.len() as f64
    }
}

/// Construction settings, deserializable from a `[[devices]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    /// Seconds.
    pub exposure_time: f64,
    /// Frames per second.
    pub frame_rate: f64,
    pub trigger_mode: TriggerMode,
    pub mode: SimulationMode,
    /// Fixed seed for reproducible noise.
    pub seed: Option<u64>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            exposure_time: 0.01,
            frame_rate: 10.0,
            trigger_mode: TriggerMode::Auto,
            mode: SimulationMode::Instant,
            seed: None,
        }
    }
}

#[derive(Debug)]
struct Sensor {
    exposure: Quantity,
    frame_rate: f64,
    trigger_mode: TriggerMode,
    recording: bool,
    frames: u64,
    last: Option<Frame>,
}

/// Simulated camera.
pub struct Camera {
    device: Device,
    sensor: Arc<Mutex<Sensor>>,
    rng: SimRng,
    width: u32,
    height: u32,
    mode: SimulationMode,
}

impl Camera {
    /// Camera with default settings on the process-wide bus.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_settings(name, CameraSettings::default(), default_bus())
    }

    pub fn with_settings(
        name: &str,
        settings: CameraSettings,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        let sensor = Arc::new(Mutex::new(Sensor {
            exposure: Quantity::new(settings.exposure_time, SECOND),
            frame_rate: settings.frame_rate,
            trigger_mode: settings.trigger_mode,
            recording: false,
            frames: 0,
            last: None,
        }));
        let mut device = Device::new(name)
            .with_bus(bus.clone())
            .with_messages(Self::MESSAGES);

        let (reader, writer) = (sensor.clone(), sensor.clone());
        let exposure = Parameter::new("exposure-time")?
            .with_getter(move || Ok(reader.lock().exposure))
            .with_setter(move |v: Quantity| {
                writer.lock().exposure = v.to(SECOND);
                Ok(())
            })
            .with_unit(SECOND)
            .with_limiter(|v: &Quantity| v.magnitude().is_finite() && v.magnitude() > 0.0)
            .with_doc("Exposure per frame")
            .with_bus(bus.clone());

        let (reader, writer) = (sensor.clone(), sensor.clone());
        let frame_rate = Parameter::new("frame-rate")?
            .with_getter(move || Ok(reader.lock().frame_rate))
            .with_setter(move |v: f64| {
                writer.lock().frame_rate = v;
                Ok(())
            })
            .with_limiter(|v: &f64| v.is_finite() && *v > 0.0)
            .with_doc("Frames per second while recording")
            .with_bus(bus.clone());

        let (reader, writer) = (sensor.clone(), sensor.clone());
        let trigger_mode = Parameter::new("trigger-mode")?
            .with_getter(move || Ok(reader.lock().trigger_mode.to_string()))
            .with_setter(move |v: String| {
                writer.lock().trigger_mode = v.parse()?;
                Ok(())
            })
            .with_limiter(|v: &String| v.parse::<TriggerMode>().is_ok())
            .owner_only()
            .with_doc("auto, software or external")
            .with_bus(bus.clone());

        let reader = sensor.clone();
        let frames = Parameter::new("frames")?
            .with_getter(move || Ok(reader.lock().frames as i64))
            .with_doc("Frames acquired since construction")
            .with_bus(bus);

        device.add_parameter(exposure)?;
        device.add_parameter(frame_rate)?;
        device.add_parameter(trigger_mode)?;
        device.add_parameter(frames)?;

        Ok(Self {
            device,
            sensor,
            rng: SimRng::new(settings.seed),
            width: settings.width,
            height: settings.height,
            mode: settings.mode,
        })
    }

    /// Change the trigger mode. The camera writes this parameter as its owner.
    pub fn configure_trigger(&self, mode: TriggerMode) -> Result<()> {
        self.device
            .parameter::<String>("trigger-mode")?
            .set_as(mode.to_string(), Some(self.device.id()))
    }

    pub fn is_recording(&self) -> bool {
        self.sensor.lock().recording
    }

    /// Start recording.
    pub fn record(&self) -> Result<()> {
        self.sensor.lock().recording = true;
        debug!(device = self.device.name(), "recording");
        self.send(&RECORDING);
        Ok(())
    }

    /// Stop recording.
    pub fn stop(&self) -> Result<()> {
        self.sensor.lock().recording = false;
        self.send(&STOPPED);
        Ok(())
    }

    /// Acquire one frame.
    pub fn trigger(&self) -> Result<()> {
        let (exposure, trigger_mode, recording) = {
            let sensor = self.sensor.lock();
            (sensor.exposure, sensor.trigger_mode, sensor.recording)
        };
        if !recording {
            return Err(DeviceError::hardware(format!(
                "{} is not recording",
                self.device.name()
            )));
        }
        if trigger_mode == TriggerMode::External {
            return Err(DeviceError::hardware(format!(
                "{} is triggered externally",
                self.device.name()
            )));
        }

        pause(self.mode.scale(self.as_duration(exposure)?));

        let pixels = (0..self.width * self.height)
            .map(|_| DARK_LEVEL + self.rng.below(NOISE))
            .collect();
        {
            let mut sensor = self.sensor.lock();
            sensor.frames += 1;
            sensor.last = Some(Frame {
                number: sensor.frames,
                width: self.width,
                height: self.height,
                pixels,
            });
        }
        self.send(&FRAME);
        Ok(())
    }

    /// The most recent frame.
    pub fn grab(&self) -> Result<Frame> {
        self.sensor.lock().last.clone().ok_or_else(|| {
            DeviceError::hardware(format!("{} has not acquired a frame", self.device.name()))
        })
    }

    /// Exposure as a [`Duration`], for callers that wait on frames.
    pub fn exposure_duration(&self) -> Result<Duration> {
        self.as_duration(self.exposure_time()?)
    }

    fn as_duration(&self, exposure: Quantity) -> Result<Duration> {
        Duration::try_from_secs_f64(exposure.to(SECOND).magnitude()).map_err(|e| {
            DeviceError::hardware(format!(
                "{} cannot expose for {exposure}: {e}",
                self.device.name()
            ))
        })
    }
}

impl AsDevice for Camera {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl MessageSource for Camera {
    const MESSAGES: &'static [MessageKind] = &[RECORDING, STOPPED, FRAME];

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
    Camera {
        exposure_time / set_exposure_time: Quantity => "exposure-time";
        frame_rate / set_frame_rate: f64 => "frame-rate";
        trigger_mode: String => "trigger-mode";
        frames: i64 => "frames";
    }
}

async_interface! {
    /// Pooled acquisition commands for [`Camera`].
    pub trait CameraAsync for Camera {
        fn record() -> ();
        fn stop() -> ();
        fn trigger() -> ();
        fn grab() -> Frame;
        fn set_exposure_time(exposure: Quantity) -> ();
    }
}
