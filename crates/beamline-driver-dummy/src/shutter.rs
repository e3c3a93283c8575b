//! Simulated beam shutter.

use beamline_core::bus::{default_bus, NotificationBus, SenderId};
use beamline_core::messaging::{MessageKind, MessageSource, MessageTable};
use beamline_core::{async_interface, parameter_accessors, AsDevice, Device, Parameter, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{pause, SimulationMode};

pub const OPENED: MessageKind = MessageKind::from_static("opened");
pub const CLOSED: MessageKind = MessageKind::from_static("closed");

/// Blade travel time in realistic mode.
const TRAVEL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShutterSettings {
    /// Start with the shutter open.
    pub open: bool,
    pub mode: SimulationMode,
}

/// Two-state shutter. `state` reads `open` or `closed`.
pub struct Shutter {
    device: Device,
    open: Arc<Mutex<bool>>,
    mode: SimulationMode,
}

impl Shutter {
    /// Closed shutter on the process-wide bus.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_settings(name, ShutterSettings::default(), default_bus())
    }

    pub fn with_settings(
        name: &str,
        settings: ShutterSettings,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        let open = Arc::new(Mutex::new(settings.open));
        let reader = open.clone();
        let state = Parameter::new("state")?
            .with_getter(move || Ok(if *reader.lock() { "open" } else { "closed" }.to_string()))
            .with_doc("open or closed")
            .with_bus(bus.clone());

        Ok(Self {
            device: Device::new(name)
                .with_bus(bus)
                .with_messages(Self::MESSAGES)
                .with_parameter(state)?,
            open,
            mode: settings.mode,
        })
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    pub fn open(&self) -> Result<()> {
        self.actuate(true, &OPENED)
    }

    pub fn close(&self) -> Result<()> {
        self.actuate(false, &CLOSED)
    }

    fn actuate(&self, open: bool, message: &MessageKind) -> Result<()> {
        pause(self.mode.scale(TRAVEL));
        *self.open.lock() = open;
        self.device.parameter::<String>("state")?.notify();
        self.send(message);
        Ok(())
    }
}

impl AsDevice for Shutter {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl MessageSource for Shutter {
    const MESSAGES: &'static [MessageKind] = &[OPENED, CLOSED];

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
    Shutter {
        state: String => "state";
    }
}

async_interface! {
    /// Pooled shutter commands.
    pub trait ShutterAsync for Shutter {
        fn open() -> ();
        fn close() -> ();
    }
}
