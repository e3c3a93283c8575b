//! `beamline` - command-line front end for simulated beamline devices.
//!
//! Devices come from the `[[devices]]` entries of the configuration file
//! (`config/beamline.toml` unless `--config` is given), overlaid with
//! `BEAMLINE_*` environment variables.
//!
//! ```bash
//! beamline inspect
//! beamline get --device mono --parameter wavelength
//! beamline set --device sample-x --parameter position '{"magnitude": 5, "unit": "mm"}'
//! beamline scan --device sample-x --start -5 --stop 5 --steps 11
//! ```

use anyhow::{bail, Context, Result};
use beamline_core::bus::{Dispatcher, NotificationBus};
use beamline_core::config::{BeamlineConfig, DEFAULT_CONFIG_PATH};
use beamline_core::executor::{AsyncWrapper, WorkerPool};
use beamline_core::logging;
use beamline_core::scope::{with_all, ScopedResource};
use beamline_core::{AsDevice, Quantity};
use beamline_driver_dummy::{build_devices, DriverInstance, Motor, MotorAsync};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "beamline")]
#[command(about = "Inspect and drive simulated beamline devices", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parameter table of every configured device
    Inspect,

    /// Read one parameter as JSON
    Get {
        #[arg(long)]
        device: String,
        #[arg(long)]
        parameter: String,
    },

    /// Write one parameter from JSON
    Set {
        #[arg(long)]
        device: String,
        #[arg(long)]
        parameter: String,
        /// New value, e.g. `42` or `{"magnitude": 5, "unit": "mm"}`
        value: String,
    },

    /// Step a motor through evenly spaced positions on the worker pool
    Scan {
        /// Motor device ID
        #[arg(long)]
        device: String,
        /// First position, in the motor unit
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        /// Last position, in the motor unit
        #[arg(long, allow_hyphen_values = true)]
        stop: f64,
        #[arg(long, default_value = "11")]
        steps: usize,
        /// Shutter to hold open during the scan
        #[arg(long)]
        shutter: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BeamlineConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    WorkerPool::init_global(&config.executor)?;

    info!(
        application = %config.application.name,
        config = %cli.config.display(),
        devices = config.devices.len(),
        "starting"
    );

    let bus: Arc<dyn NotificationBus> = Arc::new(Dispatcher::from_config(&config.bus));
    let devices = build_devices(&config, bus)?;

    match cli.command {
        Commands::Inspect => inspect(&devices),
        Commands::Get { device, parameter } => {
            let value = find(&devices, &device)?.device().get_json(&parameter)?;
            println!("{value}");
            Ok(())
        }
        Commands::Set {
            device,
            parameter,
            value,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value is not valid JSON")?;
            let written = find(&devices, &device)?.device().set_json(&parameter, value);
            if let Err(e) = &written {
                if e.is_validation() {
                    warn!(device = %device, parameter = %parameter, error = %e, "write rejected");
                }
            }
            Ok(written?)
        }
        Commands::Scan {
            device,
            start,
            stop,
            steps,
            shutter,
        } => scan(devices, &device, start, stop, steps, shutter.as_deref()),
    }
}

fn inspect(devices: &[(String, DriverInstance)]) -> Result<()> {
    if devices.is_empty() {
        warn!("no devices configured");
    }
    for (id, instance) in devices {
        println!("{id} ({})", instance.kind());
        println!("{}", instance.device());
    }
    Ok(())
}

fn find<'a>(devices: &'a [(String, DriverInstance)], id: &str) -> Result<&'a DriverInstance> {
    match devices.iter().find(|(device_id, _)| device_id == id) {
        Some((_, instance)) => Ok(instance),
        None => bail!("no enabled device `{id}'"),
    }
}

/// `steps` evenly spaced positions from `start` to `stop`, both included.
fn scan_positions(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let increment = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + increment * i as f64).collect()
        }
    }
}

fn scan(
    mut devices: Vec<(String, DriverInstance)>,
    motor_id: &str,
    start: f64,
    stop: f64,
    steps: usize,
    shutter_id: Option<&str>,
) -> Result<()> {
    let index = devices
        .iter()
        .position(|(id, _)| id == motor_id)
        .with_context(|| format!("no enabled device `{motor_id}'"))?;
    let motor: Motor = match devices.remove(index).1 {
        DriverInstance::Motor(motor) => motor,
        other => bail!("`{motor_id}' is a {}, not a motor", other.kind()),
    };
    let shutter = match shutter_id {
        Some(id) => match find(&devices, id)? {
            DriverInstance::Shutter(shutter) => Some(shutter),
            other => bail!("`{id}' is a {}, not a shutter", other.kind()),
        },
        None => None,
    };

    let unit = motor.kind().unit();
    let motor = AsyncWrapper::with_pool(motor, WorkerPool::global());
    let axis: &dyn ScopedResource = motor.inner().as_ref();
    let mut resources = vec![axis];
    if let Some(shutter) = shutter {
        resources.push(shutter);
    }

    with_all(resources, || {
        if let Some(shutter) = shutter {
            shutter.open()?;
        }
        for (step, target) in scan_positions(start, stop, steps).into_iter().enumerate() {
            motor.set_position(Quantity::new(target, unit)).wait()?;
            let position = motor.position().wait()?;
            println!("{step:>4}  {position}");
        }
        if let Some(shutter) = shutter {
            shutter.close()?;
        }
        Ok(())
    })?;

    info!(device = motor_id, steps, "scan finished");
    Ok(())
}
