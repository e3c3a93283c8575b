//! Simulated devices driven through the pool, the bus and configuration.

use beamline_core::bus::{Dispatcher, RecordingBus, SenderId};
use beamline_core::config::BeamlineConfig;
use beamline_core::executor::{wait_all, AsyncWrapper, WorkerPool};
use beamline_core::scope::{with_all, ScopedResource};
use beamline_core::units::{Quantity, MILLIMETER, MILLIMETER_PER_SECOND, NANOMETER};
use beamline_core::{AsDevice, DeviceError, MessageSource, Result};
use beamline_driver_dummy::motor::{HOMED, LIMIT_REACHED, STOPPED};
use beamline_driver_dummy::{
    build_devices, Camera, CameraAsync, CameraSettings, DriverInstance, Motor, MotorAsync,
    MotorSettings, Shutter, ShutterAsync, ShutterSettings, SimulationMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mm(v: f64) -> Quantity {
    Quantity::new(v, MILLIMETER)
}

fn pool() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(4).unwrap())
}

#[test]
fn motor_move_through_pool() {
    let bus = RecordingBus::new();
    let motor = AsyncWrapper::with_pool(
        Motor::with_settings("m", MotorSettings::linear(), bus.clone()).unwrap(),
        pool(),
    );

    motor.set_position(mm(5.0)).wait().unwrap();
    motor.move_by(mm(2.5)).wait().unwrap();
    assert_eq!(motor.position().wait().unwrap(), mm(7.5));

    motor.home().wait().unwrap();
    assert!(motor.is_homed());
    assert_eq!(bus.count(motor.sender_id(), &HOMED), 1);
}

#[test]
fn hard_limit_error_surfaces_on_the_handle() {
    let bus = RecordingBus::new();
    let motor = AsyncWrapper::with_pool(
        Motor::with_settings("m", MotorSettings::linear(), bus.clone()).unwrap(),
        pool(),
    );

    let err = motor.set_position(mm(-250.0)).wait().unwrap_err();
    assert!(matches!(err, DeviceError::Hardware(_)));
    assert_eq!(motor.position().wait().unwrap(), mm(-100.0));
    assert_eq!(bus.count(motor.sender_id(), &LIMIT_REACHED), 1);
}

#[test]
fn stop_interrupts_a_realistic_move() {
    let settings = MotorSettings {
        mode: SimulationMode::Realistic,
        ..MotorSettings::linear()
    };
    let bus = RecordingBus::new();
    let motor = AsyncWrapper::with_pool(
        Motor::with_settings("m", settings, bus.clone()).unwrap(),
        pool(),
    );
    // 2 mm/s: a 50 mm move would take 25 s.
    let started = Instant::now();
    let moving = motor.set_position(mm(50.0));

    std::thread::sleep(Duration::from_millis(50));
    motor.stop().wait().unwrap();
    moving.wait().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let position = motor.position().wait().unwrap();
    assert!(position > mm(0.0) && position < mm(50.0));
    assert_eq!(motor.state().unwrap(), "standby");
    assert_eq!(bus.count(motor.sender_id(), &STOPPED), 1);
}

#[test]
fn continuous_motor_runs_until_zero_velocity() {
    let settings = MotorSettings {
        mode: SimulationMode::Realistic,
        ..MotorSettings::continuous_linear()
    };
    let bus = RecordingBus::new();
    let motor = AsyncWrapper::with_pool(
        Motor::with_settings("belt", settings, bus.clone()).unwrap(),
        pool(),
    );

    let running = motor.set_velocity(Quantity::new(5.0, MILLIMETER_PER_SECOND));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        motor.velocity().unwrap(),
        Quantity::new(5.0, MILLIMETER_PER_SECOND)
    );
    assert_eq!(motor.state().unwrap(), "moving");

    motor
        .inner()
        .set_velocity(Quantity::new(0.0, MILLIMETER_PER_SECOND))
        .unwrap();
    running.wait().unwrap();

    let position = motor.position().wait().unwrap();
    assert!(position > mm(0.0) && position < mm(50.0));
    assert_eq!(
        motor.velocity().unwrap(),
        Quantity::new(0.0, MILLIMETER_PER_SECOND)
    );
    assert_eq!(bus.count(motor.sender_id(), &STOPPED), 1);
}

#[test]
fn non_finite_target_does_not_occupy_a_worker() {
    let pool = Arc::new(WorkerPool::new(1).unwrap());
    let motor = AsyncWrapper::with_pool(
        Motor::with_settings("m", MotorSettings::linear(), RecordingBus::new()).unwrap(),
        pool,
    );

    let err = motor.set_position(mm(f64::NAN)).wait().unwrap_err();
    assert!(matches!(err, DeviceError::Limit { .. }));
    motor.set_position(mm(3.0)).wait().unwrap();
    assert_eq!(motor.position().wait().unwrap(), mm(3.0));
}

#[test]
fn realistic_motion_honours_velocity() {
    let settings = MotorSettings {
        mode: SimulationMode::Realistic,
        velocity: 10.0,
        ..MotorSettings::linear()
    };
    let motor = Motor::with_settings("m", settings, RecordingBus::new()).unwrap();
    motor
        .set_motion_velocity(Quantity::new(20.0, MILLIMETER_PER_SECOND))
        .unwrap();

    let started = Instant::now();
    motor.set_position(mm(1.0)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(motor.position().unwrap(), mm(1.0));
}

#[test]
fn camera_acquisition_through_pool() {
    let camera = AsyncWrapper::with_pool(
        Camera::with_settings("cam", CameraSettings::default(), RecordingBus::new()).unwrap(),
        pool(),
    );

    camera.record().wait().unwrap();
    let triggers: Vec<_> = (0..3).map(|_| camera.trigger()).collect();
    for result in wait_all(triggers) {
        result.unwrap();
    }
    camera.stop().wait().unwrap();

    let frame = camera.grab().wait().unwrap();
    assert_eq!(frame.number, 3);
    assert_eq!(frame.pixels.len(), 64 * 48);
}

#[test]
fn shutter_messages_reach_subscribers() {
    let dispatcher = Arc::new(Dispatcher::threaded());
    let shutter = AsyncWrapper::with_pool(
        Shutter::with_settings("sh", ShutterSettings::default(), dispatcher.clone()).unwrap(),
        pool(),
    );

    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    shutter.subscribe(
        beamline_driver_dummy::shutter::OPENED,
        Arc::new(move |_: SenderId| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    shutter.open().wait().unwrap();
    shutter.close().wait().unwrap();
    shutter.open().wait().unwrap();
    dispatcher.flush();

    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[test]
fn configured_devices_lock_together() {
    let config: BeamlineConfig = toml::from_str(
        r#"
        [[devices]]
        id = "sample-x"
        type = "motor"

        [[devices]]
        id = "sample-rot"
        type = "motor"
        settings = { kind = "rotation" }

        [[devices]]
        id = "mono"
        type = "monochromator"
        settings = { energy = 10000.0 }
        "#,
    )
    .unwrap();
    let devices = build_devices(&config, RecordingBus::new()).unwrap();
    assert_eq!(devices.len(), 3);

    let resources: Vec<&dyn ScopedResource> = devices
        .iter()
        .map(|(_, d)| d as &dyn ScopedResource)
        .collect();
    let result: Result<()> = with_all(resources, || {
        for (_, device) in &devices {
            assert!(device.device().try_lock().is_none());
        }
        if let DriverInstance::Monochromator(mono) = &devices[2].1 {
            mono.set_wavelength(Quantity::new(0.1, NANOMETER))?;
        }
        Ok(())
    });
    result.unwrap();

    assert!(devices.iter().all(|(_, d)| d.device().try_lock().is_some()));
    let energy = devices[2].1.device().get_json("energy").unwrap();
    let magnitude = energy["magnitude"].as_f64().unwrap();
    assert!((magnitude - 12_398.419_84).abs() < 1e-3);
}
