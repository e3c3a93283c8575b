//! End-to-end behavior of parameters, devices, the bus and the pool.

use beamline_core::bus::{Dispatcher, RecordingBus};
use beamline_core::executor::{wait_all, AsyncWrapper, WorkerPool};
use beamline_core::messaging::{MessageKind, MessageSource, CHANGED};
use beamline_core::scope::{with_all, MultiLock, ScopedResource};
use beamline_core::units::{Quantity, MILLIMETER, SECOND};
use beamline_core::{
    async_interface, parameter_accessors, AsDevice, Device, DeviceError, NotificationBus,
    Parameter, Result,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn mm(v: f64) -> Quantity {
    Quantity::new(v, MILLIMETER)
}

/// Linear stage with a `position` limited to ±10 mm.
struct Stage {
    device: Device,
    writes: Arc<AtomicUsize>,
}

impl Stage {
    fn new(name: &str, bus: Arc<dyn NotificationBus>) -> Result<Self> {
        let cell = Arc::new(Mutex::new(mm(0.0)));
        let writes = Arc::new(AtomicUsize::new(0));
        let (r, w, n) = (cell.clone(), cell, writes.clone());

        let position = Parameter::new("position")?
            .with_getter(move || Ok(*r.lock()))
            .with_setter(move |v| {
                n.fetch_add(1, Ordering::SeqCst);
                *w.lock() = v;
                Ok(())
            })
            .with_unit(MILLIMETER)
            .with_range(mm(-10.0), mm(10.0))
            .with_bus(bus.clone());

        Ok(Self {
            device: Device::new(name).with_bus(bus).with_parameter(position)?,
            writes,
        })
    }

    fn move_to(&self, target: Quantity) -> Result<Quantity> {
        self.set_position(target)?;
        self.position()
    }
}

impl AsDevice for Stage {
    fn device(&self) -> &Device {
        &self.device
    }
}

parameter_accessors! {
    Stage {
        position / set_position: Quantity => "position";
    }
}

async_interface! {
    trait StageAsync for Stage {
        fn move_to(target: Quantity) -> Quantity;
        fn position() -> Quantity;
    }
}

#[test]
fn position_in_millimeters_scenario() {
    let bus = RecordingBus::new();
    let stage = Stage::new("stage", bus.clone()).unwrap();
    let id = stage.device.parameter::<Quantity>("position").unwrap().sender_id();

    stage.set_position(mm(5.0)).unwrap();
    assert_eq!(stage.position().unwrap(), mm(5.0));
    assert_eq!(bus.count(id, &CHANGED), 1);

    let err = stage.set_position(mm(50.0)).unwrap_err();
    assert!(matches!(err, DeviceError::Limit { .. }));
    assert_eq!(stage.position().unwrap(), mm(5.0));

    let err = stage.set_position(Quantity::new(5.0, SECOND)).unwrap_err();
    assert!(matches!(err, DeviceError::Unit { .. }));

    assert_eq!(bus.count(id, &CHANGED), 1);
    assert_eq!(stage.writes.load(Ordering::SeqCst), 1);
}

#[test]
fn lookup_of_missing_parameter_fails() {
    let stage = Stage::new("stage", RecordingBus::new()).unwrap();
    assert!(matches!(
        stage.device.lookup("missing"),
        Err(DeviceError::Parameter(_))
    ));
}

#[test]
fn changed_is_delivered_on_threaded_dispatcher() {
    let dispatcher = Arc::new(Dispatcher::threaded());
    let stage = Stage::new("stage", dispatcher.clone()).unwrap();
    let position = stage.device.parameter::<Quantity>("position").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    dispatcher.subscribe(
        position.sender_id(),
        CHANGED,
        Arc::new(move |sender| seen_cb.lock().push(sender)),
    );

    stage.set_position(mm(1.0)).unwrap();
    stage.set_position(mm(2.0)).unwrap();
    assert!(stage.set_position(mm(20.0)).is_err());
    dispatcher.flush();

    assert_eq!(*seen.lock(), vec![position.sender_id(); 2]);
}

#[test]
fn wrapped_call_returns_unwrapped_result() {
    let pool = Arc::new(WorkerPool::new(2).unwrap());
    let stage = AsyncWrapper::with_pool(Stage::new("stage", RecordingBus::new()).unwrap(), pool);

    let handle = stage.move_to(mm(3.0));
    assert_eq!(handle.wait().unwrap(), mm(3.0));

    let err = stage.move_to(mm(30.0)).wait().unwrap_err();
    assert!(matches!(err, DeviceError::Limit { .. }));

    // Passthrough: synchronous accessors of the wrapped instance.
    assert_eq!(stage.device.name(), "stage");
    assert_eq!(stage.position().wait().unwrap(), mm(3.0));
}

#[test]
fn capacity_plus_one_concurrent_submissions_complete() {
    const CAPACITY: usize = 10;
    let pool = WorkerPool::new(CAPACITY).unwrap();
    // The first CAPACITY tasks hold every thread until all of them started.
    let barrier = Arc::new(Barrier::new(CAPACITY));
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..=CAPACITY)
        .map(|i| {
            let (barrier, done) = (barrier.clone(), done.clone());
            pool.submit(move || {
                if i < CAPACITY {
                    barrier.wait();
                }
                std::thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();

    let results: Vec<usize> = wait_all(handles)
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(results, (0..=CAPACITY).collect::<Vec<_>>());
    assert_eq!(done.load(Ordering::SeqCst), CAPACITY + 1);
}

#[test]
fn multi_lock_acquires_all_devices() {
    let stages: Vec<Stage> = (0..3)
        .map(|i| Stage::new(&format!("stage-{i}"), RecordingBus::new()).unwrap())
        .collect();
    let resources: Vec<&dyn ScopedResource> =
        stages.iter().map(|s| s as &dyn ScopedResource).collect();

    let guard = MultiLock::new(resources.clone()).enter().unwrap();
    assert_eq!(guard.len(), 3);
    assert!(stages.iter().all(|s| s.device.try_lock().is_none()));
    guard.exit().unwrap();
    assert!(stages.iter().all(|s| s.device.try_lock().is_some()));
}

#[test]
fn multi_lock_failing_body_releases_all_devices() {
    let stages: Vec<Stage> = (0..3)
        .map(|i| Stage::new(&format!("stage-{i}"), RecordingBus::new()).unwrap())
        .collect();
    let resources: Vec<&dyn ScopedResource> =
        stages.iter().map(|s| s as &dyn ScopedResource).collect();

    let result: Result<()> = with_all(resources, || {
        stages[0].set_position(mm(1.0))?;
        stages[1].set_position(mm(99.0))?;
        Ok(())
    });

    assert!(matches!(result, Err(DeviceError::Limit { .. })));
    assert!(stages.iter().all(|s| s.device.try_lock().is_some()));
}

#[test]
fn stage_messages_are_per_instance() {
    let bus = RecordingBus::new();
    let a = Stage::new("a", bus.clone()).unwrap();
    let b = Stage::new("b", bus).unwrap();

    a.device.register_message("overrun".into());
    assert!(!b.device.message_kinds().contains(&MessageKind::from_static("overrun")));
}
