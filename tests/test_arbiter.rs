// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    error::Error,
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use vision_camera::{
    arbiter::{NoPins, PinControl, ResourceArbiter, ResourceState, SysfsPins},
    sensor::SensorModel,
    ErrorKind,
};

#[derive(Clone, Default)]
struct CountingPins(Arc<AtomicUsize>);

impl PinControl for CountingPins {
    fn reset_camera_pins(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

type Transitions = Arc<Mutex<Vec<(ResourceState, ResourceState)>>>;

fn observed_arbiter(pins: Box<dyn PinControl>) -> (ResourceArbiter, Transitions) {
    let log: Transitions = Arc::default();
    let sink = log.clone();
    let arbiter = ResourceArbiter::new(pins)
        .with_settle(Duration::from_millis(1))
        .with_observer(move |from, to| sink.lock().unwrap().push((from, to)));
    (arbiter, log)
}

#[test]
fn test_camera_then_audio() -> Result<(), Box<dyn Error>> {
    use ResourceState::*;
    let pins = CountingPins::default();
    let (arbiter, log) = observed_arbiter(Box::new(pins.clone()));

    arbiter.lock_for_camera()?;
    assert_eq!(arbiter.state(), CameraActive);
    assert_eq!(pins.0.load(Ordering::SeqCst), 0);

    // holding the lock already is a no-op
    arbiter.lock_for_camera()?;

    let err = arbiter.lock_for_audio().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceBusy);
    assert_eq!(arbiter.state(), CameraActive);

    arbiter.release()?;
    assert_eq!(arbiter.state(), Idle);
    assert_eq!(pins.0.load(Ordering::SeqCst), 1);

    arbiter.lock_for_audio()?;
    assert_eq!(arbiter.state(), AudioActive);
    assert_eq!(pins.0.load(Ordering::SeqCst), 2);

    let err = arbiter.lock_for_camera().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceBusy);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (Idle, Switching),
            (Switching, CameraActive),
            (CameraActive, Switching),
            (Switching, Idle),
            (Idle, Switching),
            (Switching, AudioActive),
        ]
    );
    Ok(())
}

#[test]
fn test_release_when_idle() -> Result<(), Box<dyn Error>> {
    let (arbiter, log) = observed_arbiter(Box::new(NoPins));
    arbiter.release()?;
    assert_eq!(arbiter.state(), ResourceState::Idle);
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn test_lock_timeout_is_distinct() -> Result<(), Box<dyn Error>> {
    let arbiter = Arc::new(
        ResourceArbiter::new(Box::new(NoPins))
            .with_settle(Duration::from_millis(400))
            .with_lock_timeout(Duration::from_millis(50)),
    );
    let holder = {
        let arbiter = arbiter.clone();
        thread::spawn(move || arbiter.lock_for_camera())
    };
    thread::sleep(Duration::from_millis(100));

    let err = arbiter.lock_for_audio().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert_eq!(arbiter.state(), ResourceState::Switching);

    holder.join().unwrap()?;
    assert_eq!(arbiter.state(), ResourceState::CameraActive);
    Ok(())
}

#[test]
fn test_contention_never_overlaps() -> Result<(), Box<dyn Error>> {
    let (arbiter, log) = observed_arbiter(Box::new(NoPins));
    let arbiter = Arc::new(arbiter.with_lock_timeout(Duration::from_secs(5)));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let arbiter = arbiter.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let locked = if i % 2 == 0 {
                        arbiter.lock_for_camera()
                    } else {
                        arbiter.lock_for_audio()
                    };
                    match locked {
                        Ok(()) => arbiter.release().unwrap(),
                        Err(err) => assert_eq!(err.kind(), ErrorKind::ResourceBusy),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // every change of owner passes through switching
    for (from, to) in log.lock().unwrap().iter() {
        assert!(
            *from == ResourceState::Switching || *to == ResourceState::Switching,
            "direct transition {from} -> {to}"
        );
    }
    assert_eq!(arbiter.state(), ResourceState::Idle);
    Ok(())
}

#[test]
fn test_switch_state_bookkeeping() -> Result<(), Box<dyn Error>> {
    let arbiter = ResourceArbiter::new(Box::new(NoPins)).with_settle(Duration::ZERO);
    arbiter.set_camera_enabled(true)?;
    arbiter.set_camera_initialized(true);
    arbiter.set_detected_model(Some(SensorModel::Ov3660));

    let state = arbiter.switch_state();
    assert!(state.enabled && state.initialized);
    assert_eq!(state.resource_state, ResourceState::CameraActive);
    assert_eq!(state.detected_model, Some(SensorModel::Ov3660));

    arbiter.set_camera_enabled(false)?;
    let state = arbiter.switch_state();
    assert!(!state.enabled);
    assert!(!state.initialized);
    assert_eq!(state.resource_state, ResourceState::Idle);
    assert_eq!(state.resource_state.to_string(), "idle");
    Ok(())
}

#[test]
fn test_set_enabled_same_state_is_noop() -> Result<(), Box<dyn Error>> {
    use ResourceState::*;
    let (arbiter, log) = observed_arbiter(Box::new(NoPins));

    // disabling an idle camera does not touch the arbiter
    arbiter.set_camera_enabled(false)?;
    assert!(log.lock().unwrap().is_empty());

    arbiter.set_camera_enabled(true)?;
    arbiter.set_camera_initialized(true);
    arbiter.set_camera_enabled(true)?;
    assert!(arbiter.switch_state().initialized);
    assert_eq!(
        *log.lock().unwrap(),
        vec![(Idle, Switching), (Switching, CameraActive)]
    );
    Ok(())
}

#[test]
fn test_sysfs_pins_released() -> Result<(), Box<dyn Error>> {
    let root = std::env::temp_dir().join(format!("vision-camera-gpio-{}", std::process::id()));
    fs::create_dir_all(root.join("gpio5"))?;
    fs::write(root.join("gpio5").join("direction"), "out")?;
    fs::write(root.join("unexport"), "")?;

    let pins = SysfsPins::with_root(&root, vec![5, 6]);
    pins.reset_camera_pins();

    assert_eq!(fs::read_to_string(root.join("gpio5").join("direction"))?, "in");
    assert_eq!(fs::read_to_string(root.join("unexport"))?, "5");
    fs::remove_dir_all(&root)?;
    Ok(())
}
