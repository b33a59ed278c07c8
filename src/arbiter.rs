// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Exclusive ownership of the capture hardware shared by camera and audio.
//!
//! The camera interface and the audio codec share pins, so at most one side
//! may hold them. Every change of owner passes through
//! [`ResourceState::Switching`] and waits a short settle delay before the new
//! owner is recorded. All transitions are serialized by a lock with a
//! bounded acquisition time; failing to get that lock is an error distinct
//! from finding the resource busy.

use crate::{
    error::{Error, Result},
    sensor::SensorModel,
};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, PoisonError},
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResourceState {
    #[default]
    Idle,
    AudioActive,
    CameraActive,
    Switching,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Idle => "idle",
            ResourceState::AudioActive => "audio_active",
            ResourceState::CameraActive => "camera_active",
            ResourceState::Switching => "switching",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the arbiter's bookkeeping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchState {
    pub enabled: bool,
    pub initialized: bool,
    pub resource_state: ResourceState,
    pub detected_model: Option<SensorModel>,
}

/// Puts camera-owned pins back into a neutral state.
pub trait PinControl: Send + Sync {
    fn reset_camera_pins(&self);
}

/// Boards without shared pins.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoPins;

impl PinControl for NoPins {
    fn reset_camera_pins(&self) {}
}

/// Releases camera pins through the sysfs GPIO interface by switching them
/// to inputs and unexporting them.
#[derive(Clone, Debug)]
pub struct SysfsPins {
    root: PathBuf,
    pins: Vec<u32>,
}

impl SysfsPins {
    pub fn new(pins: impl Into<Vec<u32>>) -> Self {
        SysfsPins::with_root("/sys/class/gpio", pins)
    }

    pub fn with_root(root: impl AsRef<Path>, pins: impl Into<Vec<u32>>) -> Self {
        SysfsPins {
            root: root.as_ref().to_path_buf(),
            pins: pins.into(),
        }
    }
}

impl PinControl for SysfsPins {
    fn reset_camera_pins(&self) {
        for pin in &self.pins {
            let gpio = self.root.join(format!("gpio{pin}"));
            if !gpio.exists() {
                continue;
            }
            if let Err(err) = fs::write(gpio.join("direction"), "in") {
                warn!(pin, "failed to set pin direction: {err}");
            }
            if let Err(err) = fs::write(self.root.join("unexport"), pin.to_string()) {
                warn!(pin, "failed to unexport pin: {err}");
            }
        }
        debug!(pins = ?self.pins, "camera pins reset");
    }
}

/// Mutex with a bounded wait, built from a flag and a condition variable.
struct TimedLock {
    held: Mutex<bool>,
    released: Condvar,
}

struct TimedGuard<'a> {
    lock: &'a TimedLock,
}

impl TimedLock {
    fn new() -> Self {
        TimedLock {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, timeout: Duration) -> Option<TimedGuard<'_>> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut held, _) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        if *held {
            return None;
        }
        *held = true;
        Some(TimedGuard { lock: self })
    }
}

impl Drop for TimedGuard<'_> {
    fn drop(&mut self) {
        *self.lock.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.lock.released.notify_one();
    }
}

type Observer = Box<dyn Fn(ResourceState, ResourceState) + Send + Sync>;

pub struct ResourceArbiter {
    lock: TimedLock,
    state: Mutex<SwitchState>,
    pins: Box<dyn PinControl>,
    lock_timeout: Duration,
    settle: Duration,
    observer: Option<Observer>,
}

impl ResourceArbiter {
    pub fn new(pins: Box<dyn PinControl>) -> Self {
        ResourceArbiter {
            lock: TimedLock::new(),
            state: Mutex::new(SwitchState::default()),
            pins,
            lock_timeout: Duration::from_millis(1000),
            settle: Duration::from_millis(10),
            observer: None,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Called with `(from, to)` on every state change.
    pub fn with_observer(
        mut self,
        observer: impl Fn(ResourceState, ResourceState) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> ResourceState {
        self.switch_state().resource_state
    }

    pub fn switch_state(&self) -> SwitchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, op: &'static str) -> Result<TimedGuard<'_>> {
        self.lock.acquire(self.lock_timeout).ok_or_else(|| {
            error!(
                op,
                timeout = ?self.lock_timeout,
                "resource lock timed out, operation is unrecoverable"
            );
            Error::LockTimeout(self.lock_timeout)
        })
    }

    fn set_state(&self, to: ResourceState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut state.resource_state, to)
        };
        if from != to {
            debug!(%from, %to, "resource state");
            if let Some(observer) = &self.observer {
                observer(from, to);
            }
        }
    }

    fn transition(&self, to: ResourceState, reset_pins: bool) {
        self.set_state(ResourceState::Switching);
        if reset_pins {
            self.pins.reset_camera_pins();
        }
        thread::sleep(self.settle);
        self.set_state(to);
    }

    fn lock_for(&self, target: ResourceState, op: &'static str) -> Result<()> {
        let _guard = self.acquire(op)?;
        let current = self.state();
        if current == target {
            return Ok(());
        }
        if current != ResourceState::Idle {
            warn!(op, held = %current, "camera resource busy");
            return Err(Error::ResourceBusy(current));
        }
        // audio must not inherit pins configured by the camera
        self.transition(target, target == ResourceState::AudioActive);
        info!(state = %target, "resource acquired");
        Ok(())
    }

    pub fn lock_for_camera(&self) -> Result<()> {
        self.lock_for(ResourceState::CameraActive, "lock_for_camera")
    }

    pub fn lock_for_audio(&self) -> Result<()> {
        self.lock_for(ResourceState::AudioActive, "lock_for_audio")
    }

    pub fn release(&self) -> Result<()> {
        let _guard = self.acquire("release")?;
        if self.state() == ResourceState::Idle {
            return Ok(());
        }
        self.transition(ResourceState::Idle, true);
        info!("resource released");
        Ok(())
    }

    /// Enabling takes the camera lock, disabling releases it and clears the
    /// initialized flag. Requesting the current state does nothing.
    pub fn set_camera_enabled(&self, enabled: bool) -> Result<()> {
        if self.switch_state().enabled == enabled {
            return Ok(());
        }
        if enabled {
            self.lock_for_camera()?;
            self.update(|s| s.enabled = true);
        } else {
            self.release()?;
            self.update(|s| {
                s.enabled = false;
                s.initialized = false;
            });
        }
        Ok(())
    }

    pub fn set_camera_initialized(&self, initialized: bool) {
        self.update(|s| s.initialized = initialized);
    }

    pub fn set_detected_model(&self, model: Option<SensorModel>) {
        self.update(|s| s.detected_model = model);
    }

    fn update(&self, f: impl FnOnce(&mut SwitchState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl fmt::Debug for ResourceArbiter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResourceArbiter")
            .field("state", &self.switch_state())
            .field("lock_timeout", &self.lock_timeout)
            .field("settle", &self.settle)
            .finish()
    }
}
