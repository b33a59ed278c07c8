// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Camera device lifecycle and frame capture.
//!
//! Opening walks a degrading ladder of (resolution, JPEG quality, buffer
//! count) tiers chosen from the free memory and the attempt number, so a
//! memory-starved or flaky device still comes up in a reduced
//! configuration. Capture drains a short burst of driver slots and keeps the
//! last one, discarding stale frames buffered by the device.

use crate::{
    backend::{BackendConfig, CaptureBackend, Control, NegotiatedFormat},
    error::{Error, Result},
    format::FormatPriority,
    image::{FrameBuffer, Resolution, Rotation},
    pipeline::{normalize, PixelPipeline},
    sensor::{clamp_level, identify, ControlBus, SensorModel, SensorProfile},
};
use std::{
    fs, io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};
use tracing::{debug, error, info, warn};

/// Free memory above which the configured resolution is attempted.
pub const HIGH_MEMORY: usize = 1024 * 1024;
/// Free memory above which a reduced resolution is attempted.
pub const MEDIUM_MEMORY: usize = 400 * 1024;

#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: PathBuf,
    /// Resolution of the top ladder tier.
    pub resolution: Resolution,
    /// Sensor JPEG quality of the top ladder tier, lower is better.
    pub jpeg_quality: i32,
    pub pixel_clock_hz: u32,
    /// Pixel clock used by every attempt after the first.
    pub reduced_pixel_clock_hz: u32,
    pub max_attempts: usize,
    pub retry_delay: Duration,
    pub dequeue_timeout: Duration,
    /// Overrides the free memory probe.
    pub scratch_memory: Option<usize>,
    /// Slots dequeued per capture; only the last one is kept.
    pub burst_depth: usize,
    pub priority: FormatPriority,
    pub rotation: Rotation,
    pub swap_bytes: bool,
    pub hmirror: bool,
    pub vflip: bool,
    pub auto_detect: bool,
    pub default_model: SensorModel,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            device: PathBuf::from("/dev/video0"),
            resolution: Resolution::VGA,
            jpeg_quality: 12,
            pixel_clock_hz: 15_000_000,
            reduced_pixel_clock_hz: 10_000_000,
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            dequeue_timeout: Duration::from_secs(2),
            scratch_memory: None,
            burst_depth: 3,
            priority: FormatPriority::default(),
            rotation: Rotation::Rotation0,
            swap_bytes: false,
            hmirror: false,
            vflip: false,
            auto_detect: true,
            default_model: SensorModel::Ov2640,
        }
    }
}

/// Parameters of one initialization attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InitTier {
    pub resolution: Resolution,
    pub jpeg_quality: i32,
    pub buffer_count: usize,
    pub pixel_clock_hz: u32,
}

/// Picks the tier for `attempt` given `free` bytes of scratch memory.
///
/// With no free memory at all the lowest tier is used regardless of the
/// attempt number.
pub fn select_tier(config: &CameraConfig, free: usize, attempt: usize) -> InitTier {
    let pixel_clock_hz = if attempt == 0 {
        config.pixel_clock_hz
    } else {
        config.reduced_pixel_clock_hz
    };
    let q = config.jpeg_quality;
    let (resolution, jpeg_quality, buffer_count) = if free == 0 {
        (Resolution::QQVGA, q + 5, 1)
    } else if free > HIGH_MEMORY && attempt == 0 {
        (config.resolution, q, 2)
    } else if free > MEDIUM_MEMORY && attempt <= 1 {
        (Resolution::QVGA, q + 2, 1)
    } else {
        (Resolution::QQVGA, q + 5, 1)
    };
    InitTier {
        resolution,
        jpeg_quality,
        buffer_count,
        pixel_clock_hz,
    }
}

/// Bytes of memory available for frame buffers, from `/proc/meminfo`.
pub fn available_scratch_memory() -> usize {
    let meminfo = match fs::read_to_string("/proc/meminfo") {
        Ok(s) => s,
        Err(err) => {
            warn!("cannot read /proc/meminfo: {err}");
            return 0;
        }
    };
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<usize>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Runtime image controls, cached for status reporting and reapplied when
/// the device is reopened.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SensorSettings {
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub hmirror: bool,
    pub vflip: bool,
}

/// Returns a dequeued slot to the device when dropped.
struct SlotGuard<'a> {
    backend: &'a mut Box<dyn CaptureBackend>,
    index: usize,
}

impl SlotGuard<'_> {
    fn copy(&self, bytes_used: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes_used)
            .map_err(|_| Error::OutOfMemory(bytes_used))?;
        let slot = self
            .backend
            .slot(self.index)
            .ok_or_else(|| Error::device("copy slot", io::Error::other("slot not mapped")))?;
        let used = slot.get(..bytes_used).ok_or_else(|| {
            Error::device("copy slot", io::Error::other("bytes used exceeds slot size"))
        })?;
        data.extend_from_slice(used);
        Ok(data)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.queue_buffer(self.index) {
            error!(index = self.index, "failed to requeue slot: {err}");
        }
    }
}

pub struct CameraDevice {
    backend: Box<dyn CaptureBackend>,
    bus: Option<Box<dyn ControlBus>>,
    pipeline: PixelPipeline,
    config: CameraConfig,
    profile: SensorProfile,
    detected: Option<SensorModel>,
    settings: SensorSettings,
    negotiated: Option<NegotiatedFormat>,
    tier: Option<InitTier>,
    streaming: bool,
    frame: Option<Arc<FrameBuffer>>,
    captured: u64,
}

impl CameraDevice {
    pub fn new(backend: Box<dyn CaptureBackend>, config: CameraConfig) -> Self {
        let profile = SensorProfile::for_model(config.default_model);
        let settings = SensorSettings {
            brightness: profile.tuning.brightness,
            contrast: profile.tuning.contrast,
            saturation: profile.tuning.saturation,
            hmirror: config.hmirror,
            vflip: config.vflip,
        };
        CameraDevice {
            backend,
            bus: None,
            pipeline: PixelPipeline::new(),
            config,
            profile,
            detected: None,
            settings,
            negotiated: None,
            tier: None,
            streaming: false,
            frame: None,
            captured: 0,
        }
    }

    /// Sensor control bus used for identification and tuning.
    pub fn with_bus(mut self, bus: Box<dyn ControlBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_pipeline(mut self, pipeline: PixelPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.streaming
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    /// Model found on the control bus, if identification succeeded.
    pub fn detected_model(&self) -> Option<SensorModel> {
        self.detected
    }

    pub fn sensor_name(&self) -> &'static str {
        self.profile.model.name()
    }

    pub fn negotiated(&self) -> Option<NegotiatedFormat> {
        self.negotiated
    }

    pub fn tier(&self) -> Option<InitTier> {
        self.tier
    }

    pub fn settings(&self) -> SensorSettings {
        self.settings
    }

    /// Most recently published frame.
    pub fn last_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.frame.clone()
    }

    fn identify_sensor(&mut self) {
        if let Some(bus) = self.bus.as_deref_mut() {
            if self.config.auto_detect {
                self.detected = identify(bus);
            }
        }
        let model = self.detected.unwrap_or(self.config.default_model);
        if model != self.profile.model {
            self.profile = SensorProfile::for_model(model);
            self.settings.brightness = self.profile.tuning.brightness;
            self.settings.contrast = self.profile.tuning.contrast;
            self.settings.saturation = self.profile.tuning.saturation;
        }
        info!(
            sensor = model.name(),
            detected = self.detected.is_some(),
            "sensor profile selected"
        );
    }

    /// Opens the device, retrying down the tier ladder.
    pub fn open(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        self.identify_sensor();

        let free = self
            .config
            .scratch_memory
            .unwrap_or_else(available_scratch_memory);
        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            let tier = select_tier(&self.config, free, attempt);
            info!(attempt, free, ?tier, "initializing camera");
            match self.try_open(&tier) {
                Ok(()) => {
                    self.tier = Some(tier);
                    self.apply_tuning();
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, "camera init failed: {err}");
                    self.backend.close();
                    if attempt + 1 < attempts {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        error!(attempts, "camera init failed on every tier");
        Err(Error::InitFailed { attempts })
    }

    fn try_open(&mut self, tier: &InitTier) -> Result<()> {
        let config = BackendConfig {
            device: self.config.device.clone(),
            resolution: tier.resolution,
            // the profile may not ask for better quality than the tier allows
            jpeg_quality: tier.jpeg_quality.max(self.profile.tuning.jpeg_quality),
            pixel_clock_hz: tier.pixel_clock_hz,
            dequeue_timeout: self.config.dequeue_timeout,
        };
        self.backend.open(&config)?;
        let negotiated = self
            .backend
            .negotiate_format(&self.config.priority, tier.resolution)?;
        let granted = self.backend.request_buffers(tier.buffer_count)?;
        for index in 0..granted {
            self.backend.queue_buffer(index)?;
        }
        self.backend.stream_on()?;
        self.negotiated = Some(negotiated);
        self.streaming = true;
        debug!(slots = granted, "streaming started");
        Ok(())
    }

    fn apply_tuning(&mut self) {
        if let Some(bus) = self.bus.as_deref_mut() {
            if let Err(err) = self.profile.apply(bus) {
                warn!(sensor = self.profile.model.name(), "sensor tuning failed: {err}");
            }
        }
        let s = self.settings;
        for (control, value) in [
            (Control::Brightness, s.brightness),
            (Control::Contrast, s.contrast),
            (Control::Saturation, s.saturation),
            (Control::Sharpness, self.profile.tuning.sharpness),
            (Control::HorizontalFlip, s.hmirror as i32),
            (Control::VerticalFlip, s.vflip as i32),
        ] {
            if let Err(err) = self.backend.set_control(control, value) {
                debug!(?control, "control not applied: {err}");
            }
        }
    }

    /// Captures a fresh frame.
    ///
    /// Dequeues `burst_depth` slots in a row and copies only the last one.
    /// Each slot goes back to the device as soon as it has been looked at,
    /// whatever the outcome. The published frame is only replaced when the
    /// whole capture succeeds.
    pub fn capture(&mut self) -> Result<Arc<FrameBuffer>> {
        if !self.streaming {
            return Err(Error::NotReady);
        }
        let negotiated = self.negotiated.ok_or(Error::NotReady)?;
        let depth = self.config.burst_depth.max(1);

        let mut data = None;
        for cycle in 0..depth {
            let slot = self.backend.dequeue_buffer()?;
            let guard = SlotGuard {
                backend: &mut self.backend,
                index: slot.index,
            };
            if cycle + 1 == depth {
                data = Some(guard.copy(slot.bytes_used)?);
            }
        }
        let data = data.ok_or(Error::NotReady)?;

        let mut frame = FrameBuffer::new(data, negotiated.width, negotiated.height, negotiated.format);
        frame.sequence = self.captured;
        frame.timestamp = SystemTime::now();
        let frame = normalize(frame, self.config.swap_bytes)?;
        let frame = self.pipeline.rotate(frame, self.config.rotation)?;

        self.captured += 1;
        self.frame = None;
        let frame = Arc::new(frame);
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    /// Stops streaming and releases the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.streaming {
            if let Err(err) = self.backend.stream_off() {
                warn!("stream off failed: {err}");
            }
        }
        self.backend.close();
        self.streaming = false;
        self.negotiated = None;
        self.tier = None;
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<()> {
        if self.streaming {
            self.backend.set_control(control, value)?;
        }
        Ok(())
    }

    /// Sets brightness, returning the clamped level.
    pub fn set_brightness(&mut self, level: i32) -> Result<i32> {
        let level = clamp_level(level);
        self.set_control(Control::Brightness, level)?;
        self.settings.brightness = level;
        Ok(level)
    }

    pub fn set_contrast(&mut self, level: i32) -> Result<i32> {
        let level = clamp_level(level);
        self.set_control(Control::Contrast, level)?;
        self.settings.contrast = level;
        Ok(level)
    }

    pub fn set_saturation(&mut self, level: i32) -> Result<i32> {
        let level = clamp_level(level);
        self.set_control(Control::Saturation, level)?;
        self.settings.saturation = level;
        Ok(level)
    }

    pub fn set_hmirror(&mut self, enable: bool) -> Result<()> {
        self.set_control(Control::HorizontalFlip, enable as i32)?;
        self.settings.hmirror = enable;
        Ok(())
    }

    pub fn set_vflip(&mut self, enable: bool) -> Result<()> {
        self.set_control(Control::VerticalFlip, enable as i32)?;
        self.settings.vflip = enable;
        Ok(())
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_degrades_with_attempts() {
        let config = CameraConfig::default();
        let free = 8 * 1024 * 1024;
        let t0 = select_tier(&config, free, 0);
        assert_eq!(t0.resolution, Resolution::VGA);
        assert_eq!((t0.jpeg_quality, t0.buffer_count), (12, 2));
        assert_eq!(t0.pixel_clock_hz, 15_000_000);

        let t1 = select_tier(&config, free, 1);
        assert_eq!(t1.resolution, Resolution::QVGA);
        assert_eq!((t1.jpeg_quality, t1.buffer_count), (14, 1));
        assert_eq!(t1.pixel_clock_hz, 10_000_000);

        let t2 = select_tier(&config, free, 2);
        assert_eq!(t2.resolution, Resolution::QQVGA);
        assert_eq!((t2.jpeg_quality, t2.buffer_count), (17, 1));
    }

    #[test]
    fn medium_memory_skips_top_tier() {
        let config = CameraConfig::default();
        let t0 = select_tier(&config, 512 * 1024, 0);
        assert_eq!(t0.resolution, Resolution::QVGA);
        let low = select_tier(&config, 100 * 1024, 0);
        assert_eq!(low.resolution, Resolution::QQVGA);
    }
}
