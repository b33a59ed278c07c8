// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Vision service facade.
//!
//! [`VisionService`] owns the camera, the background JPEG encoder and the
//! flash, and coordinates them with the [`ResourceArbiter`]. The camera lock
//! is taken once by [`VisionService::start`] and held until
//! [`VisionService::stop`], not per frame.
//!
//! While streaming, a pump thread captures at a fixed cadence, compresses
//! each frame and publishes it on a watch channel that MJPEG clients
//! subscribe to through [`VisionService::frames`].

use crate::{
    arbiter::{ResourceArbiter, ResourceState},
    camera::{CameraDevice, SensorSettings},
    error::{Error, Result},
    explain::{multipart, ExplainConfig, UploadRequest, UploadTransport},
    flash::FlashLed,
    image::FrameBuffer,
    jpeg::{encode_jpeg, ChunkStream, JpegEncoder, CHUNK_SIZE, DEFAULT_QUALITY, QUEUE_CAPACITY},
    mjpeg::JpegFrame,
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct VisionConfig {
    /// Target time between frames published while streaming.
    pub stream_interval: Duration,
    /// Quality of JPEGs produced for streaming and uploads.
    pub jpeg_quality: i32,
    /// Upper bound on the effective flash level while streaming.
    pub stream_flash_cap: u8,
    /// Time the flash is given to reach full power before a flash capture.
    pub flash_settle: Duration,
    /// Coordinate camera ownership through the arbiter.
    pub resource_managed: bool,
    /// Size of the JPEG pieces handed to the upload.
    pub upload_chunk_size: usize,
    /// Encoded chunks buffered ahead of the upload.
    pub upload_queue_depth: usize,
    pub explain: Option<ExplainConfig>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        VisionConfig {
            stream_interval: Duration::from_millis(100),
            jpeg_quality: DEFAULT_QUALITY,
            stream_flash_cap: 50,
            flash_settle: Duration::from_millis(100),
            resource_managed: true,
            upload_chunk_size: CHUNK_SIZE,
            upload_queue_depth: QUEUE_CAPACITY,
            explain: None,
        }
    }
}

struct Flash {
    led: Option<Box<dyn FlashLed>>,
    /// Requested level, before the streaming cap.
    level: u8,
    /// Level last written to the LED.
    effective: u8,
}

impl Flash {
    fn drive(&mut self, level: u8) -> Result<()> {
        if let Some(led) = self.led.as_mut() {
            led.set_level(level)?;
        }
        self.effective = level;
        Ok(())
    }
}

struct Pump {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct VisionService {
    config: VisionConfig,
    camera: Arc<Mutex<CameraDevice>>,
    arbiter: Arc<ResourceArbiter>,
    encoder: Mutex<JpegEncoder>,
    transport: Box<dyn UploadTransport>,
    flash: Mutex<Flash>,
    frames: Arc<watch::Sender<Option<JpegFrame>>>,
    pump: Mutex<Option<Pump>>,
    running: AtomicBool,
    streaming: AtomicBool,
}

impl VisionService {
    pub fn new(
        config: VisionConfig,
        camera: CameraDevice,
        arbiter: Arc<ResourceArbiter>,
        transport: Box<dyn UploadTransport>,
        flash: Option<Box<dyn FlashLed>>,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        VisionService {
            encoder: Mutex::new(
                JpegEncoder::new(config.jpeg_quality)
                    .with_chunking(config.upload_chunk_size, config.upload_queue_depth),
            ),
            config,
            camera: Arc::new(Mutex::new(camera)),
            arbiter,
            transport,
            flash: Mutex::new(Flash {
                led: flash,
                level: 0,
                effective: 0,
            }),
            frames: Arc::new(frames),
            pump: Mutex::new(None),
            running: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// True while a background encode has not been joined.
    pub fn encoder_in_flight(&self) -> bool {
        lock(&self.encoder).in_flight()
    }

    /// Takes the camera lock and opens the device.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.config.resource_managed {
            self.arbiter.set_camera_enabled(true)?;
        }
        let opened = {
            let mut camera = lock(&self.camera);
            camera.open().map(|()| camera.detected_model())
        };
        match opened {
            Ok(detected) => {
                if self.config.resource_managed {
                    self.arbiter.set_detected_model(detected);
                    self.arbiter.set_camera_initialized(true);
                }
                self.running.store(true, Ordering::Release);
                info!("vision service started");
                Ok(())
            }
            Err(err) => {
                if self.config.resource_managed {
                    if let Err(release) = self.arbiter.set_camera_enabled(false) {
                        warn!("failed to release camera after init error: {release}");
                    }
                }
                Err(err)
            }
        }
    }

    /// Stops streaming, closes the device and hands the pins back.
    pub fn stop(&self) -> Result<()> {
        self.stop_streaming();
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.encoder).join();
        if let Err(err) = lock(&self.flash).drive(0) {
            warn!("failed to switch flash off: {err}");
        }
        lock(&self.camera).close();
        if self.config.resource_managed {
            self.arbiter.set_camera_initialized(false);
            self.arbiter.set_camera_enabled(false)?;
        }
        info!("vision service stopped");
        Ok(())
    }

    /// Starts the frame pump publishing to [`VisionService::frames`].
    pub fn start_streaming(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotReady);
        }
        let mut pump = lock(&self.pump);
        if pump.is_some() || self.is_streaming() {
            return Err(Error::AlreadyStreaming);
        }
        self.streaming.store(true, Ordering::Release);
        self.apply_flash();

        let stop = Arc::new(AtomicBool::new(false));
        let worker = FramePump {
            camera: self.camera.clone(),
            frames: self.frames.clone(),
            stop: stop.clone(),
            interval: self.config.stream_interval,
            quality: self.config.jpeg_quality,
        };
        let task = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || worker.run())
            .map_err(|err| {
                self.streaming.store(false, Ordering::Release);
                Error::from(err)
            })?;
        *pump = Some(Pump { stop, task });
        info!(interval = ?self.config.stream_interval, "streaming started");
        Ok(())
    }

    /// Stops the frame pump. Does nothing when not streaming.
    pub fn stop_streaming(&self) {
        let Some(pump) = lock(&self.pump).take() else {
            return;
        };
        pump.stop.store(true, Ordering::Release);
        if pump.task.join().is_err() {
            error!("frame pump panicked");
        }
        self.streaming.store(false, Ordering::Release);
        self.apply_flash();
        info!("streaming stopped");
    }

    /// Subscribes to frames published while streaming.
    pub fn frames(&self) -> watch::Receiver<Option<JpegFrame>> {
        self.frames.subscribe()
    }

    pub fn capture(&self) -> Result<Arc<FrameBuffer>> {
        if !self.is_running() {
            return Err(Error::NotReady);
        }
        lock(&self.camera).capture()
    }

    pub fn capture_jpeg(&self) -> Result<Vec<u8>> {
        let frame = self.capture()?;
        encode_jpeg(&frame, self.config.jpeg_quality)
    }

    /// Captures with the flash briefly at full power, then restores it.
    pub fn capture_with_flash(&self) -> Result<Arc<FrameBuffer>> {
        if !self.is_running() {
            return Err(Error::NotReady);
        }
        let has_flash = lock(&self.flash).led.is_some();
        if !has_flash {
            return self.capture();
        }
        lock(&self.flash).drive(100)?;
        thread::sleep(self.config.flash_settle);
        let frame = self.capture();
        self.apply_flash();
        frame
    }

    /// Captures a frame and asks the explain endpoint about it.
    ///
    /// The JPEG is encoded in the background and uploaded chunk by chunk
    /// while encoding continues. On success the response body is returned
    /// unchanged. On failure the chunk queue is drained and the encoder
    /// joined before the error is returned.
    pub fn capture_and_explain(&self, question: &str) -> Result<String> {
        let explain = self
            .config
            .explain
            .as_ref()
            .filter(|c| !c.url.is_empty())
            .ok_or(Error::ExplainUnconfigured)?;
        let frame = self.capture()?;
        let started = Instant::now();

        let mut encoder = lock(&self.encoder);
        let mut chunks = encoder.encode_async(frame.clone());
        let result = self.upload(explain, question, &mut chunks);
        if result.is_err() {
            let dropped = chunks.drain();
            debug!(dropped, "discarded unsent jpeg data");
        }
        encoder.join();

        if let Ok(body) = &result {
            info!(
                width = frame.width,
                height = frame.height,
                compressed = chunks.bytes_received(),
                elapsed = ?started.elapsed(),
                question,
                "explain finished: {body}"
            );
        }
        result
    }

    fn upload(
        &self,
        explain: &ExplainConfig,
        question: &str,
        chunks: &mut ChunkStream,
    ) -> Result<String> {
        let request = UploadRequest::new(explain);
        let mut upload = self.transport.open(&request).inspect_err(|err| {
            error!(url = %explain.url, "failed to connect to explain url: {err}");
        })?;
        let boundary = &explain.boundary;
        upload.write(multipart::question_part(boundary, question).as_bytes())?;
        upload.write(multipart::file_part_header(boundary).as_bytes())?;
        while let Some(chunk) = chunks.recv()? {
            upload.write(&chunk)?;
        }
        if chunks.bytes_received() == 0 {
            error!("jpeg encoder failed or produced empty output");
            return Err(Error::Encode("encoder produced no data".to_string()));
        }
        upload.write(multipart::footer(boundary).as_bytes())?;

        let response = upload.finish()?;
        if response.status != 200 {
            error!(status = response.status, "failed to upload photo");
            return Err(Error::HttpStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response.body)
    }

    pub fn has_flash(&self) -> bool {
        lock(&self.flash).led.is_some()
    }

    /// Sets the flash level in percent, returning the level applied to the
    /// LED after the streaming cap.
    pub fn set_flash_level(&self, level: i32) -> Result<u8> {
        let level = level.clamp(0, 100) as u8;
        let effective = self.effective_flash(level);
        let mut flash = lock(&self.flash);
        flash.level = level;
        flash.drive(effective)?;
        debug!(level, effective, "flash level set");
        Ok(effective)
    }

    /// Requested flash level.
    pub fn flash_level(&self) -> u8 {
        lock(&self.flash).level
    }

    fn effective_flash(&self, level: u8) -> u8 {
        if self.is_streaming() {
            level.min(self.config.stream_flash_cap)
        } else {
            level
        }
    }

    fn apply_flash(&self) {
        let mut flash = lock(&self.flash);
        let effective = self.effective_flash(flash.level);
        if let Err(err) = flash.drive(effective) {
            warn!(effective, "failed to update flash: {err}");
        }
    }

    pub fn set_brightness(&self, level: i32) -> Result<i32> {
        lock(&self.camera).set_brightness(level)
    }

    pub fn set_contrast(&self, level: i32) -> Result<i32> {
        lock(&self.camera).set_contrast(level)
    }

    pub fn set_saturation(&self, level: i32) -> Result<i32> {
        lock(&self.camera).set_saturation(level)
    }

    pub fn set_hmirror(&self, enable: bool) -> Result<()> {
        lock(&self.camera).set_hmirror(enable)
    }

    pub fn set_vflip(&self, enable: bool) -> Result<()> {
        lock(&self.camera).set_vflip(enable)
    }

    pub fn settings(&self) -> SensorSettings {
        lock(&self.camera).settings()
    }

    pub fn sensor_name(&self) -> &'static str {
        lock(&self.camera).sensor_name()
    }

    pub fn status(&self) -> Value {
        let (sensor, settings) = {
            let camera = lock(&self.camera);
            (camera.sensor_name(), camera.settings())
        };
        let (has_flash, led_intensity) = {
            let flash = lock(&self.flash);
            (flash.led.is_some(), flash.effective)
        };
        let switch = self.arbiter.switch_state();
        let available = matches!(
            switch.resource_state,
            ResourceState::Idle | ResourceState::CameraActive
        );
        let mut status = json!({
            "available": available,
            "running": self.is_running(),
            "streaming": self.is_streaming(),
            "led_intensity": led_intensity,
            "sensor": sensor,
            "has_flash": has_flash,
            "brightness": settings.brightness,
            "contrast": settings.contrast,
            "saturation": settings.saturation,
            "hmirror": settings.hmirror,
            "vflip": settings.vflip,
        });
        if self.config.resource_managed {
            if let Value::Object(map) = &mut status {
                map.insert("enabled".into(), json!(switch.enabled));
                map.insert("initialized".into(), json!(switch.initialized));
                map.insert(
                    "resource_state".into(),
                    json!(switch.resource_state.as_str()),
                );
                map.insert(
                    "detected_model".into(),
                    json!(switch.detected_model.map(|m| m.name())),
                );
            }
        }
        status
    }
}

impl Drop for VisionService {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("vision service shutdown: {err}");
        }
    }
}

struct FramePump {
    camera: Arc<Mutex<CameraDevice>>,
    frames: Arc<watch::Sender<Option<JpegFrame>>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    quality: i32,
}

impl FramePump {
    fn run(self) {
        let mut published = 0u64;
        while !self.stop.load(Ordering::Acquire) {
            let tick = Instant::now();
            match self.publish() {
                Ok(()) => published += 1,
                Err(err) => warn!("stream frame dropped: {err}"),
            }
            if let Some(rest) = self.interval.checked_sub(tick.elapsed()) {
                thread::sleep(rest);
            }
        }
        debug!(published, "frame pump exiting");
    }

    fn publish(&self) -> Result<()> {
        let frame = lock(&self.camera).capture()?;
        let data = encode_jpeg(&frame, self.quality)?;
        self.frames.send_replace(Some(JpegFrame {
            data: Arc::new(data),
            sequence: frame.sequence,
            timestamp: frame.timestamp,
        }));
        Ok(())
    }
}
