// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use std::{path::PathBuf, time::Duration};
use vision_camera::{
    backend::BackendKind,
    camera::CameraConfig,
    explain::{self, ExplainConfig, DEFAULT_BOUNDARY},
    format::FormatPriority,
    image::{Resolution, Rotation},
    sensor::SensorModel,
    vision::VisionConfig,
};

/// Capture backend selection.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum BackendSetting {
    /// Linux V4L2 capture device
    V4l2,
    /// Synthetic test pattern, no hardware required
    Pattern,
}

impl From<BackendSetting> for BackendKind {
    fn from(setting: BackendSetting) -> Self {
        match setting {
            BackendSetting::V4l2 => BackendKind::V4l2,
            BackendSetting::Pattern => BackendKind::Pattern,
        }
    }
}

/// Image rotation applied after capture.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum RotationSetting {
    /// No rotation
    #[value(name = "0")]
    Rotate0,
    /// 90 degrees clockwise
    #[value(name = "90")]
    Rotate90,
    /// 180 degrees
    #[value(name = "180")]
    Rotate180,
    /// 270 degrees clockwise
    #[value(name = "270")]
    Rotate270,
}

impl From<RotationSetting> for Rotation {
    fn from(setting: RotationSetting) -> Self {
        match setting {
            RotationSetting::Rotate0 => Rotation::Rotation0,
            RotationSetting::Rotate90 => Rotation::Rotation90,
            RotationSetting::Rotate180 => Rotation::Rotation180,
            RotationSetting::Rotate270 => Rotation::Rotation270,
        }
    }
}

/// Command-line arguments for the vision camera service.
///
/// Every option can also be given through the environment variable named
/// in its help text.
///
/// # Example
///
/// ```bash
/// # Via command line
/// vision-camera --device /dev/video0 --listen 0.0.0.0:8081 --stream
///
/// # Via environment variables
/// export CAMERA=/dev/video0
/// export EXPLAIN_URL=https://example.com/vision/explain
/// vision-camera
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera capture device path (e.g., /dev/video0)
    #[arg(short, long, env = "CAMERA", default_value = "/dev/video0")]
    pub device: PathBuf,

    /// Capture backend
    #[arg(long, env = "BACKEND", default_value = "v4l2", value_enum)]
    pub backend: BackendSetting,

    /// Highest capture resolution tried at startup (width height)
    #[arg(
        long,
        env = "CAMERA_SIZE",
        default_value = "640 480",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub camera_size: Vec<u32>,

    /// Sensor JPEG quality of the first init attempt (lower is better)
    #[arg(long, env = "SENSOR_QUALITY", default_value = "12")]
    pub sensor_quality: i32,

    /// Sensor pixel clock in Hz for the first init attempt
    #[arg(long, env = "PIXEL_CLOCK", default_value = "15000000")]
    pub pixel_clock: u32,

    /// Scratch memory in bytes, overriding the /proc/meminfo probe
    #[arg(long, env = "SCRATCH_MEMORY")]
    pub scratch_memory: Option<usize>,

    /// Device buffers drained per capture, only the last is kept
    #[arg(long, env = "BURST_DEPTH", default_value = "3")]
    pub burst_depth: usize,

    /// Rotation applied to captured frames
    #[arg(long, env = "ROTATION", default_value = "0", value_enum)]
    pub rotation: RotationSetting,

    /// Swap bytes of 16-bit pixels from big-endian sensors
    #[arg(long, env = "SWAP_BYTES")]
    pub swap_bytes: bool,

    /// Use the scale/rotate engine instead of software rotation
    #[arg(long, env = "SRM")]
    pub srm: bool,

    /// Disable sensor identification over i2c
    #[arg(long, env = "NO_AUTO_DETECT")]
    pub no_auto_detect: bool,

    /// Sensor model assumed when identification fails
    #[arg(long, env = "SENSOR_MODEL", default_value = "OV2640")]
    pub sensor_model: SensorModel,

    /// I2C bus of the sensor control interface (e.g., /dev/i2c-1)
    #[arg(long, env = "I2C_BUS")]
    pub i2c_bus: Option<PathBuf>,

    /// GPIO numbers of camera pins released before audio use
    #[arg(long, env = "CAMERA_PINS", value_delimiter = ' ')]
    pub camera_pins: Vec<u32>,

    /// LED class name of the flash (e.g., white:flash), discovered if unset
    #[arg(long, env = "FLASH_LED")]
    pub flash_led: Option<String>,

    /// Vision explain endpoint URL
    #[arg(long, env = "EXPLAIN_URL")]
    pub explain_url: Option<String>,

    /// Bearer token sent to the explain endpoint
    #[arg(long, env = "EXPLAIN_TOKEN", default_value = "")]
    pub explain_token: String,

    /// Device identifier sent with explain requests, defaults to the MAC
    /// address of the first network interface
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    /// Client identifier sent with explain requests, defaults to a random UUID
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// Address the MJPEG stream listens on (e.g., 0.0.0.0:8081)
    #[arg(long, env = "LISTEN")]
    pub listen: Option<String>,

    /// Milliseconds between streamed frames
    #[arg(long, env = "STREAM_INTERVAL", default_value = "100")]
    pub stream_interval: u64,

    /// Start streaming immediately
    #[arg(long, env = "STREAM")]
    pub stream: bool,

    /// Capture once, ask the explain endpoint this question and exit
    #[arg(long)]
    pub explain: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn resolution(&self) -> Resolution {
        match self.camera_size.as_slice() {
            [width, height] => Resolution::new(*width, *height),
            _ => Resolution::VGA,
        }
    }

    /// Explain settings, present when an endpoint URL is given.
    pub fn explain_config(&self) -> Option<ExplainConfig> {
        let url = self.explain_url.clone().filter(|url| !url.is_empty())?;
        Some(ExplainConfig {
            url,
            token: self.explain_token.clone(),
            device_id: self
                .device_id
                .clone()
                .filter(|id| !id.is_empty())
                .or_else(explain::host_device_id)
                .unwrap_or_default(),
            client_id: self
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(explain::generate_client_id),
            boundary: DEFAULT_BOUNDARY.to_string(),
            ..Default::default()
        })
    }
}

impl From<&Args> for CameraConfig {
    fn from(args: &Args) -> Self {
        CameraConfig {
            device: args.device.clone(),
            resolution: args.resolution(),
            jpeg_quality: args.sensor_quality,
            pixel_clock_hz: args.pixel_clock,
            scratch_memory: args.scratch_memory,
            burst_depth: args.burst_depth,
            priority: if args.rotation == RotationSetting::Rotate0 {
                FormatPriority::standard(false, false)
            } else {
                FormatPriority::rotation(false)
            },
            rotation: args.rotation.into(),
            swap_bytes: args.swap_bytes,
            auto_detect: !args.no_auto_detect,
            default_model: args.sensor_model,
            ..Default::default()
        }
    }
}

impl From<&Args> for VisionConfig {
    fn from(args: &Args) -> Self {
        VisionConfig {
            stream_interval: Duration::from_millis(args.stream_interval.max(1)),
            explain: args.explain_config(),
            ..Default::default()
        }
    }
}
