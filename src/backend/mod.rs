// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture backends.
//!
//! A backend owns the device handle and its driver-managed frame slots. The
//! camera drives it through a fixed lifecycle: open, negotiate a format,
//! request and queue slots, stream on, then any number of dequeue/requeue
//! cycles before stream off and close. Which backend is used is decided once
//! at start-up.

use crate::{
    error::Result,
    format::FormatPriority,
    image::{FourCC, Resolution},
};
use std::{path::PathBuf, time::Duration};
use tracing::info;

pub mod pattern;
pub mod v4l2;

pub use pattern::PatternBackend;
pub use v4l2::V4l2Backend;

/// Device parameters for one open attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    pub device: PathBuf,
    pub resolution: Resolution,
    /// Sensor JPEG quality, lower is better.
    pub jpeg_quality: i32,
    pub pixel_clock_hz: u32,
    pub dequeue_timeout: Duration,
}

/// Format chosen by negotiation together with the size the driver accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: FourCC,
    pub width: u32,
    pub height: u32,
}

/// A slot handed out by [`CaptureBackend::dequeue_buffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DequeuedSlot {
    pub index: usize,
    pub bytes_used: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Control {
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    HorizontalFlip,
    VerticalFlip,
    JpegQuality,
}

pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    fn open(&mut self, config: &BackendConfig) -> Result<()>;

    /// Formats the device can produce, in the order it reports them.
    fn enum_formats(&mut self) -> Result<Vec<FourCC>>;

    /// Applies a format, returning what the driver actually configured.
    fn set_format(&mut self, format: FourCC, resolution: Resolution) -> Result<NegotiatedFormat>;

    fn negotiate_format(
        &mut self,
        priority: &FormatPriority,
        resolution: Resolution,
    ) -> Result<NegotiatedFormat> {
        let advertised = self.enum_formats()?;
        let format = priority.select(&advertised)?;
        let negotiated = self.set_format(format, resolution)?;
        info!(
            backend = self.name(),
            format = %negotiated.format,
            width = negotiated.width,
            height = negotiated.height,
            "format negotiated"
        );
        Ok(negotiated)
    }

    /// Requests `count` slots, returning how many the driver granted.
    fn request_buffers(&mut self, count: usize) -> Result<usize>;

    fn queue_buffer(&mut self, index: usize) -> Result<()>;

    /// Blocks until a filled slot is available or the configured timeout
    /// expires.
    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot>;

    /// Contents of a slot. Only meaningful while the slot is dequeued.
    fn slot(&self, index: usize) -> Option<&[u8]>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    fn set_control(&mut self, control: Control, value: i32) -> Result<()>;

    /// Releases slots and the device handle. Safe to call repeatedly.
    fn close(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    V4l2,
    Pattern,
}

impl BackendKind {
    pub fn create(&self) -> Box<dyn CaptureBackend> {
        match self {
            BackendKind::V4l2 => Box::new(V4l2Backend::new()),
            BackendKind::Pattern => Box::new(PatternBackend::new()),
        }
    }
}
