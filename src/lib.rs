// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # Vision Camera Library
//!
//! Capture, conversion and upload engine for small image sensors sharing
//! their pins with an audio codec. The library opens a capture device with
//! a degrading retry ladder, negotiates the pixel format, copies the
//! freshest driver buffer into an owned frame, converts and rotates it,
//! compresses it to JPEG on a background thread and streams the result to
//! an MJPEG client or a remote vision endpoint.
//!
//! ## Features
//!
//! - **Sensor Identification**: Probes OV2640, OV3660 and OV5640 sensors
//!   over i2c and applies per-model tuning.
//! - **Capture Backends**: V4L2 memory-mapped streaming, plus a synthetic
//!   pattern device for development and tests.
//! - **Pixel Pipeline**: Byte-swap, planar relabelling, RGB565/RGB888/YUV
//!   conversion and 90 degree rotations with an optional accelerator.
//! - **JPEG Encoding**: turbojpeg compression delivered as a bounded
//!   stream of chunks.
//! - **Resource Arbitration**: Exclusive camera/audio ownership of shared
//!   hardware with a bounded lock.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vision_camera::{
//!     arbiter::{NoPins, ResourceArbiter},
//!     backend::pattern::PatternBackend,
//!     camera::{CameraConfig, CameraDevice},
//!     explain::HttpTransport,
//!     vision::{VisionConfig, VisionService},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let camera = CameraDevice::new(Box::new(PatternBackend::new()), CameraConfig::default());
//! let arbiter = Arc::new(ResourceArbiter::new(Box::new(NoPins)));
//! let service = VisionService::new(
//!     VisionConfig::default(),
//!     camera,
//!     arbiter,
//!     Box::new(HttpTransport::new()),
//!     None,
//! );
//! service.start()?;
//! let jpeg = service.capture_jpeg()?;
//! println!("captured {} bytes", jpeg.len());
//! service.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! The V4L2 backend and the i2c bus use `unsafe` for ioctls and buffer
//! mapping. Both are wrapped in safe types that unmap and close on drop.

pub mod arbiter;
pub mod backend;
pub mod camera;
pub mod error;
pub mod explain;
pub mod flash;
pub mod format;
pub mod image;
pub mod jpeg;
pub mod mjpeg;
pub mod pipeline;
pub mod sensor;
pub mod vision;

pub use error::{Error, ErrorKind, Result};
