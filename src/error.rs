// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{arbiter::ResourceState, image::FourCC};
use std::{io, time::Duration};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`] values.
///
/// Callers that only need to decide how to react (retry, report busy,
/// give up) match on the kind instead of every variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Driver, bus, memory or stream failure on the capture path.
    HardwareFault,
    /// The shared pins are owned by another subsystem.
    ResourceBusy,
    /// The arbiter mutex could not be taken in time.
    LockTimeout,
    /// JPEG compression failed or produced no data.
    EncodeFailure,
    /// Upload connection, write or non-200 response.
    NetworkFailure,
    /// Pixel format or rotation the pipeline cannot handle.
    Unsupported,
    /// Operation issued in the wrong lifecycle state.
    InvalidState,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no supported pixel format advertised by the device")]
    NoSupportedFormat,

    #[error("camera initialization failed after {attempts} attempts")]
    InitFailed { attempts: usize },

    #[error("timed out waiting for a frame")]
    CaptureTimeout,

    #[error("failed to allocate {0} bytes for frame")]
    OutOfMemory(usize),

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(FourCC),

    #[error("cannot rotate pixel format {0}")]
    UnsupportedRotation(FourCC),

    #[error("camera resource busy ({0})")]
    ResourceBusy(ResourceState),

    #[error("resource lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("jpeg encode failed: {0}")]
    Encode(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("server responded with HTTP {status}")]
    HttpStatus { status: u16, body: String },

    #[error("camera is not open")]
    NotReady,

    #[error("already streaming")]
    AlreadyStreaming,

    #[error("explain url is not configured")]
    ExplainUnconfigured,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps an OS error with the name of the failing device operation.
    pub fn device(op: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Device {
            op,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Device { .. }
            | Error::NoSupportedFormat
            | Error::InitFailed { .. }
            | Error::CaptureTimeout
            | Error::OutOfMemory(_)
            | Error::Io(_) => ErrorKind::HardwareFault,
            Error::UnsupportedFormat(_) | Error::UnsupportedRotation(_) => ErrorKind::Unsupported,
            Error::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Error::LockTimeout(_) => ErrorKind::LockTimeout,
            Error::Encode(_) => ErrorKind::EncodeFailure,
            Error::Network(_) | Error::HttpStatus { .. } => ErrorKind::NetworkFailure,
            Error::NotReady | Error::AlreadyStreaming | Error::ExplainUnconfigured => {
                ErrorKind::InvalidState
            }
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(io::Error::from(err))
    }
}

impl From<turbojpeg::Error> for Error {
    fn from(err: turbojpeg::Error) -> Self {
        Error::Encode(err.to_string())
    }
}
