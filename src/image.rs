// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{fmt, str::FromStr, time::SystemTime};

/// Four character pixel format code as used by V4L2.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGB565 16-bit pixel format, little endian
pub const RGBP: FourCC = FourCC(*b"RGBP");

/// RGB565 16-bit pixel format, big endian (RGB565X)
pub const RGBR: FourCC = FourCC(*b"RGBR");

/// YUYV 4:2:2 YUV packed format (common camera output format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// YUV 4:2:2 planar format
pub const YUV422P: FourCC = FourCC(*b"422P");

/// YUV 4:2:0 planar format (I420)
pub const YUV420: FourCC = FourCC(*b"YU12");

/// 8-bit greyscale
pub const GREY: FourCC = FourCC(*b"GREY");

/// Compressed JPEG frames
pub const JPEG: FourCC = FourCC(*b"JPEG");

impl FourCC {
    /// Whether the format is a fixed-size raw pixel layout.
    pub fn is_raw(&self) -> bool {
        *self != JPEG && bytes_per_row(*self, 1).is_some()
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        u32::from_le_bytes(value.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(format!("fourcc must be 4 characters: {s:?}"));
        }
        Ok(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Frame dimensions in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const QQVGA: Resolution = Resolution::new(160, 120);
    pub const QVGA: Resolution = Resolution::new(320, 240);
    pub const VGA: Resolution = Resolution::new(640, 480);
    pub const SVGA: Resolution = Resolution::new(800, 600);
    pub const HD: Resolution = Resolution::new(1280, 720);
    pub const UXGA: Resolution = Resolution::new(1600, 1200);

    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Clockwise image rotation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    /// No rotation (0 degrees)
    #[default]
    Rotation0,
    /// Rotate 90 degrees clockwise
    Rotation90,
    /// Rotate 180 degrees
    Rotation180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotation270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Rotation0),
            90 => Some(Rotation::Rotation90),
            180 => Some(Rotation::Rotation180),
            270 => Some(Rotation::Rotation270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => 90,
            Rotation::Rotation180 => 180,
            Rotation::Rotation270 => 270,
        }
    }

    /// True when the output width and height trade places.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Rotation90 | Rotation::Rotation270)
    }
}

/// Bytes in one row of a packed image, `None` for formats without a fixed
/// row layout.
pub const fn bytes_per_row(format: FourCC, width: u32) -> Option<usize> {
    let width = width as usize;
    match format.0 {
        [b'R', b'G', b'B', b'3'] => Some(3 * width),
        [b'R', b'G', b'B', b'P'] | [b'R', b'G', b'B', b'R'] => Some(2 * width),
        [b'Y', b'U', b'Y', b'V'] | [b'4', b'2', b'2', b'P'] => Some(2 * width),
        [b'G', b'R', b'E', b'Y'] => Some(width),
        // planar 4:2:0 averages to 1.5 bytes per pixel
        [b'Y', b'U', b'1', b'2'] => Some(width + width / 2),
        _ => None,
    }
}

/// Size in bytes of an uncompressed frame.
pub const fn frame_size(format: FourCC, width: u32, height: u32) -> Option<usize> {
    match bytes_per_row(format, width) {
        Some(stride) => Some(stride * height as usize),
        None => None,
    }
}

/// Owned image data produced by capture and consumed by the pipeline.
///
/// A frame is never shared while it is being transformed: each stage takes
/// it by value and returns a new one. The camera publishes its latest frame
/// behind an `Arc` once processing is complete.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FourCC,
    pub sequence: u64,
    pub timestamp: SystemTime,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: FourCC) -> Self {
        FrameBuffer {
            data,
            width,
            height,
            format,
            sequence: 0,
            timestamp: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Keeps the capture metadata of `self` on a new payload.
    pub fn with_data(&self, data: Vec<u8>, width: u32, height: u32, format: FourCC) -> Self {
        FrameBuffer {
            data,
            width,
            height,
            format,
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl fmt::Display for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} {} {} bytes seq:{}",
            self.width,
            self.height,
            self.format,
            self.data.len(),
            self.sequence
        )
    }
}
