// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pixel format conversion and rotation of owned frames.
//!
//! Every operation consumes its input [`FrameBuffer`] and returns a new one,
//! so the input allocation is released as soon as the output exists.
//!
//! Rotation has two paths. With a [`ScaleRotateEngine`] installed the frame
//! is mapped onto one of the engine's colour modes, rotated at a fixed 1.0
//! scale and always comes back as RGB565. Without one, the CPU rotates the
//! pixels and keeps the original layout.

use crate::{
    error::{Error, Result},
    image::{FourCC, FrameBuffer, Rotation, GREY, JPEG, RGB3, RGBP, RGBR, YUV420, YUV422P, YUYV},
};
use tracing::{debug, warn};

/// Pixel layouts understood by a scale/rotate engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorMode {
    Rgb565,
    Rgb888,
}

impl ColorMode {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            ColorMode::Rgb565 => 2,
            ColorMode::Rgb888 => 3,
        }
    }
}

/// One scale/rotate/mirror request.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleRotateOp {
    pub input: ColorMode,
    pub output: ColorMode,
    pub in_width: u32,
    pub in_height: u32,
    pub out_width: u32,
    pub out_height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: Rotation,
    pub mirror_x: bool,
    pub mirror_y: bool,
}

/// Scale, rotate and mirror accelerator.
pub trait ScaleRotateEngine: Send {
    fn name(&self) -> &'static str;

    fn run(&self, op: &ScaleRotateOp, input: &[u8], output: &mut [u8]) -> Result<()>;
}

/// [`ScaleRotateEngine`] on the CPU with nearest-neighbour sampling.
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuScaleRotate;

impl ScaleRotateEngine for CpuScaleRotate {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn run(&self, op: &ScaleRotateOp, input: &[u8], output: &mut [u8]) -> Result<()> {
        let in_bpp = op.input.bytes_per_pixel();
        let out_bpp = op.output.bytes_per_pixel();
        let (iw, ih) = (op.in_width as usize, op.in_height as usize);
        let (ow, oh) = (op.out_width as usize, op.out_height as usize);
        if input.len() < iw * ih * in_bpp || output.len() < ow * oh * out_bpp {
            return Err(Error::device(
                "scale rotate",
                std::io::Error::other("buffer smaller than image"),
            ));
        }
        if op.scale_x <= 0.0 || op.scale_y <= 0.0 {
            return Err(Error::device(
                "scale rotate",
                std::io::Error::other("scale must be positive"),
            ));
        }

        // size of the rotated, unscaled image
        let (rw, rh) = if op.rotation.swaps_dimensions() {
            (ih, iw)
        } else {
            (iw, ih)
        };
        for oy in 0..oh {
            for ox in 0..ow {
                let mut rx = ((ox as f32 / op.scale_x) as usize).min(rw - 1);
                let mut ry = ((oy as f32 / op.scale_y) as usize).min(rh - 1);
                if op.mirror_x {
                    rx = rw - 1 - rx;
                }
                if op.mirror_y {
                    ry = rh - 1 - ry;
                }
                let (sx, sy) = source_coords(op.rotation, rx, ry, iw, ih);
                let si = (sy * iw + sx) * in_bpp;
                let (r, g, b) = read_pixel(op.input, &input[si..si + in_bpp]);
                let di = (oy * ow + ox) * out_bpp;
                write_pixel(op.output, &mut output[di..di + out_bpp], r, g, b);
            }
        }
        Ok(())
    }
}

fn read_pixel(mode: ColorMode, px: &[u8]) -> (u8, u8, u8) {
    match mode {
        ColorMode::Rgb888 => (px[0], px[1], px[2]),
        ColorMode::Rgb565 => rgb565_unpack(u16::from_le_bytes([px[0], px[1]])),
    }
}

fn write_pixel(mode: ColorMode, px: &mut [u8], r: u8, g: u8, b: u8) {
    match mode {
        ColorMode::Rgb888 => px.copy_from_slice(&[r, g, b]),
        ColorMode::Rgb565 => px.copy_from_slice(&rgb565_pack(r, g, b).to_le_bytes()),
    }
}

/// Maps a pixel of the clockwise-rotated image back to the source image.
fn source_coords(rotation: Rotation, x: usize, y: usize, w: usize, h: usize) -> (usize, usize) {
    match rotation {
        Rotation::Rotation0 => (x, y),
        Rotation::Rotation90 => (y, h - 1 - x),
        Rotation::Rotation180 => (w - 1 - x, h - 1 - y),
        Rotation::Rotation270 => (w - 1 - y, x),
    }
}

fn rgb565_pack(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xf8) << 8) | ((g as u16 & 0xfc) << 3) | (b as u16 >> 3)
}

fn rgb565_unpack(v: u16) -> (u8, u8, u8) {
    let r = ((v >> 11) & 0x1f) as u8;
    let g = ((v >> 5) & 0x3f) as u8;
    let b = (v & 0x1f) as u8;
    ((r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    // BT.601 limited range
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    (
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    )
}

fn alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Swaps the bytes of every 16-bit word.
pub fn swap16(src: &[u8]) -> Vec<u8> {
    let mut out = src.to_vec();
    for word in out.chunks_exact_mut(2) {
        word.swap(0, 1);
    }
    out
}

pub fn yuyv_to_rgb888(src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width as usize * height as usize).min(src.len() / 2);
    let mut out = Vec::with_capacity(pixels * 3);
    for px in src.chunks_exact(4).take(pixels / 2) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        let (r, g, b) = yuv_to_rgb(y0, u, v);
        out.extend_from_slice(&[r, g, b]);
        let (r, g, b) = yuv_to_rgb(y1, u, v);
        out.extend_from_slice(&[r, g, b]);
    }
    out
}

pub fn yuv420_to_rgb888(src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w / 2, h / 2);
    let (y_plane, rest) = src.split_at((w * h).min(src.len()));
    let (u_plane, v_plane) = rest.split_at((cw * ch).min(rest.len()));
    let mut out = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let ci = (y / 2).min(ch.saturating_sub(1)) * cw + (x / 2).min(cw.saturating_sub(1));
            let luma = y_plane.get(y * w + x).copied().unwrap_or(16);
            let u = u_plane.get(ci).copied().unwrap_or(128);
            let v = v_plane.get(ci).copied().unwrap_or(128);
            let (r, g, b) = yuv_to_rgb(luma, u, v);
            out.extend_from_slice(&[r, g, b]);
        }
    }
    out
}

pub fn rgb565_to_rgb888(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 2 * 3);
    for px in src.chunks_exact(2) {
        let (r, g, b) = rgb565_unpack(u16::from_le_bytes([px[0], px[1]]));
        out.extend_from_slice(&[r, g, b]);
    }
    out
}

pub fn rgb888_to_rgb565(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 3 * 2);
    for px in src.chunks_exact(3) {
        out.extend_from_slice(&rgb565_pack(px[0], px[1], px[2]).to_le_bytes());
    }
    out
}

pub fn grey_to_rgb888(src: &[u8]) -> Vec<u8> {
    src.iter().flat_map(|&l| [l, l, l]).collect()
}

/// Rotates packed pixels of `bpp` bytes clockwise.
pub fn rotate_packed(src: &[u8], width: u32, height: u32, bpp: usize, rotation: Rotation) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    if src.len() < w * h * bpp {
        return Err(Error::device(
            "rotate",
            std::io::Error::other("buffer smaller than image"),
        ));
    }
    let mut out = alloc(w * h * bpp)?;
    let (ow, oh) = if rotation.swaps_dimensions() {
        (h, w)
    } else {
        (w, h)
    };
    for oy in 0..oh {
        for ox in 0..ow {
            let (sx, sy) = source_coords(rotation, ox, oy, w, h);
            let si = (sy * w + sx) * bpp;
            let di = (oy * ow + ox) * bpp;
            out[di..di + bpp].copy_from_slice(&src[si..si + bpp]);
        }
    }
    Ok(out)
}

/// Converts `frame` into `target`.
///
/// Supported pairs are a straight copy, 16-bit byte swaps between the two
/// RGB565 byte orders, the YUV422P to YUYV re-tag, and expansion of the raw
/// formats into RGB888 or RGB565.
pub fn convert(mut frame: FrameBuffer, target: FourCC) -> Result<FrameBuffer> {
    let (w, h) = (frame.width, frame.height);
    let data = match (frame.format, target) {
        (from, to) if from == to => return Ok(frame),
        (RGBR, RGBP) | (RGBP, RGBR) => swap16(&frame.data),
        // the device firmware labels packed 4:2:2 as planar
        (YUV422P, YUYV) => {
            frame.format = YUYV;
            return Ok(frame);
        }
        (YUYV | YUV422P, RGB3) => yuyv_to_rgb888(&frame.data, w, h),
        (YUV420, RGB3) => yuv420_to_rgb888(&frame.data, w, h),
        (RGBP, RGB3) => rgb565_to_rgb888(&frame.data),
        (RGBR, RGB3) => rgb565_to_rgb888(&swap16(&frame.data)),
        (GREY, RGB3) => grey_to_rgb888(&frame.data),
        (RGB3, RGBP) => rgb888_to_rgb565(&frame.data),
        (YUYV | YUV422P, RGBP) => rgb888_to_rgb565(&yuyv_to_rgb888(&frame.data, w, h)),
        (YUV420, RGBP) => rgb888_to_rgb565(&yuv420_to_rgb888(&frame.data, w, h)),
        (GREY, RGBP) => rgb888_to_rgb565(&grey_to_rgb888(&frame.data)),
        (from, _) => return Err(Error::UnsupportedFormat(from)),
    };
    Ok(frame.with_data(data, w, h, target))
}

/// Turns a freshly captured frame into the layout consumers expect.
///
/// RGB565 big endian is swapped into little endian and the mislabelled
/// YUV422P is re-tagged as YUYV. With `swap_bytes` the 16-bit formats are
/// byte swapped as well, for sensors wired with the opposite byte order.
pub fn normalize(frame: FrameBuffer, swap_bytes: bool) -> Result<FrameBuffer> {
    match frame.format {
        RGBP | YUYV if swap_bytes => {
            let data = swap16(&frame.data);
            let (w, h, f) = (frame.width, frame.height, frame.format);
            Ok(frame.with_data(data, w, h, f))
        }
        RGBP | RGB3 | YUYV | YUV420 | GREY | JPEG => Ok(frame),
        RGBR => convert(frame, RGBP),
        YUV422P => convert(frame, YUYV),
        other => {
            warn!(format = %other, "capture format not handled");
            Err(Error::UnsupportedFormat(other))
        }
    }
}

/// Conversion and rotation stage between capture and encoding.
#[derive(Default)]
pub struct PixelPipeline {
    engine: Option<Box<dyn ScaleRotateEngine>>,
}

impl PixelPipeline {
    pub fn new() -> Self {
        PixelPipeline { engine: None }
    }

    pub fn with_engine(engine: Box<dyn ScaleRotateEngine>) -> Self {
        PixelPipeline {
            engine: Some(engine),
        }
    }

    pub fn engine_name(&self) -> Option<&'static str> {
        self.engine.as_ref().map(|e| e.name())
    }

    pub fn convert(&self, frame: FrameBuffer, target: FourCC) -> Result<FrameBuffer> {
        convert(frame, target)
    }

    /// Rotates `frame` clockwise, returning a new frame with the rotated
    /// dimensions. [`Rotation::Rotation0`] returns the input untouched.
    pub fn rotate(&self, frame: FrameBuffer, rotation: Rotation) -> Result<FrameBuffer> {
        if rotation == Rotation::Rotation0 {
            return Ok(frame);
        }
        let (w, h) = (frame.width, frame.height);
        let (ow, oh) = if rotation.swaps_dimensions() {
            (h, w)
        } else {
            (w, h)
        };

        let result = match &self.engine {
            Some(engine) => {
                let (input, pixels) = match frame.format {
                    RGBP => (ColorMode::Rgb565, None),
                    RGB3 => (ColorMode::Rgb888, None),
                    YUYV => (ColorMode::Rgb888, Some(yuyv_to_rgb888(&frame.data, w, h))),
                    other => return Err(self.unsupported(other)),
                };
                let op = ScaleRotateOp {
                    input,
                    output: ColorMode::Rgb565,
                    in_width: w,
                    in_height: h,
                    out_width: ow,
                    out_height: oh,
                    scale_x: 1.0,
                    scale_y: 1.0,
                    rotation,
                    mirror_x: false,
                    mirror_y: false,
                };
                let mut out = alloc(ow as usize * oh as usize * ColorMode::Rgb565.bytes_per_pixel())?;
                engine.run(&op, pixels.as_deref().unwrap_or(&frame.data), &mut out)?;
                frame.with_data(out, ow, oh, RGBP)
            }
            None => {
                let (data, format) = match frame.format {
                    RGBP => (rotate_packed(&frame.data, w, h, 2, rotation)?, RGBP),
                    RGB3 => (rotate_packed(&frame.data, w, h, 3, rotation)?, RGB3),
                    GREY => (rotate_packed(&frame.data, w, h, 1, rotation)?, GREY),
                    // chroma is shared between pixel pairs so rotate as RGB565
                    YUYV => {
                        let rgb = rgb888_to_rgb565(&yuyv_to_rgb888(&frame.data, w, h));
                        (rotate_packed(&rgb, w, h, 2, rotation)?, RGBP)
                    }
                    other => return Err(self.unsupported(other)),
                };
                frame.with_data(data, ow, oh, format)
            }
        };
        debug!(
            rotation = rotation.degrees(),
            engine = self.engine_name().unwrap_or("software"),
            "frame rotated to {}x{} {}",
            result.width,
            result.height,
            result.format
        );
        Ok(result)
    }

    fn unsupported(&self, format: FourCC) -> Error {
        warn!(%format, "rotation not supported for format");
        Error::UnsupportedRotation(format)
    }
}
