// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Synthetic capture device.
//!
//! Produces a moving colour gradient in any raw format it advertises, with
//! the same slot ownership rules as a real driver: a slot must be queued
//! before it can be dequeued again, and dequeue fails when nothing is
//! queued. The frame counter is stamped little-endian into the first eight
//! bytes of every frame.

use super::{BackendConfig, CaptureBackend, Control, DequeuedSlot, NegotiatedFormat};
use crate::{
    error::{Error, Result},
    image::{frame_size, FourCC, Resolution, GREY, RGB3, RGBP, RGBR, YUV420, YUV422P, YUYV},
};
use std::{
    collections::{HashMap, VecDeque},
    io,
};
use tracing::debug;

const MAX_RESOLUTION: Resolution = Resolution::UXGA;

struct Session {
    format: Option<NegotiatedFormat>,
    slots: Vec<Vec<u8>>,
    queued: VecDeque<usize>,
    streaming: bool,
}

pub struct PatternBackend {
    formats: Vec<FourCC>,
    memory_budget: Option<usize>,
    session: Option<Session>,
    controls: HashMap<Control, i32>,
    sequence: u64,
}

impl Default for PatternBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternBackend {
    pub fn new() -> Self {
        PatternBackend {
            formats: vec![YUYV, RGBP, RGB3, GREY],
            memory_budget: None,
            session: None,
            controls: HashMap::new(),
            sequence: 0,
        }
    }

    /// Replaces the advertised format list.
    pub fn with_formats(mut self, formats: impl Into<Vec<FourCC>>) -> Self {
        self.formats = formats.into();
        self
    }

    /// Makes buffer requests fail once their total size exceeds `bytes`.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Last value written to a control.
    pub fn control(&self, control: Control) -> Option<i32> {
        self.controls.get(&control).copied()
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::NotReady)
    }
}

fn rgb_at(x: u32, y: u32, seq: u64) -> (u8, u8, u8) {
    let shift = (seq as u32).wrapping_mul(4);
    (
        x.wrapping_add(shift) as u8,
        y as u8,
        (x ^ y).wrapping_add(shift / 2) as u8,
    )
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((66 * r as i32 + 129 * g as i32 + 25 * b as i32 + 128) >> 8).clamp(0, 255) as u8 + 16
}

fn chroma(r: u8, g: u8, b: u8) -> (u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xf8) << 8) | ((g as u16 & 0xfc) << 3) | (b as u16 >> 3)
}

fn render(dst: &mut [u8], fmt: &NegotiatedFormat, seq: u64) {
    let (w, h) = (fmt.width, fmt.height);
    match fmt.format {
        RGB3 => {
            for (i, px) in dst.chunks_exact_mut(3).enumerate() {
                let (r, g, b) = rgb_at(i as u32 % w, i as u32 / w, seq);
                px.copy_from_slice(&[r, g, b]);
            }
        }
        RGBP | RGBR => {
            for (i, px) in dst.chunks_exact_mut(2).enumerate() {
                let (r, g, b) = rgb_at(i as u32 % w, i as u32 / w, seq);
                let v = rgb565(r, g, b);
                let bytes = if fmt.format == RGBR {
                    v.to_be_bytes()
                } else {
                    v.to_le_bytes()
                };
                px.copy_from_slice(&bytes);
            }
        }
        GREY => {
            for (i, px) in dst.iter_mut().enumerate() {
                let (r, g, b) = rgb_at(i as u32 % w, i as u32 / w, seq);
                *px = luma(r, g, b);
            }
        }
        YUYV => {
            for (i, px) in dst.chunks_exact_mut(4).enumerate() {
                let x = (i as u32 * 2) % w;
                let y = (i as u32 * 2) / w;
                let (r0, g0, b0) = rgb_at(x, y, seq);
                let (r1, g1, b1) = rgb_at(x + 1, y, seq);
                let (u, v) = chroma(r0, g0, b0);
                px.copy_from_slice(&[luma(r0, g0, b0), u, luma(r1, g1, b1), v]);
            }
        }
        YUV422P | YUV420 => {
            let plane = w as usize * h as usize;
            let (cw, ch) = if fmt.format == YUV420 {
                (w / 2, h / 2)
            } else {
                (w / 2, h)
            };
            let cplane = cw as usize * ch as usize;
            let (luma_plane, rest) = dst.split_at_mut(plane);
            let (u_plane, v_plane) = rest.split_at_mut(cplane);
            for (i, px) in luma_plane.iter_mut().enumerate() {
                let (r, g, b) = rgb_at(i as u32 % w, i as u32 / w, seq);
                *px = luma(r, g, b);
            }
            let vstep = h / ch.max(1);
            for i in 0..cplane.min(v_plane.len()) {
                let (x, y) = ((i as u32 % cw) * 2, (i as u32 / cw) * vstep);
                let (r, g, b) = rgb_at(x, y, seq);
                let (u, v) = chroma(r, g, b);
                u_plane[i] = u;
                v_plane[i] = v;
            }
        }
        _ => {}
    }
    let stamp = seq.to_le_bytes();
    let n = stamp.len().min(dst.len());
    dst[..n].copy_from_slice(&stamp[..n]);
}

impl CaptureBackend for PatternBackend {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn open(&mut self, config: &BackendConfig) -> Result<()> {
        debug!(
            resolution = %config.resolution,
            pixel_clock_hz = config.pixel_clock_hz,
            "pattern device opened"
        );
        self.session = Some(Session {
            format: None,
            slots: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
        });
        Ok(())
    }

    fn enum_formats(&mut self) -> Result<Vec<FourCC>> {
        self.session()?;
        Ok(self.formats.clone())
    }

    fn set_format(&mut self, format: FourCC, resolution: Resolution) -> Result<NegotiatedFormat> {
        if !self.formats.contains(&format) || frame_size(format, 2, 2).is_none() {
            return Err(Error::device(
                "set format",
                io::Error::other(format!("pattern cannot produce {format}")),
            ));
        }
        // even sizes keep the chroma planes whole
        let negotiated = NegotiatedFormat {
            format,
            width: resolution.width.clamp(2, MAX_RESOLUTION.width) & !1,
            height: resolution.height.clamp(2, MAX_RESOLUTION.height) & !1,
        };
        self.session()?.format = Some(negotiated);
        Ok(negotiated)
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize> {
        let budget = self.memory_budget;
        let session = self.session()?;
        let fmt = session.format.ok_or(Error::NotReady)?;
        let size = frame_size(fmt.format, fmt.width, fmt.height).ok_or(Error::NotReady)?;
        let total = size * count;
        if budget.is_some_and(|budget| total > budget) {
            return Err(Error::OutOfMemory(total));
        }
        session.slots = (0..count).map(|_| vec![0u8; size]).collect();
        session.queued.clear();
        Ok(count)
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        let session = self.session()?;
        if index >= session.slots.len() || session.queued.contains(&index) {
            return Err(Error::device(
                "queue buffer",
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        session.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot> {
        let seq = self.sequence;
        let session = self.session()?;
        if !session.streaming {
            return Err(Error::device(
                "dequeue buffer",
                io::Error::other("stream is off"),
            ));
        }
        let index = session.queued.pop_front().ok_or(Error::CaptureTimeout)?;
        let fmt = session.format.ok_or(Error::NotReady)?;
        let slot = &mut session.slots[index];
        render(slot, &fmt, seq);
        let bytes_used = slot.len();
        self.sequence += 1;
        Ok(DequeuedSlot { index, bytes_used })
    }

    fn slot(&self, index: usize) -> Option<&[u8]> {
        self.session
            .as_ref()
            .and_then(|s| s.slots.get(index))
            .map(Vec::as_slice)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.session()?.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.session()?.streaming = false;
        Ok(())
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<()> {
        self.controls.insert(control, value);
        Ok(())
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            debug!("pattern device closed");
        }
    }
}
