// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Image sensor identification and tuning over the sensor control bus.
//!
//! OmniVision sensors expose their identity in read-only registers reachable
//! over SCCB, which is electrically compatible with I2C. Identification
//! probes each supported model in a fixed order and the first whose
//! signature matches wins. The same bus is later used to write the model's
//! tuning registers.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::fd::AsRawFd,
    path::Path,
    str::FromStr,
};
use tracing::{debug, info, warn};

/// Register level access to devices on the sensor control bus.
pub trait ControlBus: Send {
    fn read_reg(&mut self, addr: u8, reg: u16) -> io::Result<u8>;
    fn write_reg(&mut self, addr: u8, reg: u16, value: u8) -> io::Result<()>;
}

/// Register address as sent on the wire: one byte for 8-bit register maps,
/// two big-endian bytes otherwise.
fn reg_bytes(reg: u16) -> ([u8; 2], usize) {
    if reg > 0xff {
        (reg.to_be_bytes(), 2)
    } else {
        ([reg as u8, 0], 1)
    }
}

mod ioctl {
    // linux/i2c-dev.h
    const I2C_SLAVE: u32 = 0x0703;
    nix::ioctl_write_int_bad!(i2c_slave, I2C_SLAVE);
}

/// Linux `/dev/i2c-N` bus.
pub struct I2cBus {
    file: File,
    addr: Option<u8>,
}

impl I2cBus {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(I2cBus { file, addr: None })
    }

    fn select(&mut self, addr: u8) -> io::Result<()> {
        if self.addr != Some(addr) {
            unsafe { ioctl::i2c_slave(self.file.as_raw_fd(), addr as libc::c_int) }?;
            self.addr = Some(addr);
        }
        Ok(())
    }
}

impl ControlBus for I2cBus {
    fn read_reg(&mut self, addr: u8, reg: u16) -> io::Result<u8> {
        self.select(addr)?;
        let (bytes, n) = reg_bytes(reg);
        self.file.write_all(&bytes[..n])?;
        let mut value = [0u8; 1];
        self.file.read_exact(&mut value)?;
        Ok(value[0])
    }

    fn write_reg(&mut self, addr: u8, reg: u16, value: u8) -> io::Result<()> {
        self.select(addr)?;
        let (bytes, n) = reg_bytes(reg);
        let mut msg = [0u8; 3];
        msg[..n].copy_from_slice(&bytes[..n]);
        msg[n] = value;
        self.file.write_all(&msg[..=n])
    }
}

/// A pair of identification registers holding a 16-bit value, high byte
/// first.
#[derive(Copy, Clone, Debug)]
struct IdRegister {
    high: u16,
    low: u16,
    expected: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SensorModel {
    Ov2640,
    Ov3660,
    Ov5640,
}

impl SensorModel {
    /// Probe order used by [`identify`].
    pub const ALL: [SensorModel; 3] = [
        SensorModel::Ov5640,
        SensorModel::Ov3660,
        SensorModel::Ov2640,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensorModel::Ov2640 => "OV2640",
            SensorModel::Ov3660 => "OV3660",
            SensorModel::Ov5640 => "OV5640",
        }
    }

    /// 7-bit SCCB address.
    pub fn address(&self) -> u8 {
        match self {
            SensorModel::Ov2640 => 0x30,
            SensorModel::Ov3660 | SensorModel::Ov5640 => 0x3c,
        }
    }

    fn signature(&self) -> &'static [IdRegister] {
        match self {
            SensorModel::Ov2640 => &[
                // manufacturer id
                IdRegister {
                    high: 0x1c,
                    low: 0x1d,
                    expected: 0x7fa2,
                },
                // product id
                IdRegister {
                    high: 0x0a,
                    low: 0x0b,
                    expected: 0x2642,
                },
            ],
            SensorModel::Ov3660 => &[IdRegister {
                high: 0x300a,
                low: 0x300b,
                expected: 0x3660,
            }],
            SensorModel::Ov5640 => &[IdRegister {
                high: 0x300a,
                low: 0x300b,
                expected: 0x5640,
            }],
        }
    }

    fn matches(&self, bus: &mut dyn ControlBus) -> io::Result<bool> {
        let addr = self.address();
        for id in self.signature() {
            let high = bus.read_reg(addr, id.high)?;
            let low = bus.read_reg(addr, id.low)?;
            let value = u16::from_be_bytes([high, low]);
            if value != id.expected {
                debug!(
                    model = self.name(),
                    value = %format!("{value:#06x}"),
                    expected = %format!("{:#06x}", id.expected),
                    "signature mismatch"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SensorModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorModel::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sensor model {s:?}"))
    }
}

/// Probes the bus for a supported sensor.
///
/// Candidates are tried in [`SensorModel::ALL`] order. A bus error while
/// probing one candidate moves on to the next; `None` means nothing
/// answered with a known signature.
pub fn identify(bus: &mut dyn ControlBus) -> Option<SensorModel> {
    for model in SensorModel::ALL {
        match model.matches(bus) {
            Ok(true) => {
                info!(model = model.name(), "sensor detected");
                return Some(model);
            }
            Ok(false) => {}
            Err(err) => debug!(model = model.name(), "probe failed: {err}"),
        }
    }
    warn!("no supported sensor detected");
    None
}

/// Image tuning applied after the sensor is initialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorTuning {
    /// Sensor JPEG quality, lower is better.
    pub jpeg_quality: i32,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub sharpness: i32,
    pub denoise: i32,
    /// Exposure value used when automatic exposure is disabled.
    pub aec_value: i32,
    pub lens_correction: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorProfile {
    pub model: SensorModel,
    pub tuning: SensorTuning,
}

/// Limits for brightness, contrast and saturation levels.
pub const LEVEL_RANGE: (i32, i32) = (-2, 2);

pub fn clamp_level(level: i32) -> i32 {
    level.clamp(LEVEL_RANGE.0, LEVEL_RANGE.1)
}

impl SensorProfile {
    pub fn for_model(model: SensorModel) -> Self {
        let tuning = match model {
            SensorModel::Ov2640 => SensorTuning {
                jpeg_quality: 12,
                brightness: 0,
                contrast: 0,
                saturation: 0,
                sharpness: 0,
                denoise: 0,
                aec_value: 0,
                lens_correction: false,
            },
            SensorModel::Ov3660 => SensorTuning {
                jpeg_quality: 10,
                brightness: 1,
                contrast: 1,
                saturation: 0,
                sharpness: 0,
                denoise: 0,
                aec_value: 300,
                lens_correction: false,
            },
            SensorModel::Ov5640 => SensorTuning {
                jpeg_quality: 8,
                brightness: 0,
                contrast: 2,
                saturation: 1,
                sharpness: 1,
                denoise: 1,
                aec_value: 400,
                lens_correction: true,
            },
        };
        SensorProfile { model, tuning }
    }

    /// Register writes, in order, that apply this profile.
    pub fn register_writes(&self) -> Vec<(u16, u8)> {
        let t = &self.tuning;
        let brightness = clamp_level(t.brightness);
        let contrast = clamp_level(t.contrast);
        let saturation = clamp_level(t.saturation);

        match self.model {
            SensorModel::Ov2640 => {
                // 8-bit DSP bank, special digital effects through the
                // 0x7c/0x7d indirect window
                const BRIGHTNESS: [u8; 5] = [0x00, 0x10, 0x20, 0x30, 0x40];
                const CONTRAST: [(u8, u8); 5] = [
                    (0x18, 0x34),
                    (0x1c, 0x2a),
                    (0x20, 0x20),
                    (0x24, 0x16),
                    (0x28, 0x0c),
                ];
                const SATURATION: [u8; 5] = [0x28, 0x38, 0x48, 0x58, 0x68];
                let b = (brightness + 2) as usize;
                let c = (contrast + 2) as usize;
                let s = (saturation + 2) as usize;
                vec![
                    (0xff, 0x00),
                    (0x7c, 0x00),
                    (0x7d, 0x04),
                    (0x7c, 0x09),
                    (0x7d, BRIGHTNESS[b]),
                    (0x7d, 0x00),
                    (0x7c, 0x00),
                    (0x7d, 0x04),
                    (0x7c, 0x07),
                    (0x7d, 0x20),
                    (0x7d, CONTRAST[c].0),
                    (0x7d, CONTRAST[c].1),
                    (0x7d, 0x06),
                    (0x7c, 0x00),
                    (0x7d, 0x02),
                    (0x7c, 0x03),
                    (0x7d, SATURATION[s]),
                    (0x7d, SATURATION[s]),
                ]
            }
            SensorModel::Ov3660 | SensorModel::Ov5640 => {
                let sign = if brightness < 0 { 0x09 } else { 0x01 };
                let sat = (0x40 + saturation * 0x10) as u8;
                vec![
                    (0x5580, 0x06),
                    (0x5583, sat),
                    (0x5584, sat),
                    (0x5585, 0x00),
                    (0x5586, ((contrast + 4) << 3) as u8),
                    (0x5587, (brightness.unsigned_abs() << 4) as u8),
                    (0x5588, sign),
                    (0x5302, (0x10 + t.sharpness.clamp(0, 3) * 8) as u8),
                    (0x5306, (t.denoise.clamp(0, 31) * 8) as u8),
                    (0x5000, if t.lens_correction { 0xa7 } else { 0x27 }),
                ]
            }
        }
    }

    /// Writes the tuning registers to the sensor.
    pub fn apply(&self, bus: &mut dyn ControlBus) -> io::Result<()> {
        let addr = self.model.address();
        for (reg, value) in self.register_writes() {
            bus.write_reg(addr, reg, value)?;
        }
        debug!(model = self.model.name(), tuning = ?self.tuning, "sensor tuning applied");
        Ok(())
    }
}
