// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Flash LED control through the Linux LED class in sysfs.

use crate::error::{Error, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub const LEDS_ROOT: &str = "/sys/class/leds";

/// A dimmable flash or torch LED driven by percentage.
pub trait FlashLed: Send {
    fn name(&self) -> &str;

    /// Drives the LED at `percent` of full brightness, 0 switches it off.
    fn set_level(&mut self, percent: u8) -> Result<()>;
}

/// LED exposed as `<root>/<name>/{brightness,max_brightness}`.
#[derive(Clone, Debug)]
pub struct SysfsFlash {
    path: PathBuf,
    name: String,
    max_brightness: u32,
}

impl SysfsFlash {
    /// Opens the LED directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let raw = fs::read_to_string(path.join("max_brightness"))
            .map_err(|err| Error::device("read max_brightness", err))?;
        let max_brightness = raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                Error::device(
                    "read max_brightness",
                    std::io::Error::other(format!("invalid value {:?}", raw.trim())),
                )
            })?;
        info!(name = %name, max_brightness, "flash led opened");
        Ok(SysfsFlash {
            path,
            name,
            max_brightness,
        })
    }

    /// Opens `name` under the system LED class.
    pub fn open_named(name: &str) -> Result<Self> {
        SysfsFlash::open(Path::new(LEDS_ROOT).join(name))
    }

    /// First usable `*:flash` or `*:torch` LED under `root`, by name.
    pub fn discover_in(root: impl AsRef<Path>) -> Option<Self> {
        let entries = match fs::read_dir(root.as_ref()) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(root = %root.as_ref().display(), "no led class: {err}");
                return None;
            }
        };
        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(":flash") || n.ends_with(":torch"))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().find_map(|path| match SysfsFlash::open(&path) {
            Ok(flash) => Some(flash),
            Err(err) => {
                warn!(path = %path.display(), "skipping led: {err}");
                None
            }
        })
    }

    pub fn discover() -> Option<Self> {
        SysfsFlash::discover_in(LEDS_ROOT)
    }

    pub fn max_brightness(&self) -> u32 {
        self.max_brightness
    }

    /// Raw brightness for a percentage, rounded to nearest.
    pub fn scale(&self, percent: u8) -> u32 {
        let percent = percent.min(100) as u64;
        ((percent * self.max_brightness as u64 + 50) / 100) as u32
    }
}

impl FlashLed for SysfsFlash {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_level(&mut self, percent: u8) -> Result<()> {
        let value = self.scale(percent);
        fs::write(self.path.join("brightness"), value.to_string())
            .map_err(|err| Error::device("write brightness", err))?;
        debug!(name = %self.name, percent, value, "flash level");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_led(root: &Path, name: &str, max: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("max_brightness"), max).unwrap();
        fs::write(dir.join("brightness"), "0").unwrap();
        dir
    }

    #[test]
    fn discover_and_drive() {
        let root = std::env::temp_dir().join(format!("vision-camera-leds-{}", std::process::id()));
        fake_led(&root, "white:status", "1\n");
        fake_led(&root, "amber:torch", "0\n");
        let flash_dir = fake_led(&root, "white:flash", "255\n");

        // torch has max_brightness 0 and is skipped
        let mut led = SysfsFlash::discover_in(&root).unwrap();
        assert_eq!(led.name(), "white:flash");
        assert_eq!(led.max_brightness(), 255);
        assert_eq!(led.scale(50), 128);
        assert_eq!(led.scale(200), 255);

        led.set_level(20).unwrap();
        assert_eq!(fs::read_to_string(flash_dir.join("brightness")).unwrap(), "51");
        led.set_level(0).unwrap();
        assert_eq!(fs::read_to_string(flash_dir.join("brightness")).unwrap(), "0");

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_class_is_none() {
        assert!(SysfsFlash::discover_in("/nonexistent/leds").is_none());
    }
}
