// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pixel format negotiation.
//!
//! A device advertises a list of formats and the application ranks the ones
//! it can consume. The lowest rank wins; a format that is not in the table,
//! or whose rank is at or above [`UNSUPPORTED_RANK`], is never chosen.

use crate::{
    error::{Error, Result},
    image::{FourCC, GREY, JPEG, RGB3, RGBP, YUV420, YUV422P},
};
use tracing::debug;

/// Ranks at or above this value mark a format as unusable.
pub const UNSUPPORTED_RANK: u32 = 1 << 29;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatPriority {
    entries: Vec<(FourCC, u32)>,
}

impl FormatPriority {
    pub fn new(entries: impl IntoIterator<Item = (FourCC, u32)>) -> Self {
        FormatPriority {
            entries: entries.into_iter().collect(),
        }
    }

    /// Ranking used when frames feed the encoder directly.
    ///
    /// Planar 4:2:2 is preferred because it converts to packed YUYV without
    /// copying. YUV420 is only useful with a hardware JPEG encoder, and JPEG
    /// input only when the caller accepts compressed frames.
    pub fn standard(hw_jpeg: bool, allow_jpeg_input: bool) -> Self {
        let mut entries = vec![(YUV422P, 10), (RGBP, 11), (RGB3, 12), (GREY, 20)];
        if hw_jpeg {
            entries.push((YUV420, 13));
        }
        if allow_jpeg_input {
            entries.push((JPEG, 5));
        }
        FormatPriority { entries }
    }

    /// Ranking used when frames are rotated after capture.
    pub fn rotation(hw_jpeg: bool) -> Self {
        let mut entries = vec![(RGB3, 0), (RGBP, 1)];
        if hw_jpeg {
            entries.push((YUV420, 2));
        }
        FormatPriority { entries }
    }

    pub fn rank(&self, format: FourCC) -> u32 {
        self.entries
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, rank)| *rank)
            .unwrap_or(UNSUPPORTED_RANK)
    }

    /// Picks the best advertised format. Ties go to the format advertised
    /// first.
    pub fn select(&self, advertised: &[FourCC]) -> Result<FourCC> {
        let mut best: Option<(FourCC, u32)> = None;
        for &format in advertised {
            let rank = self.rank(format);
            debug!(%format, rank, "advertised format");
            if rank >= UNSUPPORTED_RANK {
                continue;
            }
            if best.map_or(true, |(_, r)| rank < r) {
                best = Some((format, rank));
            }
        }
        best.map(|(format, _)| format)
            .ok_or(Error::NoSupportedFormat)
    }

    pub fn entries(&self) -> &[(FourCC, u32)] {
        &self.entries
    }
}

impl Default for FormatPriority {
    fn default() -> Self {
        FormatPriority::standard(false, false)
    }
}
