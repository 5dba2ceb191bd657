// THEORY:
// The `histogram` module derives the two fixed-length feature vectors the
// whole engine ranks with. Both are plain bin-count histograms over a single
// pass of the pixel sequence:
//
// 1.  **Intensity**: 25 equal-width bins of width 10 over the luma domain
//     [0, 255]. A luma whose computed bin index would be 25 (anything at or
//     above the last bin boundary, up to pure white at 255) is folded into
//     bin 24. The fold is a required edge case of the binning scheme, not a
//     convenience clamp, and it keeps the invariant that the bin counts sum
//     exactly to the pixel count.
// 2.  **Color code**: 64 bins indexed directly by the pixel's 6-bit color
//     code. The code is in [0, 63] by construction, so no fold is needed.
//
// A `BinHistogram` also remembers the pixel total of its source image. That
// total is what makes the distance metric resolution-invariant: dividing each
// bin count by it turns counts into frequencies, and `frequencies()` is the
// single place that division happens.
//
// Bin order is semantically meaningful (each index is a named bin) and must
// never be reordered or sparsified.

use crate::core_modules::pixel::pixel::PixelColor;
use std::fmt;

/// Number of intensity bins.
pub const INTENSITY_BIN_COUNT: usize = 25;
/// Width of one intensity bin in luma units.
pub const INTENSITY_BIN_WIDTH: f64 = 10.0;
/// Number of color-code bins (one per 6-bit code).
pub const COLOR_CODE_BIN_COUNT: usize = 64;

/// The scoring method selected by the caller. The feature dimensionality of
/// every vector in a session is derived from this, never from a loop bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Rank by the intensity histogram alone.
    Intensity,
    /// Rank by the color-code histogram alone.
    ColorCode,
    /// Rank by the concatenation of both, with relevance feedback.
    Combined,
}

impl Method {
    /// The fixed feature-vector length for this method.
    pub fn dimension(&self) -> usize {
        match self {
            Method::Intensity => INTENSITY_BIN_COUNT,
            Method::ColorCode => COLOR_CODE_BIN_COUNT,
            Method::Combined => INTENSITY_BIN_COUNT + COLOR_CODE_BIN_COUNT,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Intensity => write!(f, "intensity"),
            Method::ColorCode => write!(f, "color-code"),
            Method::Combined => write!(f, "combined"),
        }
    }
}

/// A fixed-length bin-count vector plus the pixel total of its source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinHistogram {
    counts: Vec<u64>,
    pixel_total: u64,
}

impl BinHistogram {
    /// Wraps a precomputed bin-count row. The pixel total is recovered from
    /// the counts themselves, since every pixel lands in exactly one bin.
    pub fn from_counts(counts: Vec<u64>) -> Self {
        let pixel_total = counts.iter().sum();
        Self {
            counts,
            pixel_total,
        }
    }

    /// Bins the luma of every pixel into the 25 intensity bins.
    pub fn intensity(colors: &[PixelColor]) -> Self {
        let mut counts = vec![0u64; INTENSITY_BIN_COUNT];
        for color in colors {
            counts[intensity_bin(color.luma())] += 1;
        }
        Self {
            counts,
            pixel_total: colors.len() as u64,
        }
    }

    /// Bins the 6-bit color code of every pixel into the 64 color-code bins.
    pub fn color_code(colors: &[PixelColor]) -> Self {
        let mut counts = vec![0u64; COLOR_CODE_BIN_COUNT];
        for color in colors {
            counts[color.color_code() as usize] += 1;
        }
        Self {
            counts,
            pixel_total: colors.len() as u64,
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn pixel_total(&self) -> u64 {
        self.pixel_total
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Converts counts to frequencies by dividing each bin by the source
    /// image's pixel total. This is the one place that normalization
    /// happens; callers must not divide again.
    pub fn frequencies(&self) -> Vec<f64> {
        if self.pixel_total == 0 {
            return vec![0.0; self.counts.len()];
        }
        let total = self.pixel_total as f64;
        self.counts.iter().map(|&c| c as f64 / total).collect()
    }
}

/// Maps a luma value to its intensity bin, folding the overflow index into
/// the last bin.
fn intensity_bin(luma: f64) -> usize {
    let index = (luma / INTENSITY_BIN_WIDTH) as usize;
    index.min(INTENSITY_BIN_COUNT - 1)
}
