// THEORY:
// The `pixel` module is the most fundamental unit of the retrieval engine. It
// is a "dumb" data container for a single pixel plus the two single-pixel
// transforms the feature layer is built on:
//
// - luma:       Rec. 601 perceived brightness, `0.299R + 0.587G + 0.114B`,
//               a real value in [0, 255]. This is the quantity the intensity
//               histogram bins.
// - color code: a coarse 6-bit quantization of the pixel's color, formed by
//               concatenating the top 2 bits of each of R, G and B (red bits
//               most significant). This is the quantity the color-code
//               histogram bins, and it is always in [0, 63] by construction —
//               the bit arithmetic cannot produce anything else for an 8-bit
//               channel.
//
// Anything that needs more than one pixel (histograms, distances) belongs in
// higher modules. Alpha is carried through extraction because the decoder
// provides it, but no feature computation reads it.
//
// Extraction (`colors_from_file` / `colors_from_image`) visits every pixel of
// the decoded raster exactly once, in row-major scan order. The downstream
// histograms are order-independent, so the order only matters for
// exhaustiveness, not semantics.

pub mod pixel {
    use crate::error::{RetrievalError, Result};
    use image::DynamicImage;
    use std::path::Path;

    pub type Channel = u8;
    pub type Luma = f64;
    pub type ColorCode = u8;

    /// An immutable RGB triple for a single pixel. Created once during
    /// extraction and never mutated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PixelColor {
        /// The red channel value (0-255).
        pub red: Channel,
        /// The green channel value (0-255).
        pub green: Channel,
        /// The blue channel value (0-255).
        pub blue: Channel,
        /// The alpha channel value (0-255). Carried but unused by features.
        pub alpha: Channel,
    }

    impl PixelColor {
        pub fn new(red: Channel, green: Channel, blue: Channel, alpha: Channel) -> Self {
            Self {
                red,
                green,
                blue,
                alpha,
            }
        }

        /// Luma estimate (Rec. 601), in [0, 255].
        pub fn luma(&self) -> Luma {
            0.299_f64 * self.red as f64
                + 0.587_f64 * self.green as f64
                + 0.114_f64 * self.blue as f64
        }

        /// 6-bit color code: top 2 bits of R, G, B concatenated, red bits
        /// most significant. Always in [0, 63].
        pub fn color_code(&self) -> ColorCode {
            ((self.red >> 6) << 4) | ((self.green >> 6) << 2) | (self.blue >> 6)
        }
    }

    /// Decodes the image at `path` and extracts its full pixel sequence.
    /// Fails when the file cannot be decoded or holds zero pixels.
    pub fn colors_from_file(path: &Path) -> Result<Vec<PixelColor>> {
        let decoded = image::open(path).map_err(|source| RetrievalError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        let colors = colors_from_image(&decoded);
        if colors.is_empty() {
            return Err(RetrievalError::EmptyImage {
                path: path.display().to_string(),
            });
        }
        Ok(colors)
    }

    /// Extracts every pixel of an already-decoded image, row-major.
    pub fn colors_from_image(image: &DynamicImage) -> Vec<PixelColor> {
        let rgba = image.to_rgba8();
        rgba.pixels()
            .map(|p| PixelColor::new(p.0[0], p.0[1], p.0[2], p.0[3]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::pixel::*;

    #[test]
    fn luma_matches_rec601_weights() {
        let white = PixelColor::new(255, 255, 255, 255);
        assert!((white.luma() - 255.0).abs() < 1e-9);

        let red = PixelColor::new(255, 0, 0, 255);
        assert!((red.luma() - 0.299 * 255.0).abs() < 1e-9);
    }

    #[test]
    fn color_code_packs_top_bits_red_first() {
        // 0b11 << 4 | 0b00 << 2 | 0b00 = 48
        assert_eq!(PixelColor::new(255, 0, 0, 255).color_code(), 48);
        // 0b00 << 4 | 0b11 << 2 | 0b00 = 12
        assert_eq!(PixelColor::new(0, 255, 0, 255).color_code(), 12);
        // 0b00 << 4 | 0b00 << 2 | 0b11 = 3
        assert_eq!(PixelColor::new(0, 0, 255, 255).color_code(), 3);
        assert_eq!(PixelColor::new(0, 0, 0, 255).color_code(), 0);
        assert_eq!(PixelColor::new(255, 255, 255, 255).color_code(), 63);
    }

    #[test]
    fn color_code_is_always_in_range() {
        for value in 0..=255u8 {
            let code = PixelColor::new(value, 255 - value, value ^ 0b1010_1010, 255).color_code();
            assert!(code <= 63);
        }
    }

    #[test]
    fn extraction_visits_every_pixel_once() {
        let image = image::DynamicImage::new_rgba8(3, 2);
        let colors = colors_from_image(&image);
        assert_eq!(colors.len(), 6);
    }
}
