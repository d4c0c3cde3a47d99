use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];
}

/// Tuning for the black-corner heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerConfig {
    /// Leg length of the sampled triangle, in pixels.
    pub sample_size: u32,
    /// A pixel is dark when every colour channel is at or below this.
    pub darkness_threshold: u8,
    /// A corner is black when its dark ratio exceeds this fraction.
    pub dark_ratio: f32,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            sample_size: 20,
            darkness_threshold: 10,
            dark_ratio: 0.6,
        }
    }
}

/// Dark-pixel ratio per corner, in [`Corner::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerProfile {
    pub per_corner_dark_ratio: [f32; 4],
}

impl CornerProfile {
    pub fn black_corners(&self, dark_ratio: f32) -> usize {
        self.per_corner_dark_ratio
            .iter()
            .filter(|&&ratio| ratio > dark_ratio)
            .count()
    }
}

/// Flags images whose four corners hold the black triangles left behind by
/// an expanding rotation.
#[derive(Debug, Clone, Default)]
pub struct CornerDetector {
    config: CornerConfig,
}

impl CornerDetector {
    pub fn new(config: CornerConfig) -> Self {
        Self { config }
    }

    /// `None` when the image is too small for the sample window.
    pub fn profile(&self, img: &DynamicImage) -> Option<CornerProfile> {
        let (width, height) = img.dimensions();
        let size = self.config.sample_size;
        let span = size.checked_mul(2)?;
        if size == 0 || width < span || height < span {
            return None;
        }

        let mut per_corner_dark_ratio = [0.0f32; 4];
        for (slot, corner) in per_corner_dark_ratio.iter_mut().zip(Corner::ALL) {
            *slot = self.dark_ratio(img, corner);
        }
        Some(CornerProfile {
            per_corner_dark_ratio,
        })
    }

    /// All four corners must be black; three is not enough.
    pub fn is_rotation_artifact(&self, img: &DynamicImage) -> bool {
        self.profile(img)
            .map(|profile| profile.black_corners(self.config.dark_ratio) == 4)
            .unwrap_or(false)
    }

    fn dark_ratio(&self, img: &DynamicImage, corner: Corner) -> f32 {
        let (width, height) = img.dimensions();
        let size = self.config.sample_size;
        let threshold = self.config.darkness_threshold;

        let mut dark = 0u32;
        let mut total = 0u32;
        // (dx, dy) is the offset from the corner pixel; the triangle is dx + dy < size.
        for dy in 0..size {
            for dx in 0..(size - dy) {
                let x = match corner {
                    Corner::TopLeft | Corner::BottomLeft => dx,
                    Corner::TopRight | Corner::BottomRight => width - 1 - dx,
                };
                let y = match corner {
                    Corner::TopLeft | Corner::TopRight => dy,
                    Corner::BottomLeft | Corner::BottomRight => height - 1 - dy,
                };
                let pixel = img.get_pixel(x, y);
                if pixel.0[..3].iter().all(|&c| c <= threshold) {
                    dark += 1;
                }
                total += 1;
            }
        }

        if total == 0 {
            0.0
        } else {
            dark as f32 / total as f32
        }
    }
}
