//! Perceptual fingerprints and their transform closure.
//!
//! A fingerprint is a DCT perceptual hash of the intensity channel, `k²` bits
//! wide. Matching has to survive the image being rotated or mirrored, so every
//! image is hashed under all eight symmetries of the square and the distinct
//! results are kept together as a [`FingerprintSet`].

use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Fixed-width perceptual bit vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Hamming distance, or `None` when the widths differ.
    pub fn distance(&self, other: &Fingerprint) -> Option<u32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        Some(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    pub fn is_within(&self, other: &Fingerprint, threshold: u32) -> bool {
        self.distance(other).is_some_and(|d| d <= threshold)
    }
}

impl From<u64> for Fingerprint {
    fn from(bits: u64) -> Self {
        Self(bits.to_be_bytes().to_vec())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The eight symmetries of the square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
    Mirror,
    Rotate90Mirror,
    Rotate180Mirror,
    Rotate270Mirror,
}

impl Symmetry {
    pub const ALL: [Symmetry; 8] = [
        Symmetry::Identity,
        Symmetry::Rotate90,
        Symmetry::Rotate180,
        Symmetry::Rotate270,
        Symmetry::Mirror,
        Symmetry::Rotate90Mirror,
        Symmetry::Rotate180Mirror,
        Symmetry::Rotate270Mirror,
    ];

    /// Apply the transform. Quarter turns swap width and height, so the
    /// whole image is kept.
    pub fn apply(&self, img: &DynamicImage) -> DynamicImage {
        match self {
            Symmetry::Identity => img.clone(),
            Symmetry::Rotate90 => img.rotate90(),
            Symmetry::Rotate180 => img.rotate180(),
            Symmetry::Rotate270 => img.rotate270(),
            Symmetry::Mirror => img.fliph(),
            Symmetry::Rotate90Mirror => img.rotate90().fliph(),
            Symmetry::Rotate180Mirror => img.rotate180().fliph(),
            Symmetry::Rotate270Mirror => img.rotate270().fliph(),
        }
    }
}

/// Primary fingerprint followed by the distinct fingerprints of the other
/// seven symmetries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    variants: Vec<Fingerprint>,
}

impl FingerprintSet {
    /// Build from fingerprints in symmetry order, dropping repeats.
    pub fn from_variants(all: impl IntoIterator<Item = Fingerprint>) -> Self {
        let mut variants: Vec<Fingerprint> = Vec::with_capacity(8);
        for fp in all {
            if !variants.contains(&fp) {
                variants.push(fp);
            }
        }
        Self { variants }
    }

    /// `None` only for an empty set, which never matches anything.
    pub fn primary(&self) -> Option<&Fingerprint> {
        self.variants.first()
    }

    pub fn variants(&self) -> &[Fingerprint] {
        &self.variants
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// True when `other`'s primary is within `threshold` of any of our variants.
    pub fn covers(&self, other: &FingerprintSet, threshold: u32) -> bool {
        let Some(target) = other.primary() else {
            return false;
        };
        self.variants.iter().any(|v| v.is_within(target, threshold))
    }

    /// Non-empty, and every variant is `bytes` long.
    pub fn has_width(&self, bytes: usize) -> bool {
        !self.variants.is_empty() && self.variants.iter().all(|v| v.as_bytes().len() == bytes)
    }

    /// Near-duplicate relation, checked from both sides.
    pub fn matches(&self, other: &FingerprintSet, threshold: u32) -> bool {
        self.covers(other, threshold) || other.covers(self, threshold)
    }
}

/// Computes transform-closed perceptual fingerprints.
pub struct FingerprintEngine {
    hasher: Hasher,
}

impl FingerprintEngine {
    /// `hash_size` is bits per side; fingerprints are `hash_size²` bits.
    pub fn new(hash_size: u32) -> Self {
        let hasher = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Median)
            .preproc_dct()
            .to_hasher();

        Self { hasher }
    }

    /// Fingerprint of a single image, no transforms.
    pub fn fingerprint(&self, img: &DynamicImage) -> Fingerprint {
        let hash = self.hasher.hash_image(img);
        Fingerprint::from_bytes(hash.as_bytes().to_vec())
    }

    /// Fingerprints of the image under all eight symmetries.
    pub fn fingerprint_closure(&self, img: &DynamicImage) -> FingerprintSet {
        let luma = DynamicImage::ImageLuma8(img.to_luma8());
        FingerprintSet::from_variants(
            Symmetry::ALL
                .iter()
                .map(|symmetry| self.fingerprint(&symmetry.apply(&luma))),
        )
    }

    pub fn fingerprint_file(&self, path: &Path) -> Result<FingerprintSet, FingerprintError> {
        let img = load_image(path)?;
        Ok(self.fingerprint_closure(&img))
    }
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Open and decode an image, sniffing the format from its contents.
pub fn load_image(path: &Path) -> Result<DynamicImage, FingerprintError> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(img)
}
