//! Segmentation Mask Module
//!
//! Per-pixel membership maps produced by a segmentation provider.
//!
//! A mask stores one byte per pixel: `0` is background, `255` is full
//! membership, anything in between is a quantized probability. Binary masks
//! only use `0` and `255`. Masks are derived data and are never edited by hand.
//!
//! For persistence masks are run-length encoded ([`EncodedMask`]), which is
//! lossless for both binary and probability maps.

use serde::{Deserialize, Serialize};

use crate::core::{CoreError, CoreResult, ImageExtent};

/// Membership value at or above which a pixel counts as inside the mask
pub const MEMBERSHIP_THRESHOLD: u8 = 128;

// =============================================================================
// Mask
// =============================================================================

/// Per-pixel membership result with a confidence score
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
    score: f32,
}

impl Mask {
    /// Creates a mask from raw membership bytes (row-major)
    pub fn new(width: u32, height: u32, data: Vec<u8>, score: f32) -> CoreResult<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(CoreError::ValidationError(format!(
                "Mask data length {} does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            score,
        })
    }

    /// Creates a binary mask from per-pixel booleans
    pub fn from_binary(width: u32, height: u32, pixels: &[bool], score: f32) -> CoreResult<Self> {
        let data = pixels.iter().map(|&on| if on { 255 } else { 0 }).collect();
        Self::new(width, height, data, score)
    }

    /// Creates a probability mask, quantizing `[0, 1]` values to bytes
    pub fn from_probabilities(
        width: u32,
        height: u32,
        probabilities: &[f32],
        score: f32,
    ) -> CoreResult<Self> {
        let data = probabilities
            .iter()
            .map(|p| {
                let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
                (p * 255.0).round() as u8
            })
            .collect();
        Self::new(width, height, data, score)
    }

    /// Creates an all-background mask
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
            score: 0.0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn extent(&self) -> ImageExtent {
        ImageExtent::new(self.width, self.height)
    }

    /// Confidence score reported by the provider
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Raw membership bytes (row-major)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Membership value at a pixel, `None` outside the mask
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Returns true if the pixel is inside the mask
    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.get(x, y).is_some_and(|v| v >= MEMBERSHIP_THRESHOLD)
    }

    /// Number of pixels inside the mask
    pub fn area(&self) -> usize {
        self.data
            .iter()
            .filter(|&&v| v >= MEMBERSHIP_THRESHOLD)
            .count()
    }

    /// True when no pixel is inside the mask
    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    /// Tight bounding box of the pixels inside the mask
    pub fn bounds(&self) -> Option<MaskBounds> {
        let mut bounds: Option<MaskBounds> = None;
        let width = self.width as usize;
        for (i, &v) in self.data.iter().enumerate() {
            if v < MEMBERSHIP_THRESHOLD {
                continue;
            }
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            bounds = Some(match bounds {
                None => MaskBounds {
                    x_min: x,
                    y_min: y,
                    x_max: x,
                    y_max: y,
                },
                Some(b) => MaskBounds {
                    x_min: b.x_min.min(x),
                    y_min: b.y_min.min(y),
                    x_max: b.x_max.max(x),
                    y_max: b.y_max.max(y),
                },
            });
        }
        bounds
    }

    /// Run-length encodes the mask for persistence
    pub fn encode(&self) -> EncodedMask {
        let mut runs: Vec<(u8, u32)> = Vec::new();
        for &v in &self.data {
            match runs.last_mut() {
                Some((value, len)) if *value == v => *len += 1,
                _ => runs.push((v, 1)),
            }
        }
        EncodedMask {
            width: self.width,
            height: self.height,
            score: self.score,
            runs,
        }
    }
}

/// Inclusive pixel bounding box of a mask
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaskBounds {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl MaskBounds {
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min + 1
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min + 1
    }
}

// =============================================================================
// Encoded Mask
// =============================================================================

/// Run-length encoded mask as stored on disk
///
/// `runs` is a list of `[value, length]` pairs covering the mask row by row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodedMask {
    pub width: u32,
    pub height: u32,
    pub score: f32,
    pub runs: Vec<(u8, u32)>,
}

impl EncodedMask {
    /// Decodes back into a mask, validating the run lengths
    pub fn decode(&self) -> CoreResult<Mask> {
        let expected = self.width as usize * self.height as usize;
        let total: usize = self.runs.iter().map(|(_, len)| *len as usize).sum();
        if total != expected {
            return Err(CoreError::ValidationError(format!(
                "Encoded mask covers {} pixels, expected {} ({}x{})",
                total, expected, self.width, self.height
            )));
        }

        let mut data = Vec::with_capacity(expected);
        for &(value, len) in &self.runs {
            data.extend(std::iter::repeat(value).take(len as usize));
        }
        Mask::new(self.width, self.height, data, self.score)
    }
}
