//! Samlabel Core Type Definitions
//!
//! Defines fundamental types used throughout the engine.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Image identifier (file name within the image folder, e.g. `a.png`)
pub type ImageId = String;

/// Object identifier, unique within one frame (`o1`, `o2`, ...)
pub type ObjectId = String;

/// Monotonic point-set version stamp
pub type PointSetVersion = u64;

// =============================================================================
// Geometry
// =============================================================================

/// Label of a prompt point
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointLabel {
    /// Inclusion point (foreground)
    Positive,
    /// Exclusion point (background)
    Negative,
}

impl PointLabel {
    /// Numeric label as expected by SAM-style models (1 = positive, 0 = negative)
    pub fn as_model_label(&self) -> i32 {
        match self {
            PointLabel::Positive => 1,
            PointLabel::Negative => 0,
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, PointLabel::Positive)
    }
}

/// A labeled prompt point in image pixel space
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl Point {
    /// Creates a new point
    pub fn new(x: f32, y: f32, label: PointLabel) -> Self {
        Self { x, y, label }
    }

    /// Creates a positive point
    pub fn positive(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Positive)
    }

    /// Creates a negative point
    pub fn negative(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Negative)
    }
}

/// Pixel extent of an image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtent {
    pub width: u32,
    pub height: u32,
}

impl ImageExtent {
    /// Creates a new extent
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if the coordinate lies inside the image.
    ///
    /// Pixel coordinates are half-open: `0 <= x < width`, `0 <= y < height`.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x.is_finite()
            && y.is_finite()
            && x >= 0.0
            && y >= 0.0
            && x < self.width as f32
            && y < self.height as f32
    }

    /// Number of pixels
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
