//! Image Set Provider
//!
//! Resolves an image folder into an ordered, stable sequence of image
//! identifiers and supplies pixel data on demand.
//!
//! The engine only depends on the [`ImageSource`] trait; [`FolderImageSource`]
//! is the on-disk implementation used by the CLI and by tests.

mod source;

pub use source::*;

use std::sync::Arc;

use serde::Serialize;

use crate::core::{CoreResult, ImageExtent, ImageId};

/// Default image file extensions (matched case-insensitively)
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

// =============================================================================
// Image Frame
// =============================================================================

/// Decoded image pixels (RGB8, row-major)
#[derive(Clone, Debug)]
pub struct ImageFrame {
    pub id: ImageId,
    pub width: u32,
    pub height: u32,
    /// Shared so requests can be handed to the background path without copying
    pub pixels: Arc<Vec<u8>>,
}

impl ImageFrame {
    /// Creates a frame, validating the buffer length against the dimensions
    pub fn new(id: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> CoreResult<Self> {
        let id = id.into();
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(crate::core::CoreError::ImageLoad {
                image_id: id,
                reason: format!(
                    "pixel buffer has {} bytes, expected {} for {}x{} RGB",
                    pixels.len(),
                    expected,
                    width,
                    height
                ),
            });
        }
        Ok(Self {
            id,
            width,
            height,
            pixels: Arc::new(pixels),
        })
    }

    pub fn extent(&self) -> ImageExtent {
        ImageExtent::new(self.width, self.height)
    }
}

/// Position and size information about one image in the sequence
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub image_id: ImageId,
    pub path: String,
    pub index: usize,
    pub total: usize,
    pub width: u32,
    pub height: u32,
}

// =============================================================================
// Image Source Trait
// =============================================================================

/// Ordered image sequence with on-demand pixel access
pub trait ImageSource: Send + Sync {
    /// Ordered, stable list of image identifiers
    fn list(&self) -> Vec<ImageId>;

    /// Decodes the pixels of one image
    fn get(&self, image_id: &str) -> CoreResult<ImageFrame>;

    /// Reads only the image dimensions
    fn dimensions(&self, image_id: &str) -> CoreResult<ImageExtent>;

    /// Human-readable location of an image (file path for folder sources)
    fn locate(&self, image_id: &str) -> Option<String>;

    /// Number of images in the sequence
    fn len(&self) -> usize {
        self.list().len()
    }

    /// True when the sequence is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of an image in the sequence
    fn index_of(&self, image_id: &str) -> Option<usize> {
        self.list().iter().position(|id| id == image_id)
    }
}
