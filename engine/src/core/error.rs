//! Samlabel Error Definitions
//!
//! Defines error types used throughout the engine.

use thiserror::Error;

use super::{ImageId, ObjectId};

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Annotation State Errors
    // =========================================================================
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    #[error("Point ({x}, {y}) is outside the {width}x{height} image")]
    OutOfBounds {
        x: f32,
        y: f32,
        width: u32,
        height: u32,
    },

    // =========================================================================
    // Segmentation Errors
    // =========================================================================
    #[error("Segmentation failed: {0}")]
    SegmentationFailed(String),

    /// Deadline in milliseconds
    #[error("Segmentation timed out after {0} ms")]
    Timeout(u64),

    #[error("Busy: {0}")]
    Busy(String),

    // =========================================================================
    // Persistence / Image Errors
    // =========================================================================
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Failed to load image {image_id}: {reason}")]
    ImageLoad { image_id: ImageId, reason: String },

    // =========================================================================
    // Batch Errors
    // =========================================================================
    /// A batch stopped early on request
    #[error("Cancelled")]
    Cancelled,

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Usage errors are surfaced immediately and never retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidState(_) | CoreError::UnknownObject(_) | CoreError::OutOfBounds { .. }
        )
    }

    /// Recoverable errors leave the frame in a retryable state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::SegmentationFailed(_) | CoreError::Timeout(_) | CoreError::Busy(_)
        )
    }

    /// Wraps any displayable error as a persistence error.
    pub fn persistence(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        CoreError::PersistenceError(format!("{}: {}", context, err))
    }
}
