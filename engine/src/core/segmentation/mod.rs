//! Segmentation Service
//!
//! Provider-agnostic access to the point-prompted segmentation model.
//!
//! The engine only talks to [`SegmentationProvider`]; every call goes through
//! [`run_segmentation`], which applies the deadline, validates the masks and
//! stamps the result with the point-set versions it was computed from.

pub mod provider;
pub mod providers;

#[cfg(test)]
pub mod testing;

pub use provider::{
    run_segmentation, ObjectMask, ObjectPrompt, SegmentationLimits, SegmentationProvider,
    SegmentationRequest, SegmentationResponse,
};
pub use providers::{RemoteSam2Provider, Sam2Model};

/// Default deadline for one segmentation call
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default confidence below which masks are flagged
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.88;
