//! Segmentation Provider Trait
//!
//! Defines the interface to the segmentation model and the request/response
//! types that cross it. The model is a black box: given an image and labeled
//! points per object, it returns a mask and a confidence score per object.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::{
    annotations::{FrameAnnotation, MaskUpdate, VersionStamp},
    images::ImageFrame,
    masks::Mask,
    CoreError, CoreResult, ObjectId, Point,
};

// =============================================================================
// Segmentation Request
// =============================================================================

/// Points of one object to segment
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectPrompt {
    pub object_id: ObjectId,
    pub points: Vec<Point>,
}

/// One image plus the labeled points of every object that has any
#[derive(Clone, Debug)]
pub struct SegmentationRequest {
    /// Pixels of the frame's bound image
    pub image: ImageFrame,
    /// Prompts in object insertion order
    pub objects: Vec<ObjectPrompt>,
    /// Point-set versions at request time
    pub stamp: VersionStamp,
}

impl SegmentationRequest {
    /// Builds a request covering exactly the objects with at least one point
    pub fn from_frame(image: ImageFrame, frame: &FrameAnnotation) -> CoreResult<Self> {
        if image.id != frame.image_id {
            return Err(CoreError::InvalidState(format!(
                "Image {} does not match frame {}",
                image.id, frame.image_id
            )));
        }

        let prompted: Vec<_> = frame.objects.iter().filter(|o| o.has_points()).collect();
        if prompted.is_empty() {
            return Err(CoreError::InvalidState(
                "No object has any points to segment".to_string(),
            ));
        }

        Ok(Self {
            objects: prompted
                .iter()
                .map(|o| ObjectPrompt {
                    object_id: o.id.clone(),
                    points: o.points.clone(),
                })
                .collect(),
            stamp: VersionStamp {
                image_id: frame.image_id.clone(),
                versions: prompted.iter().map(|o| (o.id.clone(), o.version)).collect(),
            },
            image,
        })
    }

    pub fn point_count(&self) -> usize {
        self.objects.iter().map(|o| o.points.len()).sum()
    }
}

// =============================================================================
// Segmentation Response
// =============================================================================

/// Mask produced for one object
#[derive(Clone, Debug)]
pub struct ObjectMask {
    pub object_id: ObjectId,
    pub mask: Mask,
}

/// Masks for every object in a request
#[derive(Clone, Debug, Default)]
pub struct SegmentationResponse {
    pub masks: Vec<ObjectMask>,
    /// Wall-clock model time reported by the provider
    pub inference_ms: Option<u64>,
}

impl SegmentationResponse {
    /// Checks that every requested object got exactly one mask at image size
    pub fn validate(&self, request: &SegmentationRequest) -> CoreResult<()> {
        let extent = request.image.extent();

        for prompt in &request.objects {
            let matches = self
                .masks
                .iter()
                .filter(|m| m.object_id == prompt.object_id)
                .count();
            if matches != 1 {
                return Err(CoreError::SegmentationFailed(format!(
                    "Expected one mask for object {}, got {}",
                    prompt.object_id, matches
                )));
            }
        }

        for object_mask in &self.masks {
            if !request
                .objects
                .iter()
                .any(|p| p.object_id == object_mask.object_id)
            {
                return Err(CoreError::SegmentationFailed(format!(
                    "Mask returned for unrequested object {}",
                    object_mask.object_id
                )));
            }
            if object_mask.mask.extent() != extent {
                return Err(CoreError::SegmentationFailed(format!(
                    "Mask for object {} is {}x{}, image is {}x{}",
                    object_mask.object_id,
                    object_mask.mask.width(),
                    object_mask.mask.height(),
                    extent.width,
                    extent.height
                )));
            }
        }

        Ok(())
    }

    /// Converts into a stamped state update
    pub fn into_update(self, stamp: VersionStamp) -> MaskUpdate {
        MaskUpdate {
            stamp,
            masks: self
                .masks
                .into_iter()
                .map(|m| (m.object_id, m.mask))
                .collect(),
        }
    }
}

// =============================================================================
// Segmentation Provider Trait
// =============================================================================

/// Trait for segmentation backends
///
/// Implementations:
/// - `RemoteSam2Provider`: SAM2 HTTP inference service
#[async_trait]
pub trait SegmentationProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Segments every object in the request
    async fn segment(&self, request: &SegmentationRequest) -> CoreResult<SegmentationResponse>;

    /// Performs health check to verify the provider is reachable
    async fn health_check(&self) -> CoreResult<()>;
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Limits applied around a provider call
#[derive(Clone, Copy, Debug)]
pub struct SegmentationLimits {
    /// Deadline for one `segment` call
    pub timeout: Duration,
    /// Masks scoring below this are applied with a warning
    pub min_confidence: f32,
}

impl Default for SegmentationLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(super::DEFAULT_TIMEOUT_SECS),
            min_confidence: super::DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Runs one provider call under a deadline and validates the result.
///
/// Provider errors other than timeouts surface as `SegmentationFailed`.
pub async fn run_segmentation(
    provider: &dyn SegmentationProvider,
    request: &SegmentationRequest,
    limits: SegmentationLimits,
) -> CoreResult<MaskUpdate> {
    tracing::debug!(
        provider = provider.name(),
        image_id = %request.image.id,
        objects = request.objects.len(),
        points = request.point_count(),
        "Running segmentation"
    );

    let response = match tokio::time::timeout(limits.timeout, provider.segment(request)).await {
        Err(_) => return Err(CoreError::Timeout(limits.timeout.as_millis() as u64)),
        Ok(Err(e @ (CoreError::SegmentationFailed(_) | CoreError::Timeout(_)))) => return Err(e),
        Ok(Err(e)) => return Err(CoreError::SegmentationFailed(e.to_string())),
        Ok(Ok(response)) => response,
    };

    response.validate(request)?;

    for object_mask in &response.masks {
        if object_mask.mask.score() < limits.min_confidence {
            tracing::warn!(
                image_id = %request.image.id,
                object_id = %object_mask.object_id,
                score = object_mask.mask.score(),
                min_confidence = limits.min_confidence,
                "Low-confidence mask"
            );
        }
    }

    if let Some(ms) = response.inference_ms {
        tracing::debug!(image_id = %request.image.id, inference_ms = ms, "Segmentation finished");
    }

    Ok(response.into_update(request.stamp.clone()))
}

// =============================================================================
// Tests
// =============================================================================
