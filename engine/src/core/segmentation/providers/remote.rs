//! Remote SAM2 Provider
//!
//! Segments images through a SAM2 HTTP inference service
//! (`POST {endpoint}/api/segment`).
//!
//! The service takes one prompt per call, so a request with several objects
//! results in one call per object. Points are sent in the 1024x1024 model
//! input space; the returned mask is decoded from the PNG alpha channel,
//! brought back to the original resolution and thresholded.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::segmentation::{
    ObjectMask, SegmentationProvider, SegmentationRequest, SegmentationResponse,
};
use crate::core::{masks::Mask, CoreError, CoreResult, Point};

// =============================================================================
// Constants
// =============================================================================

/// Side length of the square model input space
pub const MODEL_INPUT_SIZE: u32 = 1024;

/// Default probability threshold sent to the service
pub const DEFAULT_MASK_THRESHOLD: f32 = 0.5;

// =============================================================================
// Wire Types
// =============================================================================

/// Model size served by the SAM2 service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sam2Model {
    Tiny,
    Small,
    BasePlus,
    #[default]
    Large,
}

impl std::str::FromStr for Sam2Model {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tiny" => Ok(Sam2Model::Tiny),
            "small" => Ok(Sam2Model::Small),
            "baseplus" | "base_plus" | "base-plus" => Ok(Sam2Model::BasePlus),
            "large" => Ok(Sam2Model::Large),
            other => Err(CoreError::ValidationError(format!(
                "Unknown SAM2 model size: {}",
                other
            ))),
        }
    }
}

#[cfg_attr(not(feature = "remote-provider"), allow(dead_code))]
#[derive(Debug, Clone, Serialize)]
struct WirePoint {
    x: f32,
    y: f32,
    label: i32,
}

#[cfg_attr(not(feature = "remote-provider"), allow(dead_code))]
#[derive(Debug, Serialize)]
struct WireSegmentRequest<'a> {
    model: Sam2Model,
    image_b64: &'a str,
    points: Vec<WirePoint>,
    threshold: Option<f32>,
}

#[cfg_attr(not(feature = "remote-provider"), allow(dead_code))]
#[derive(Debug, Deserialize)]
struct WireSegmentResponse {
    iou: [f32; 3],
    best_idx: usize,
    #[serde(default)]
    inference_ms: u64,
    mask_png_b64: String,
    #[serde(default)]
    masked_region_png_b64: Option<String>,
}

// =============================================================================
// Remote SAM2 Provider
// =============================================================================

/// SAM2 HTTP inference provider
#[cfg_attr(not(feature = "remote-provider"), allow(dead_code))]
pub struct RemoteSam2Provider {
    endpoint: String,
    model: Sam2Model,
    threshold: f32,
    timeout: Duration,
    #[cfg(feature = "remote-provider")]
    client: reqwest::Client,
}

impl RemoteSam2Provider {
    /// Creates a provider for a service base URL (e.g. `http://localhost:8080`)
    #[cfg(feature = "remote-provider")]
    pub fn new(endpoint: &str, model: Sam2Model, timeout: Duration) -> CoreResult<Self> {
        let endpoint = normalize_endpoint(endpoint)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint,
            model,
            threshold: DEFAULT_MASK_THRESHOLD,
            timeout,
            client,
        })
    }

    /// Creates a provider (stub for builds without `remote-provider`)
    #[cfg(not(feature = "remote-provider"))]
    pub fn new(endpoint: &str, model: Sam2Model, timeout: Duration) -> CoreResult<Self> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            model,
            threshold: DEFAULT_MASK_THRESHOLD,
            timeout,
        })
    }

    /// Sets the probability threshold sent with each request
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> Sam2Model {
        self.model
    }

    #[cfg(feature = "remote-provider")]
    async fn segment_object(
        &self,
        image_b64: &str,
        width: u32,
        height: u32,
        points: &[Point],
    ) -> CoreResult<(Mask, u64)> {
        let body = WireSegmentRequest {
            model: self.model,
            image_b64,
            points: points
                .iter()
                .map(|p| to_model_point(p, width, height))
                .collect(),
            threshold: Some(self.threshold),
        };

        let response = self
            .client
            .post(format!("{}/api/segment", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    CoreError::SegmentationFailed(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::SegmentationFailed(format!(
                "SAM2 service returned {}: {}",
                status, text
            )));
        }

        let parsed: WireSegmentResponse = response.json().await.map_err(|e| {
            CoreError::SegmentationFailed(format!("Invalid SAM2 response: {}", e))
        })?;

        let score = parsed.iou.get(parsed.best_idx).copied().unwrap_or(0.0);
        let png_b64 = parsed
            .masked_region_png_b64
            .as_deref()
            .unwrap_or(&parsed.mask_png_b64);
        let png = decode_base64(png_b64)?;
        let mask = mask_from_alpha_png(&png, width, height, score)?;

        Ok((mask, parsed.inference_ms))
    }
}

#[async_trait]
impl SegmentationProvider for RemoteSam2Provider {
    fn name(&self) -> &str {
        "remote-sam2"
    }

    #[cfg(feature = "remote-provider")]
    async fn segment(&self, request: &SegmentationRequest) -> CoreResult<SegmentationResponse> {
        let image_b64 = encode_image_png_b64(&request.image)?;
        let (width, height) = (request.image.width, request.image.height);

        let mut masks = Vec::with_capacity(request.objects.len());
        let mut inference_ms = 0;
        for prompt in &request.objects {
            let (mask, ms) = self
                .segment_object(&image_b64, width, height, &prompt.points)
                .await?;
            tracing::debug!(
                object_id = %prompt.object_id,
                score = mask.score(),
                area = mask.area(),
                "SAM2 mask received"
            );
            inference_ms += ms;
            masks.push(ObjectMask {
                object_id: prompt.object_id.clone(),
                mask,
            });
        }

        Ok(SegmentationResponse {
            masks,
            inference_ms: Some(inference_ms),
        })
    }

    #[cfg(not(feature = "remote-provider"))]
    async fn segment(&self, _request: &SegmentationRequest) -> CoreResult<SegmentationResponse> {
        Err(CoreError::SegmentationFailed(
            "Remote provider not enabled. Build with --features remote-provider".to_string(),
        ))
    }

    #[cfg(feature = "remote-provider")]
    async fn health_check(&self) -> CoreResult<()> {
        let response = self
            .client
            .get(format!("{}/api/models", self.endpoint))
            .send()
            .await
            .map_err(|e| CoreError::SegmentationFailed(format!("SAM2 service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::SegmentationFailed(format!(
                "SAM2 service health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    #[cfg(not(feature = "remote-provider"))]
    async fn health_check(&self) -> CoreResult<()> {
        Err(CoreError::SegmentationFailed(
            "Remote provider not enabled. Build with --features remote-provider".to_string(),
        ))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn normalize_endpoint(endpoint: &str) -> CoreResult<String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(CoreError::ValidationError(format!(
            "Segmentation endpoint must be an http(s) URL: {}",
            endpoint
        )));
    }
    Ok(trimmed.to_string())
}

/// Scales an image-space coordinate into the square model space
pub fn to_model_space(value: f32, extent: u32) -> f32 {
    if extent == 0 {
        return 0.0;
    }
    let scaled = value * MODEL_INPUT_SIZE as f32 / extent as f32;
    scaled.clamp(0.0, (MODEL_INPUT_SIZE - 1) as f32)
}

#[cfg_attr(not(feature = "remote-provider"), allow(dead_code))]
fn to_model_point(point: &Point, width: u32, height: u32) -> WirePoint {
    WirePoint {
        x: to_model_space(point.x, width),
        y: to_model_space(point.y, height),
        label: point.label.as_model_label(),
    }
}

/// Builds a binary mask from the alpha channel of a PNG, resizing to
/// `width`x`height` when the PNG is in model space
pub fn mask_from_alpha_png(png: &[u8], width: u32, height: u32, score: f32) -> CoreResult<Mask> {
    let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .map_err(|e| CoreError::SegmentationFailed(format!("Invalid mask PNG: {}", e)))?;

    let mut alpha = image::GrayImage::new(decoded.width(), decoded.height());
    for (x, y, pixel) in decoded.to_rgba8().enumerate_pixels() {
        alpha.put_pixel(x, y, image::Luma([pixel.0[3]]));
    }

    if alpha.dimensions() != (width, height) {
        alpha = image::imageops::resize(&alpha, width, height, image::imageops::FilterType::Triangle);
    }

    let pixels: Vec<bool> = alpha
        .into_raw()
        .into_iter()
        .map(|a| a >= crate::core::masks::MEMBERSHIP_THRESHOLD)
        .collect();
    Mask::from_binary(width, height, &pixels, score)
}

#[cfg(feature = "remote-provider")]
fn decode_base64(data: &str) -> CoreResult<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| CoreError::SegmentationFailed(format!("Invalid base64 mask: {}", e)))
}

#[cfg(feature = "remote-provider")]
fn encode_image_png_b64(image: &crate::core::images::ImageFrame) -> CoreResult<String> {
    use base64::Engine as _;

    let rgb = image::RgbImage::from_raw(image.width, image.height, image.pixels.as_ref().clone())
        .ok_or_else(|| CoreError::ImageLoad {
            image_id: image.id.clone(),
            reason: "pixel buffer does not match dimensions".to_string(),
        })?;

    let mut bytes = std::io::Cursor::new(Vec::new());
    rgb.write_to(&mut bytes, image::ImageFormat::Png)
        .map_err(|e| CoreError::ImageLoad {
            image_id: image.id.clone(),
            reason: format!("PNG encoding failed: {}", e),
        })?;

    Ok(base64::engine::general_purpose::STANDARD.encode(bytes.into_inner()))
}

// =============================================================================
// Tests
// =============================================================================
