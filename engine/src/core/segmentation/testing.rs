//! In-process provider for tests.
//!
//! Produces deterministic masks (a disc around every positive point, minus a
//! disc around every negative point) and lets tests inject failures, delays
//! and gates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::core::{masks::Mask, CoreError, CoreResult, ImageId, Point};

use super::{ObjectMask, SegmentationProvider, SegmentationRequest, SegmentationResponse};

/// Radius of the disc painted around each point
const DISC_RADIUS: f32 = 3.0;

#[derive(Default)]
pub struct ScriptedProvider {
    failing: Mutex<HashSet<ImageId>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    score: Option<f32>,
    calls: AtomicUsize,
    seen: Mutex<Vec<ImageId>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every call waits for one permit on `gate`
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    /// Makes every call for `image_id` fail
    pub fn fail_image(&self, image_id: &str) {
        self.failing.lock().unwrap().insert(image_id.to_string());
    }

    pub fn recover_image(&self, image_id: &str) {
        self.failing.lock().unwrap().remove(image_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Image ids in call order
    pub fn seen(&self) -> Vec<ImageId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn segment(&self, request: &SegmentationRequest) -> CoreResult<SegmentationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.image.id.clone());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&request.image.id) {
            return Err(CoreError::SegmentationFailed(format!(
                "scripted failure for {}",
                request.image.id
            )));
        }

        let (width, height) = (request.image.width, request.image.height);
        let masks = request
            .objects
            .iter()
            .enumerate()
            .map(|(i, prompt)| {
                let mut pixels = vec![false; width as usize * height as usize];
                for y in 0..height {
                    for x in 0..width {
                        let (px, py) = (x as f32, y as f32);
                        let near = |p: &Point| {
                            (p.x - px).powi(2) + (p.y - py).powi(2) <= DISC_RADIUS * DISC_RADIUS
                        };
                        let inside = prompt
                            .points
                            .iter()
                            .filter(|p| p.label.is_positive())
                            .any(|p| near(p));
                        let excluded = prompt
                            .points
                            .iter()
                            .filter(|p| !p.label.is_positive())
                            .any(|p| near(p));
                        pixels[(y * width + x) as usize] = inside && !excluded;
                    }
                }
                let score = self.score.unwrap_or(0.9 - i as f32 * 0.01);
                Mask::from_binary(width, height, &pixels, score).map(|mask| ObjectMask {
                    object_id: prompt.object_id.clone(),
                    mask,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(SegmentationResponse {
            masks,
            inference_ms: Some(1),
        })
    }

    async fn health_check(&self) -> CoreResult<()> {
        Ok(())
    }
}
