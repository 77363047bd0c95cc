//! Batch Processing
//!
//! Replays a recipe (the point layout of a reference frame) across every image
//! of a sequence: load or create the frame, apply the recipe, segment, save,
//! export. Each image succeeds or fails on its own; a failure never stops the
//! batch. Cancellation is cooperative and checked before each image starts,
//! so an in-flight segmentation always completes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::core::{
    annotations::{
        export::{export_mask_pngs, export_yolo_labels},
        AnnotationState, AnnotationStore, ApplyOutcome, FrameAnnotation, MaskUpdate, Recipe,
        VersionStamp,
    },
    images::ImageSource,
    segmentation::{run_segmentation, SegmentationLimits, SegmentationProvider, SegmentationRequest},
    CoreError, CoreResult, ImageId,
};

// =============================================================================
// Progress and Report
// =============================================================================

/// Status of one image in a batch
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum BatchItemStatus {
    Running,
    Succeeded,
    Failed { reason: String },
}

/// Progress event emitted for every image
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Zero-based position of the image in the sequence
    pub current_index: usize,
    pub total: usize,
    pub image_id: ImageId,
    pub status: BatchItemStatus,
}

/// Final result for one attempted image
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutcome {
    pub index: usize,
    pub image_id: ImageId,
    /// Number of masks written on success
    pub masks: usize,
    pub error: Option<String>,
}

impl ImageOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole batch
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total: usize,
    /// Attempted images, in sequence order
    pub outcomes: Vec<ImageOutcome>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Images never started because the batch was cancelled
    pub fn skipped(&self) -> usize {
        self.total - self.outcomes.len()
    }

    /// `Err(Cancelled)` if the run stopped before every image started
    pub fn completed(&self) -> CoreResult<()> {
        if self.cancelled {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }
}

/// Handle to a batch running on the background path
pub struct BatchHandle {
    /// Per-image progress events; closed when the batch ends
    pub progress: mpsc::UnboundedReceiver<BatchProgress>,
    /// Resolves to the final report
    pub join: JoinHandle<CoreResult<BatchReport>>,
    cancel: Arc<AtomicBool>,
}

impl BatchHandle {
    pub(crate) fn new(
        progress: mpsc::UnboundedReceiver<BatchProgress>,
        join: JoinHandle<CoreResult<BatchReport>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            progress,
            join,
            cancel,
        }
    }

    /// Requests cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits for the batch to finish
    pub async fn wait(self) -> CoreResult<BatchReport> {
        self.join
            .await
            .map_err(|e| CoreError::Internal(format!("Batch task failed: {}", e)))?
    }
}

// =============================================================================
// Batch Job
// =============================================================================

/// Output directories for optional exports
#[derive(Clone, Debug, Default)]
pub struct ExportTargets {
    pub masks_dir: Option<PathBuf>,
    pub labels_dir: Option<PathBuf>,
}

/// Delivers masks computed for the reference image back to the resident frame
pub(crate) type ReferenceSink = Box<dyn Fn(MaskUpdate) + Send + Sync>;

/// The resident image a batch started from
pub(crate) struct ReferenceFrame {
    /// Point-set versions when the batch started
    pub(crate) stamp: VersionStamp,
    /// Resident-frame segmentation slot shared with interactive recomputes
    pub(crate) slot: Arc<Semaphore>,
    pub(crate) sink: ReferenceSink,
}

/// Everything one batch run needs, shared by its per-image tasks
pub(crate) struct BatchJob {
    pub(crate) images: Arc<dyn ImageSource>,
    pub(crate) store: AnnotationStore,
    pub(crate) provider: Arc<dyn SegmentationProvider>,
    pub(crate) recipe: Recipe,
    pub(crate) limits: SegmentationLimits,
    pub(crate) concurrency: usize,
    pub(crate) exports: ExportTargets,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) progress: Option<mpsc::UnboundedSender<BatchProgress>>,
    pub(crate) reference: Option<ReferenceFrame>,
}

impl BatchJob {
    /// Runs every image, at most `concurrency` at a time
    pub(crate) async fn run(self: Arc<Self>) -> CoreResult<BatchReport> {
        let image_ids = self.images.list();
        let total = image_ids.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));

        tracing::info!(
            total = total,
            objects = self.recipe.objects.len(),
            points = self.recipe.point_count(),
            concurrency = self.concurrency,
            "Starting batch"
        );

        let mut tasks = JoinSet::new();
        let mut cancelled = false;
        for (index, image_id) in image_ids.into_iter().enumerate() {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CoreError::Internal(format!("Batch semaphore closed: {}", e)))?;

            // Cancellation may arrive while waiting for a slot
            if self.is_cancelled() {
                cancelled = true;
                break;
            }

            let job = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                job.process_image(index, total, image_id).await
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!("Batch image task panicked: {}", e),
            }
        }
        outcomes.sort_by_key(|o| o.index);

        let report = BatchReport {
            total,
            outcomes,
            cancelled,
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            cancelled = report.cancelled,
            "Batch finished"
        );
        Ok(report)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn emit(&self, index: usize, total: usize, image_id: &str, status: BatchItemStatus) {
        if let Some(tx) = &self.progress {
            // Receiver may have been dropped; progress is advisory
            let _ = tx.send(BatchProgress {
                current_index: index,
                total,
                image_id: image_id.to_string(),
                status,
            });
        }
    }

    async fn process_image(&self, index: usize, total: usize, image_id: ImageId) -> ImageOutcome {
        self.emit(index, total, &image_id, BatchItemStatus::Running);

        match self.segment_and_save(&image_id).await {
            Ok(masks) => {
                tracing::debug!(image_id = %image_id, masks = masks, "Batch image done");
                self.emit(index, total, &image_id, BatchItemStatus::Succeeded);
                ImageOutcome {
                    index,
                    image_id,
                    masks,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(image_id = %image_id, "Batch image failed: {}", e);
                let reason = e.to_string();
                self.emit(
                    index,
                    total,
                    &image_id,
                    BatchItemStatus::Failed {
                        reason: reason.clone(),
                    },
                );
                ImageOutcome {
                    index,
                    image_id,
                    masks: 0,
                    error: Some(reason),
                }
            }
        }
    }

    async fn segment_and_save(&self, image_id: &str) -> CoreResult<usize> {
        let images = Arc::clone(&self.images);
        let id = image_id.to_string();
        let image = tokio::task::spawn_blocking(move || images.get(&id))
            .await
            .map_err(|e| CoreError::Internal(format!("Image decode task failed: {}", e)))??;

        let frame = self
            .store
            .load(image_id)?
            .unwrap_or_else(|| FrameAnnotation::new(image_id));

        let mut state = AnnotationState::new();
        state.bind(frame, image.extent());
        state.apply_recipe(&self.recipe)?;

        let request = SegmentationRequest::from_frame(image, &state.snapshot()?)?;

        let reference = self
            .reference
            .as_ref()
            .filter(|r| r.stamp.image_id == image_id);
        // Waits out an interactive recompute of the same frame
        let resident_permit = match reference {
            Some(r) => Some(Arc::clone(&r.slot).acquire_owned().await.map_err(|e| {
                CoreError::Internal(format!("Resident segmentation slot closed: {}", e))
            })?),
            None => None,
        };

        let update = run_segmentation(self.provider.as_ref(), &request, self.limits).await?;
        if let Some(r) = reference {
            (r.sink)(MaskUpdate {
                stamp: r.stamp.clone(),
                masks: update.masks.clone(),
            });
        }
        drop(resident_permit);

        let masks = match state.apply_masks(update)? {
            ApplyOutcome::Applied(n) => n,
            ApplyOutcome::Stale => {
                return Err(CoreError::Internal(format!(
                    "Batch frame for {} changed during segmentation",
                    image_id
                )))
            }
        };

        let frame = state.snapshot()?;
        self.store.save(image_id, &frame)?;

        if let Some(dir) = &self.exports.masks_dir {
            export_mask_pngs(&frame, dir)?;
        }
        if let Some(dir) = &self.exports.labels_dir {
            export_yolo_labels(&frame, dir)?;
        }

        Ok(masks)
    }
}
