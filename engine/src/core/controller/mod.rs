//! Annotation Controller
//!
//! Turns user intents ("add point", "new object", "recompute", "process all")
//! into annotation state mutations and segmentation calls.
//!
//! All state operations are synchronous and never wait on the model. The
//! session lock is never held across an `.await`: segmentation runs with the
//! lock released and its result comes back through the version-checked
//! [`AnnotationState::apply_masks`], so edits made while a request is
//! outstanding are never overwritten by an outdated mask.

pub mod batch;
pub mod session;

pub use batch::{
    BatchHandle, BatchItemStatus, BatchProgress, BatchReport, ExportTargets, ImageOutcome,
};
pub use session::SessionPosition;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::core::{
    annotations::{
        AnnotationState, AnnotationStore, AnnotationSummary, ApplyOutcome, FrameAnnotation,
        FrameStatus, Recipe,
    },
    images::{FolderImageSource, ImageFrame, ImageSource},
    segmentation::{run_segmentation, SegmentationProvider, SegmentationRequest},
    settings::AnnotatorSettings,
    CoreError, CoreResult, ObjectId, PointLabel,
};

use batch::{BatchJob, ReferenceFrame, ReferenceSink};
use session::Session;

// =============================================================================
// Guards
// =============================================================================

/// Claims a boolean slot; released on drop
struct FlagGuard {
    flag: Arc<AtomicBool>,
}

impl FlagGuard {
    fn claim(flag: &Arc<AtomicBool>, busy_message: &str) -> CoreResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CoreError::Busy(busy_message.to_string()))?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Annotation Controller
// =============================================================================

/// Intent API consumed by front ends and batch drivers.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct AnnotationController {
    provider: Arc<dyn SegmentationProvider>,
    settings: Arc<AnnotatorSettings>,
    session: Arc<Mutex<Option<Session>>>,
    /// Bumped whenever a session is opened or closed
    epoch: Arc<AtomicU64>,
    /// One permit: a single segmentation call against the resident frame,
    /// whether from `recompute` or from a batch on the reference image
    resident_slot: Arc<Semaphore>,
    batch_running: Arc<AtomicBool>,
    batch_cancel: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl AnnotationController {
    /// Creates a controller with no open session
    pub fn new(provider: Arc<dyn SegmentationProvider>, settings: AnnotatorSettings) -> Self {
        let mut settings = settings;
        settings.normalize();

        Self {
            provider,
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
            resident_slot: Arc::new(Semaphore::new(1)),
            batch_running: Arc::new(AtomicBool::new(false)),
            batch_cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &AnnotatorSettings {
        &self.settings
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Opens a session over an image source, replacing (and flushing) any open one
    pub fn open_session(
        &self,
        images: Arc<dyn ImageSource>,
        store: AnnotationStore,
    ) -> CoreResult<SessionPosition> {
        let mut guard = self.lock_session()?;
        if let Some(previous) = guard.as_mut() {
            previous.flush()?;
        }

        let session = Session::open(images, store)?;
        let position = session.position()?;
        *guard = Some(session);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            total = position.total,
            image_id = %position.image_id,
            "Opened annotation session"
        );
        Ok(position)
    }

    /// Opens a session over an image folder using the configured extensions
    /// and annotation directory
    pub fn open_folder(&self, dir: &Path) -> CoreResult<SessionPosition> {
        let images = FolderImageSource::open_with_extensions(dir, &self.settings.images.extensions)?;
        let store = AnnotationStore::with_dir_name(dir, &self.settings.storage.annotations_dir);
        self.open_session(Arc::new(images), store)
    }

    /// Flushes and tears down the session
    pub fn close_session(&self) -> CoreResult<()> {
        let mut guard = self.lock_session()?;
        if let Some(session) = guard.as_mut() {
            session.flush()?;
            tracing::info!("Closed annotation session");
        }
        *guard = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock_session()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Current cursor position
    pub fn position(&self) -> CoreResult<SessionPosition> {
        self.with_session(|session| session.position())
    }

    /// Writes the resident frame if it has unsaved changes
    pub fn flush(&self) -> CoreResult<bool> {
        self.with_session(|session| session.flush())
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Moves the cursor by `delta`, clamped to the sequence (no wrap).
    ///
    /// The resident frame is flushed first; a persistence error blocks the
    /// move. Returns the new position.
    pub fn navigate(&self, delta: isize) -> CoreResult<SessionPosition> {
        self.with_session(|session| {
            let last = session.images.len().saturating_sub(1) as isize;
            let target = (session.cursor as isize).saturating_add(delta).clamp(0, last) as usize;
            session.move_to(target)?;
            session.position()
        })
    }

    /// Moves the cursor to a specific image
    pub fn jump_to(&self, image_id: &str) -> CoreResult<SessionPosition> {
        self.with_session(|session| {
            let index = session.images.index_of(image_id).ok_or_else(|| {
                CoreError::ValidationError(format!("Image {} is not in this set", image_id))
            })?;
            session.move_to(index)?;
            session.position()
        })
    }

    // =========================================================================
    // Object and Point Intents
    // =========================================================================

    /// Adds a point to the active object, creating one if none is active
    pub fn on_point(&self, x: f32, y: f32, label: PointLabel) -> CoreResult<ObjectId> {
        self.with_state(|state| {
            let extent = state
                .extent()
                .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))?;
            if !extent.contains(x, y) {
                return Err(CoreError::OutOfBounds {
                    x,
                    y,
                    width: extent.width,
                    height: extent.height,
                });
            }

            let object_id = match state.active_object_id() {
                Some(id) => id.to_string(),
                None => state.create_object()?,
            };
            state.add_point(&object_id, x, y, label)?;
            Ok(object_id)
        })
    }

    pub fn new_object(&self) -> CoreResult<ObjectId> {
        self.with_state(|state| state.create_object())
    }

    pub fn set_active(&self, object_id: &str) -> CoreResult<()> {
        self.with_state(|state| state.set_active(object_id))
    }

    pub fn next_object(&self) -> CoreResult<ObjectId> {
        self.with_state(|state| state.next_object())
    }

    pub fn clear_object(&self, object_id: &str) -> CoreResult<()> {
        self.with_state(|state| state.clear_object(object_id))
    }

    pub fn remove_object(&self, object_id: &str) -> CoreResult<()> {
        self.with_state(|state| state.remove_object(object_id))
    }

    pub fn clear_all(&self) -> CoreResult<()> {
        self.with_state(|state| state.clear_all())
    }

    // =========================================================================
    // Read-only Projections
    // =========================================================================

    /// Deep copy of the resident frame
    pub fn snapshot(&self) -> CoreResult<FrameAnnotation> {
        self.with_state(|state| state.snapshot())
    }

    pub fn status(&self) -> CoreResult<FrameStatus> {
        self.with_state(|state| {
            state
                .status()
                .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
        })
    }

    pub fn summary(&self) -> CoreResult<AnnotationSummary> {
        self.with_state(|state| {
            state
                .summary()
                .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
        })
    }

    /// True if any object of the resident frame has points
    pub fn has_annotations(&self) -> bool {
        self.snapshot()
            .map(|frame| frame.has_annotations())
            .unwrap_or(false)
    }

    /// True while the resident frame has changes not yet written
    pub fn has_unsaved_changes(&self) -> bool {
        self.with_state(|state| Ok(state.is_dirty())).unwrap_or(false)
    }

    /// True when a batch could start now
    pub fn is_ready_for_batch(&self) -> bool {
        !self.batch_running.load(Ordering::SeqCst) && self.has_annotations()
    }

    /// True while a segmentation call for the resident frame is outstanding
    pub fn is_recompute_in_flight(&self) -> bool {
        self.resident_slot.available_permits() == 0
    }

    pub fn is_batch_running(&self) -> bool {
        self.batch_running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Segmentation
    // =========================================================================

    /// Segments every object of the resident frame that has points.
    ///
    /// Rejected with `Busy` while another call for the resident frame is
    /// outstanding, including a batch segmenting the same image. On failure
    /// every mask stays as it was. Returns [`ApplyOutcome::Stale`] when the
    /// frame changed while the model was running.
    pub async fn recompute(&self) -> CoreResult<ApplyOutcome> {
        let _in_flight = Arc::clone(&self.resident_slot)
            .try_acquire_owned()
            .map_err(|_| {
                CoreError::Busy("A segmentation request for this frame is already outstanding".to_string())
            })?;

        let epoch = self.epoch.load(Ordering::SeqCst);
        let (frame, cached, images) = self.with_session(|session| {
            Ok((
                session.state.snapshot()?,
                session.image_cache.clone(),
                Arc::clone(&session.images),
            ))
        })?;

        let image = match cached {
            Some(image) => image,
            None => self.decode_resident(images, &frame.image_id).await?,
        };

        let request = SegmentationRequest::from_frame(image, &frame)?;
        let update = match run_segmentation(
            self.provider.as_ref(),
            &request,
            self.settings.segmentation_limits(),
        )
        .await
        {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(image_id = %frame.image_id, "Segmentation failed: {}", e);
                return Err(e);
            }
        };

        let mut guard = self.lock_session()?;
        let session = match guard.as_mut() {
            Some(session) if self.epoch.load(Ordering::SeqCst) == epoch => session,
            _ => return Ok(ApplyOutcome::Stale),
        };
        let outcome = session.state.apply_masks(update)?;
        match outcome {
            ApplyOutcome::Applied(n) => {
                tracing::info!(image_id = %frame.image_id, masks = n, "Masks updated")
            }
            ApplyOutcome::Stale => {
                tracing::debug!(image_id = %frame.image_id, "Discarded outdated masks")
            }
        }
        Ok(outcome)
    }

    /// Runs [`recompute`](Self::recompute) on the background path
    pub fn spawn_recompute(&self) -> JoinHandle<CoreResult<ApplyOutcome>> {
        let controller = self.clone();
        tokio::spawn(async move { controller.recompute().await })
    }

    async fn decode_resident(
        &self,
        images: Arc<dyn ImageSource>,
        image_id: &str,
    ) -> CoreResult<ImageFrame> {
        let id = image_id.to_string();
        let image = tokio::task::spawn_blocking(move || images.get(&id))
            .await
            .map_err(|e| CoreError::Internal(format!("Image decode task failed: {}", e)))??;

        let mut guard = self.lock_session()?;
        if let Some(session) = guard.as_mut() {
            if session.state.image_id() == Some(image_id) {
                session.image_cache = Some(image.clone());
            }
        }
        Ok(image)
    }

    // =========================================================================
    // Batch Processing
    // =========================================================================

    /// Replays the resident frame's point layout over every image and waits
    /// for the result. Progress events go to `progress` when given.
    pub async fn process_all(
        &self,
        progress: Option<mpsc::UnboundedSender<BatchProgress>>,
    ) -> CoreResult<BatchReport> {
        let (job, slot) = self.prepare_batch(progress)?;
        let report = job.run().await;
        drop(slot);
        report
    }

    /// Starts [`process_all`](Self::process_all) on the background path
    pub fn start_batch(&self) -> CoreResult<BatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (job, slot) = self.prepare_batch(Some(tx))?;
        let cancel = Arc::clone(&job.cancel);

        let join = tokio::spawn(async move {
            let report = job.run().await;
            drop(slot);
            report
        });
        Ok(BatchHandle::new(rx, join, cancel))
    }

    /// Requests cooperative cancellation of the running batch.
    ///
    /// Returns false when no batch is running.
    pub fn cancel(&self) -> bool {
        match self.batch_cancel.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(flag) => {
                    flag.store(true, Ordering::SeqCst);
                    tracing::info!("Batch cancellation requested");
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn prepare_batch(
        &self,
        progress: Option<mpsc::UnboundedSender<BatchProgress>>,
    ) -> CoreResult<(Arc<BatchJob>, BatchSlot)> {
        let running = FlagGuard::claim(&self.batch_running, "A batch is already running")?;

        let (images, store, recipe, stamp) = self.with_session(|session| {
            let frame = session.state.snapshot()?;
            let recipe = Recipe::from_frame(&frame);
            if recipe.is_empty() {
                return Err(CoreError::InvalidState(format!(
                    "Reference frame {} has no points to replay",
                    frame.image_id
                )));
            }
            // Batch workers read frames from disk
            session.flush()?;
            Ok((
                Arc::clone(&session.images),
                session.store.clone(),
                recipe,
                session.state.stamp()?,
            ))
        })?;

        let recipe = if self.settings.batch.balance_points {
            recipe.balanced()
        } else {
            recipe
        };

        let root = store
            .annotations_dir()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let exports = ExportTargets {
            masks_dir: self
                .settings
                .batch
                .export_masks
                .then(|| root.join(&self.settings.batch.runs_dir)),
            labels_dir: self
                .settings
                .batch
                .export_labels
                .then(|| root.join(&self.settings.batch.labels_dir)),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let job = Arc::new(BatchJob {
            images,
            store,
            provider: Arc::clone(&self.provider),
            recipe,
            limits: self.settings.segmentation_limits(),
            concurrency: self.settings.batch.concurrency as usize,
            exports,
            cancel: Arc::clone(&cancel),
            progress,
            reference: Some(ReferenceFrame {
                stamp,
                slot: Arc::clone(&self.resident_slot),
                sink: self.reference_sink(),
            }),
        });

        let slot = BatchSlot::new(running, Arc::clone(&self.batch_cancel), cancel)?;
        Ok((job, slot))
    }

    /// Applies reference-image masks to the resident frame if it is unchanged
    fn reference_sink(&self) -> ReferenceSink {
        let session = Arc::clone(&self.session);
        let epoch = Arc::clone(&self.epoch);
        let started_in = epoch.load(Ordering::SeqCst);
        Box::new(move |update| {
            let Ok(mut guard) = session.lock() else {
                return;
            };
            if epoch.load(Ordering::SeqCst) != started_in {
                return;
            }
            if let Some(session) = guard.as_mut() {
                match session.state.apply_masks(update) {
                    Ok(ApplyOutcome::Applied(n)) => {
                        tracing::debug!(masks = n, "Batch masks delivered to resident frame")
                    }
                    Ok(ApplyOutcome::Stale) => {}
                    Err(e) => tracing::warn!("Batch masks not applied: {}", e),
                }
            }
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn lock_session(&self) -> CoreResult<MutexGuard<'_, Option<Session>>> {
        self.session
            .lock()
            .map_err(|_| CoreError::Internal("Session lock poisoned".to_string()))
    }

    fn with_session<T>(&self, op: impl FnOnce(&mut Session) -> CoreResult<T>) -> CoreResult<T> {
        let mut guard = self.lock_session()?;
        let session = guard
            .as_mut()
            .ok_or_else(|| CoreError::InvalidState("No session is open".to_string()))?;
        op(session)
    }

    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut AnnotationState) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.with_session(|session| op(&mut session.state))
    }
}

/// Marks a batch as running until dropped
struct BatchSlot {
    _running: FlagGuard,
    cancel_slot: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl BatchSlot {
    fn new(
        running: FlagGuard,
        cancel_slot: Arc<Mutex<Option<Arc<AtomicBool>>>>,
        cancel: Arc<AtomicBool>,
    ) -> CoreResult<Self> {
        *cancel_slot
            .lock()
            .map_err(|_| CoreError::Internal("Batch lock poisoned".to_string()))? = Some(cancel);
        Ok(Self {
            _running: running,
            cancel_slot,
        })
    }
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.cancel_slot.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segmentation::testing::ScriptedProvider;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) {
        image::RgbImage::new(width, height)
            .save(dir.join(name))
            .unwrap();
    }

    fn open_controller(names: &[&str]) -> (TempDir, AnnotationController, Arc<ScriptedProvider>) {
        let dir = TempDir::new().unwrap();
        for name in names {
            write_png(dir.path(), name, 64, 48);
        }
        let provider = Arc::new(ScriptedProvider::new());
        let controller = AnnotationController::new(provider.clone(), AnnotatorSettings::default());
        controller.open_folder(dir.path()).unwrap();
        (dir, controller, provider)
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    #[test]
    fn test_intents_without_session_are_invalid_state() {
        let controller = AnnotationController::new(
            Arc::new(ScriptedProvider::new()),
            AnnotatorSettings::default(),
        );
        assert!(!controller.is_open());
        assert!(matches!(
            controller.on_point(1.0, 1.0, PointLabel::Positive),
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            controller.navigate(1),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_folder_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let controller = AnnotationController::new(
            Arc::new(ScriptedProvider::new()),
            AnnotatorSettings::default(),
        );
        assert!(matches!(
            controller.open_folder(dir.path()),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_navigate_clamps_without_wrapping() {
        let (_dir, controller, _) = open_controller(&["a.png", "b.png", "c.png"]);

        assert_eq!(controller.navigate(-1).unwrap().index, 0);
        assert_eq!(controller.navigate(5).unwrap().image_id, "c.png");
        assert_eq!(controller.navigate(-1).unwrap().image_id, "b.png");
    }

    #[test]
    fn test_navigate_without_changes_writes_nothing() {
        let (dir, controller, _) = open_controller(&["a.png", "b.png"]);
        controller.navigate(1).unwrap();
        assert!(!dir.path().join("annotations").exists());
    }

    #[test]
    fn test_navigation_round_trip_restores_frame() {
        let (_dir, controller, _) = open_controller(&["a.png", "b.png"]);
        controller.on_point(5.0, 6.0, PointLabel::Positive).unwrap();
        controller.new_object().unwrap();
        controller.on_point(7.0, 8.0, PointLabel::Negative).unwrap();

        controller.navigate(1).unwrap();
        assert!(controller.snapshot().unwrap().objects.is_empty());

        controller.navigate(-1).unwrap();
        let frame = controller.snapshot().unwrap();
        assert_eq!(frame.objects.len(), 2);
        assert_eq!(frame.objects[1].points[0].label, PointLabel::Negative);
        assert_eq!(controller.new_object().unwrap(), "o3");
    }

    #[test]
    fn test_close_session_flushes() {
        let (dir, controller, _) = open_controller(&["a.png"]);
        controller.on_point(5.0, 6.0, PointLabel::Positive).unwrap();
        controller.close_session().unwrap();

        assert!(!controller.is_open());
        assert!(dir.path().join("annotations").join("a.png.json").exists());
    }

    // -------------------------------------------------------------------------
    // Intents
    // -------------------------------------------------------------------------

    #[test]
    fn test_on_point_creates_object_when_none_active() {
        let (_dir, controller, _) = open_controller(&["a.png"]);
        let id = controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
        assert_eq!(id, "o1");

        // Subsequent points go to the same object
        let again = controller.on_point(12.0, 10.0, PointLabel::Negative).unwrap();
        assert_eq!(again, "o1");
        assert_eq!(controller.summary().unwrap().total_points(), 2);
    }

    #[test]
    fn test_on_point_out_of_bounds_creates_nothing() {
        let (_dir, controller, _) = open_controller(&["a.png"]);
        assert!(matches!(
            controller.on_point(64.0, 1.0, PointLabel::Positive),
            Err(CoreError::OutOfBounds { .. })
        ));
        assert!(controller.snapshot().unwrap().objects.is_empty());
    }

    #[test]
    fn test_readiness_for_batch() {
        let (_dir, controller, _) = open_controller(&["a.png"]);
        assert!(!controller.is_ready_for_batch());
        controller.new_object().unwrap();
        assert!(!controller.is_ready_for_batch());
        controller.on_point(1.0, 1.0, PointLabel::Positive).unwrap();
        assert!(controller.is_ready_for_batch());
    }

    // -------------------------------------------------------------------------
    // Recompute
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_recompute_without_points_is_invalid_state() {
        let (_dir, controller, provider) = open_controller(&["a.png"]);
        controller.new_object().unwrap();
        assert!(matches!(
            controller.recompute().await,
            Err(CoreError::InvalidState(_))
        ));
        assert_eq!(provider.calls(), 0);
        assert!(!controller.is_recompute_in_flight());
    }

    #[tokio::test]
    async fn test_spawn_recompute_applies_masks() {
        let (_dir, controller, _) = open_controller(&["a.png"]);
        controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

        let outcome = controller.spawn_recompute().await.unwrap().unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(1));
        assert_eq!(controller.status().unwrap(), FrameStatus::MasksCurrent);
    }

    #[tokio::test]
    async fn test_batch_requires_points() {
        let (_dir, controller, _) = open_controller(&["a.png", "b.png"]);
        assert!(matches!(
            controller.process_all(None).await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(!controller.is_batch_running());
        assert!(!controller.cancel());
    }
}
