//! Annotation Session
//!
//! The image sequence, a cursor into it and the resident frame annotation.
//! The resident frame's image always equals the image at the cursor.

use std::sync::Arc;

use serde::Serialize;

use crate::core::{
    annotations::{AnnotationState, AnnotationStore, FrameAnnotation},
    images::{ImageFrame, ImageSource},
    CoreError, CoreResult, ImageExtent, ImageId,
};

/// Where the session cursor is
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPosition {
    pub index: usize,
    pub total: usize,
    pub image_id: ImageId,
}

/// Explicitly owned session; created on folder load, torn down on close
pub(crate) struct Session {
    pub(crate) images: Arc<dyn ImageSource>,
    pub(crate) store: AnnotationStore,
    pub(crate) cursor: usize,
    pub(crate) state: AnnotationState,
    /// Decoded pixels of the resident image, filled on first segmentation
    pub(crate) image_cache: Option<ImageFrame>,
}

impl Session {
    /// Opens a session positioned on the first image
    pub(crate) fn open(images: Arc<dyn ImageSource>, store: AnnotationStore) -> CoreResult<Self> {
        if images.is_empty() {
            return Err(CoreError::InvalidState(
                "Image set contains no images".to_string(),
            ));
        }

        let mut session = Self {
            images,
            store,
            cursor: 0,
            state: AnnotationState::new(),
            image_cache: None,
        };
        let (frame, extent) = session.load_frame(0)?;
        session.state.bind(frame, extent);
        Ok(session)
    }

    pub(crate) fn image_id(&self) -> CoreResult<ImageId> {
        self.state
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
    }

    pub(crate) fn position(&self) -> CoreResult<SessionPosition> {
        Ok(SessionPosition {
            index: self.cursor,
            total: self.images.len(),
            image_id: self.image_id()?,
        })
    }

    /// Writes the resident frame if it has unsaved changes; returns whether it wrote
    pub(crate) fn flush(&mut self) -> CoreResult<bool> {
        if !self.state.is_dirty() {
            return Ok(false);
        }

        let frame = self.state.snapshot()?;
        self.store.save(&frame.image_id, &frame)?;
        self.state.mark_clean();
        tracing::debug!(image_id = %frame.image_id, "Flushed frame");
        Ok(true)
    }

    /// Flushes the resident frame, then makes the frame at `index` resident.
    ///
    /// On any error the session stays on the current image.
    pub(crate) fn move_to(&mut self, index: usize) -> CoreResult<()> {
        if index >= self.images.len() {
            return Err(CoreError::ValidationError(format!(
                "Image index {} out of range (0..{})",
                index,
                self.images.len()
            )));
        }
        if index == self.cursor && self.state.is_resident() {
            return Ok(());
        }

        self.flush()?;
        let (frame, extent) = self.load_frame(index)?;

        self.state.unbind();
        self.state.bind(frame, extent);
        self.cursor = index;
        self.image_cache = None;

        tracing::info!(
            index = index,
            image_id = %self.image_id()?,
            "Navigated to image"
        );
        Ok(())
    }

    /// Loaded (or new empty) annotation and extent for the image at `index`
    pub(crate) fn load_frame(&self, index: usize) -> CoreResult<(FrameAnnotation, ImageExtent)> {
        let image_id = self
            .images
            .list()
            .into_iter()
            .nth(index)
            .ok_or_else(|| CoreError::ValidationError(format!("No image at index {}", index)))?;

        let extent = self.images.dimensions(&image_id)?;
        let frame = self
            .store
            .load(&image_id)?
            .unwrap_or_else(|| FrameAnnotation::new(image_id.clone()));

        if let Some(object) = frame.objects.iter().find(|o| {
            o.mask
                .as_ref()
                .is_some_and(|m| m.extent() != extent)
        }) {
            return Err(CoreError::PersistenceError(format!(
                "Stored mask for {} in {} does not match the {}x{} image",
                object.id, image_id, extent.width, extent.height
            )));
        }

        Ok((frame, extent))
    }
}
