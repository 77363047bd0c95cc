//! Annotation State
//!
//! The authoritative in-memory model of the resident frame: which objects
//! exist, the points that define each one, their current masks and which
//! object is active. Every mutation goes through this type so the frame
//! invariants hold at every observable boundary:
//!
//! - object ids are unique within the frame
//! - an object with no points has no mask
//! - if there are objects, exactly one is active
//! - a mask is never older than its object's point set
//!
//! No I/O happens here.

use crate::core::{
    masks::Mask, CoreError, CoreResult, ImageExtent, ImageId, ObjectId, Point, PointLabel,
    PointSetVersion,
};

use super::{AnnotatedObject, AnnotationSummary, FrameAnnotation, FrameStatus, Recipe};

/// Prefix of generated object ids
const OBJECT_ID_PREFIX: &str = "o";

// =============================================================================
// Version Stamps
// =============================================================================

/// Point-set versions captured when a segmentation request is built
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionStamp {
    pub image_id: ImageId,
    /// `(object_id, version)` for every object in the request
    pub versions: Vec<(ObjectId, PointSetVersion)>,
}

impl VersionStamp {
    pub fn version_of(&self, object_id: &str) -> Option<PointSetVersion> {
        self.versions
            .iter()
            .find(|(id, _)| id == object_id)
            .map(|(_, v)| *v)
    }
}

/// Masks produced for a stamped request
#[derive(Clone, Debug)]
pub struct MaskUpdate {
    pub stamp: VersionStamp,
    pub masks: Vec<(ObjectId, Mask)>,
}

/// Result of [`AnnotationState::apply_masks`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// All masks were applied
    Applied(usize),
    /// The frame changed since the request was built; nothing was applied
    Stale,
}

// =============================================================================
// Annotation State
// =============================================================================

/// Mutable annotation model for one resident frame
#[derive(Debug, Default)]
pub struct AnnotationState {
    frame: Option<FrameAnnotation>,
    extent: Option<ImageExtent>,
    /// Version clock; never reset so stamps from earlier frames can't match
    clock: PointSetVersion,
    next_object_seq: u64,
    dirty: bool,
}

impl AnnotationState {
    /// Creates a state with no resident frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `frame` resident for an image of the given extent.
    ///
    /// Loaded objects get fresh versions; the frame starts clean.
    pub fn bind(&mut self, mut frame: FrameAnnotation, extent: ImageExtent) {
        for object in &mut frame.objects {
            object.version = self.tick();
        }

        if frame.objects.is_empty() {
            frame.active_object_id = None;
        } else if frame.active_index().is_none() {
            frame.active_object_id = frame.objects.first().map(|o| o.id.clone());
        }

        self.next_object_seq = next_sequence_after(&frame.objects);
        self.frame = Some(frame);
        self.extent = Some(extent);
        self.dirty = false;
    }

    /// Releases the resident frame
    pub fn unbind(&mut self) -> Option<FrameAnnotation> {
        self.extent = None;
        self.dirty = false;
        self.frame.take()
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Image of the resident frame
    pub fn image_id(&self) -> Option<&str> {
        self.frame.as_ref().map(|f| f.image_id.as_str())
    }

    pub fn extent(&self) -> Option<ImageExtent> {
        self.extent
    }

    /// True when the resident frame has changes not yet persisted
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Read-only view of the resident frame
    pub fn frame(&self) -> Option<&FrameAnnotation> {
        self.frame.as_ref()
    }

    pub fn active_object_id(&self) -> Option<&str> {
        self.frame
            .as_ref()
            .and_then(|f| f.active_object_id.as_deref())
    }

    pub fn status(&self) -> Option<FrameStatus> {
        self.frame.as_ref().map(FrameAnnotation::status)
    }

    pub fn summary(&self) -> Option<AnnotationSummary> {
        self.frame.as_ref().map(FrameAnnotation::summary)
    }

    // =========================================================================
    // Object Operations
    // =========================================================================

    /// Appends a new empty object and makes it active
    pub fn create_object(&mut self) -> CoreResult<ObjectId> {
        let version = self.tick();
        let seq = self.next_object_seq.max(1);
        let frame = self.resident_mut()?;

        let id = format!("{}{}", OBJECT_ID_PREFIX, seq);
        frame.objects.push(AnnotatedObject::new(id.clone(), version));
        frame.active_object_id = Some(id.clone());

        self.next_object_seq = seq + 1;
        self.dirty = true;
        tracing::debug!(object_id = %id, "Created object");
        Ok(id)
    }

    /// Appends a point to an object and invalidates its mask
    pub fn add_point(
        &mut self,
        object_id: &str,
        x: f32,
        y: f32,
        label: PointLabel,
    ) -> CoreResult<()> {
        let extent = self.require_extent()?;
        if !extent.contains(x, y) {
            return Err(CoreError::OutOfBounds {
                x,
                y,
                width: extent.width,
                height: extent.height,
            });
        }

        let version = self.tick();
        let object = self.object_mut(object_id)?;
        object.points.push(Point::new(x, y, label));
        object.mask = None;
        object.version = version;

        self.dirty = true;
        Ok(())
    }

    /// Makes an object active
    pub fn set_active(&mut self, object_id: &str) -> CoreResult<()> {
        let frame = self.resident_mut()?;
        if frame.object(object_id).is_none() {
            return Err(CoreError::UnknownObject(object_id.to_string()));
        }
        frame.active_object_id = Some(object_id.to_string());
        Ok(())
    }

    /// Activates the next object in insertion order, wrapping to the first
    pub fn next_object(&mut self) -> CoreResult<ObjectId> {
        let frame = self.resident_mut()?;
        if frame.objects.is_empty() {
            return Err(CoreError::InvalidState(
                "No objects to switch between".to_string(),
            ));
        }

        let next = match frame.active_index() {
            Some(i) => (i + 1) % frame.objects.len(),
            None => 0,
        };
        let id = frame.objects[next].id.clone();
        frame.active_object_id = Some(id.clone());
        Ok(id)
    }

    /// Removes all points and the mask of one object
    pub fn clear_object(&mut self, object_id: &str) -> CoreResult<()> {
        let version = self.tick();
        let object = self.object_mut(object_id)?;
        object.points.clear();
        object.mask = None;
        object.version = version;

        self.dirty = true;
        Ok(())
    }

    /// Destroys an object.
    ///
    /// If it was active, the object now at the same position (or the new last
    /// one) becomes active.
    pub fn remove_object(&mut self, object_id: &str) -> CoreResult<()> {
        let frame = self.resident_mut()?;
        let index = frame
            .objects
            .iter()
            .position(|o| o.id == object_id)
            .ok_or_else(|| CoreError::UnknownObject(object_id.to_string()))?;

        frame.objects.remove(index);
        if frame.active_object_id.as_deref() == Some(object_id) {
            frame.active_object_id = if frame.objects.is_empty() {
                None
            } else {
                let next = index.min(frame.objects.len() - 1);
                Some(frame.objects[next].id.clone())
            };
        }

        self.dirty = true;
        tracing::debug!(object_id = %object_id, "Removed object");
        Ok(())
    }

    /// Removes every object
    pub fn clear_all(&mut self) -> CoreResult<()> {
        let frame = self.resident_mut()?;
        frame.objects.clear();
        frame.active_object_id = None;

        self.next_object_seq = 1;
        self.dirty = true;
        Ok(())
    }

    /// Replaces the frame's objects with a recipe's point layout.
    ///
    /// All recipe points are checked against the image bounds first; on error
    /// the frame is left as it was.
    pub fn apply_recipe(&mut self, recipe: &Recipe) -> CoreResult<()> {
        let extent = self.require_extent()?;
        for point in recipe.objects.iter().flat_map(|o| o.points.iter()) {
            if !extent.contains(point.x, point.y) {
                return Err(CoreError::OutOfBounds {
                    x: point.x,
                    y: point.y,
                    width: extent.width,
                    height: extent.height,
                });
            }
        }

        let mut objects = Vec::with_capacity(recipe.objects.len());
        for recipe_object in &recipe.objects {
            let mut object = AnnotatedObject::new(recipe_object.id.clone(), self.tick());
            object.points = recipe_object.points.clone();
            objects.push(object);
        }

        let frame = self.resident_mut()?;
        frame.active_object_id = objects.first().map(|o| o.id.clone());
        frame.objects = objects;

        self.next_object_seq = next_sequence_after(&self.resident()?.objects);
        self.dirty = true;
        Ok(())
    }

    // =========================================================================
    // Masks
    // =========================================================================

    /// Captures the versions of every object that has points
    pub fn stamp(&self) -> CoreResult<VersionStamp> {
        let frame = self.resident()?;
        Ok(VersionStamp {
            image_id: frame.image_id.clone(),
            versions: frame
                .objects
                .iter()
                .filter(|o| o.has_points())
                .map(|o| (o.id.clone(), o.version))
                .collect(),
        })
    }

    /// Applies masks from a segmentation result, all or nothing.
    ///
    /// If the frame moved on since `update.stamp` was taken (another image,
    /// a removed object or changed points) nothing is applied and
    /// [`ApplyOutcome::Stale`] is returned.
    pub fn apply_masks(&mut self, update: MaskUpdate) -> CoreResult<ApplyOutcome> {
        let extent = self.require_extent()?;
        let frame = self.resident()?;

        if frame.image_id != update.stamp.image_id {
            return Ok(ApplyOutcome::Stale);
        }

        for (object_id, mask) in &update.masks {
            let Some(expected) = update.stamp.version_of(object_id) else {
                return Err(CoreError::ValidationError(format!(
                    "Mask for object {} was not part of the request",
                    object_id
                )));
            };
            match frame.object(object_id) {
                Some(object) if object.version == expected && object.has_points() => {}
                _ => return Ok(ApplyOutcome::Stale),
            }
            if mask.extent() != extent {
                return Err(CoreError::ValidationError(format!(
                    "Mask for object {} is {}x{}, image is {}x{}",
                    object_id,
                    mask.width(),
                    mask.height(),
                    extent.width,
                    extent.height
                )));
            }
        }

        let count = update.masks.len();
        let frame = self.resident_mut()?;
        for (object_id, mask) in update.masks {
            if let Some(object) = frame.objects.iter_mut().find(|o| o.id == object_id) {
                object.mask = Some(mask);
            }
        }

        self.dirty = true;
        Ok(ApplyOutcome::Applied(count))
    }

    /// Deep copy of the resident frame
    pub fn snapshot(&self) -> CoreResult<FrameAnnotation> {
        self.resident().cloned()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn tick(&mut self) -> PointSetVersion {
        self.clock += 1;
        self.clock
    }

    fn resident(&self) -> CoreResult<&FrameAnnotation> {
        self.frame
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
    }

    fn resident_mut(&mut self) -> CoreResult<&mut FrameAnnotation> {
        self.frame
            .as_mut()
            .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
    }

    fn require_extent(&self) -> CoreResult<ImageExtent> {
        self.extent
            .ok_or_else(|| CoreError::InvalidState("No frame is loaded".to_string()))
    }

    fn object_mut(&mut self, object_id: &str) -> CoreResult<&mut AnnotatedObject> {
        self.resident_mut()?
            .objects
            .iter_mut()
            .find(|o| o.id == object_id)
            .ok_or_else(|| CoreError::UnknownObject(object_id.to_string()))
    }
}

/// Sequence number for the next generated id, past any `o<N>` already in use
fn next_sequence_after(objects: &[AnnotatedObject]) -> u64 {
    objects
        .iter()
        .filter_map(|o| o.id.strip_prefix(OBJECT_ID_PREFIX))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}
