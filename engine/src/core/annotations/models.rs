//! Annotation Data Models
//!
//! Objects, frame annotations and the recipe used for batch replay.

use std::fmt;

use serde::Serialize;

use crate::core::{masks::Mask, ImageId, ObjectId, Point, PointSetVersion};

// =============================================================================
// Annotated Object
// =============================================================================

/// One semantic entity being segmented, defined by its accumulated points
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedObject {
    /// Identifier, unique within the frame
    pub id: ObjectId,
    /// Prompt points in insertion order
    pub points: Vec<Point>,
    /// Current mask; absent until segmented or after any point change
    pub mask: Option<Mask>,
    /// Point-set version, bumped on every point mutation
    pub version: PointSetVersion,
}

impl AnnotatedObject {
    /// Creates an empty object
    pub fn new(id: impl Into<String>, version: PointSetVersion) -> Self {
        Self {
            id: id.into(),
            points: Vec::new(),
            mask: None,
            version,
        }
    }

    pub fn has_points(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn positive_count(&self) -> usize {
        self.points.iter().filter(|p| p.label.is_positive()).count()
    }

    pub fn negative_count(&self) -> usize {
        self.points.len() - self.positive_count()
    }
}

// =============================================================================
// Frame Annotation
// =============================================================================

/// Mask freshness of a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameStatus {
    /// No object has any point
    Empty,
    /// At least one object with points has no current mask
    MasksStale,
    /// Every object with points has a current mask
    MasksCurrent,
}

/// The set of objects annotated on exactly one image
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAnnotation {
    /// Image this annotation is bound to
    pub image_id: ImageId,
    /// Objects in insertion order
    pub objects: Vec<AnnotatedObject>,
    /// Object receiving new points
    pub active_object_id: Option<ObjectId>,
}

impl FrameAnnotation {
    /// Creates an empty frame annotation for an image
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            objects: Vec::new(),
            active_object_id: None,
        }
    }

    /// Looks up an object by id
    pub fn object(&self, object_id: &str) -> Option<&AnnotatedObject> {
        self.objects.iter().find(|o| o.id == object_id)
    }

    /// Currently active object
    pub fn active_object(&self) -> Option<&AnnotatedObject> {
        self.active_object_id
            .as_deref()
            .and_then(|id| self.object(id))
    }

    /// Index of the active object in insertion order
    pub fn active_index(&self) -> Option<usize> {
        let active = self.active_object_id.as_deref()?;
        self.objects.iter().position(|o| o.id == active)
    }

    /// Returns true if any object carries at least one point
    pub fn has_annotations(&self) -> bool {
        self.objects.iter().any(AnnotatedObject::has_points)
    }

    /// Derived mask freshness
    pub fn status(&self) -> FrameStatus {
        let mut with_points = self.objects.iter().filter(|o| o.has_points()).peekable();
        if with_points.peek().is_none() {
            return FrameStatus::Empty;
        }
        if with_points.all(|o| o.mask.is_some()) {
            FrameStatus::MasksCurrent
        } else {
            FrameStatus::MasksStale
        }
    }

    /// Point and object counts
    pub fn summary(&self) -> AnnotationSummary {
        AnnotationSummary {
            object_count: self.objects.len(),
            active_index: self.active_index(),
            positive_points: self.objects.iter().map(|o| o.positive_count()).sum(),
            negative_points: self.objects.iter().map(|o| o.negative_count()).sum(),
            masked_objects: self.objects.iter().filter(|o| o.mask.is_some()).count(),
            status: self.status(),
        }
    }
}

/// Summary of a frame's annotation state
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSummary {
    pub object_count: usize,
    /// Zero-based index of the active object
    pub active_index: Option<usize>,
    pub positive_points: usize,
    pub negative_points: usize,
    pub masked_objects: usize,
    pub status: FrameStatus,
}

impl AnnotationSummary {
    pub fn total_points(&self) -> usize {
        self.positive_points + self.negative_points
    }
}

impl fmt::Display for AnnotationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self
            .active_index
            .map(|i| (i + 1).to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "Objects: {}, Current: {}, Total points: {} (+{}, -{})",
            self.object_count,
            current,
            self.total_points(),
            self.positive_points,
            self.negative_points
        )
    }
}

// =============================================================================
// Recipe
// =============================================================================

/// Point layout of one object in a recipe
#[derive(Clone, Debug, PartialEq)]
pub struct RecipeObject {
    pub id: ObjectId,
    pub points: Vec<Point>,
}

/// Point layout of a reference frame, replayed across a batch
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Recipe {
    pub objects: Vec<RecipeObject>,
}

impl Recipe {
    /// Captures every object with at least one point, in insertion order
    pub fn from_frame(frame: &FrameAnnotation) -> Self {
        Self {
            objects: frame
                .objects
                .iter()
                .filter(|o| o.has_points())
                .map(|o| RecipeObject {
                    id: o.id.clone(),
                    points: o.points.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Pads every object's points cyclically to the longest object's count.
    ///
    /// Video predictors take one fixed-shape prompt tensor per frame, so every
    /// object must contribute the same number of points.
    pub fn balanced(&self) -> Self {
        let max_points = self
            .objects
            .iter()
            .map(|o| o.points.len())
            .max()
            .unwrap_or(0);

        Self {
            objects: self
                .objects
                .iter()
                .map(|o| RecipeObject {
                    id: o.id.clone(),
                    points: o.points.iter().cycle().take(max_points).copied().collect(),
                })
                .collect(),
        }
    }

    /// Total number of points across objects
    pub fn point_count(&self) -> usize {
        self.objects.iter().map(|o| o.points.len()).sum()
    }
}
