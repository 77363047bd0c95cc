//! Annotation Store
//!
//! Manages per-image annotation files.
//! Storage: `{images_dir}/{annotations_dir_name}/{image_id}.json`

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    fs::{atomic_write_json_pretty, validate_path_id_component},
    masks::EncodedMask,
    CoreError, CoreResult, ImageId, ObjectId, Point,
};

use super::{AnnotatedObject, FrameAnnotation};

// =============================================================================
// Constants
// =============================================================================

/// Default directory name for annotations within the image folder
pub const ANNOTATIONS_DIR_NAME: &str = "annotations";

// =============================================================================
// Records
// =============================================================================

/// On-disk form of one object
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub object_id: ObjectId,
    pub points: Vec<Point>,
    #[serde(default)]
    pub mask: Option<EncodedMask>,
}

/// On-disk form of one frame annotation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    pub image_id: ImageId,
    pub objects: Vec<ObjectRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_object_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl FrameRecord {
    /// Captures a frame for writing
    pub fn from_frame(frame: &FrameAnnotation) -> Self {
        Self {
            image_id: frame.image_id.clone(),
            objects: frame
                .objects
                .iter()
                .map(|o| ObjectRecord {
                    object_id: o.id.clone(),
                    points: o.points.clone(),
                    mask: o.mask.as_ref().map(|m| m.encode()),
                })
                .collect(),
            active_object_id: frame.active_object_id.clone(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Rebuilds the frame, decoding masks.
    ///
    /// Masks on objects without points are dropped; they can't be current.
    pub fn into_frame(self) -> CoreResult<FrameAnnotation> {
        let mut objects: Vec<AnnotatedObject> = Vec::with_capacity(self.objects.len());
        for record in self.objects {
            if objects.iter().any(|o| o.id == record.object_id) {
                return Err(CoreError::PersistenceError(format!(
                    "Duplicate object id {} in annotation for {}",
                    record.object_id, self.image_id
                )));
            }

            let mask = match record.mask {
                Some(encoded) if !record.points.is_empty() => Some(encoded.decode().map_err(|e| {
                    CoreError::persistence(
                        format!("Invalid mask for {} in {}", record.object_id, self.image_id),
                        e,
                    )
                })?),
                _ => None,
            };

            let mut object = AnnotatedObject::new(record.object_id, 0);
            object.points = record.points;
            object.mask = mask;
            objects.push(object);
        }

        let active_object_id = self
            .active_object_id
            .filter(|id| objects.iter().any(|o| &o.id == id))
            .or_else(|| objects.first().map(|o| o.id.clone()));

        Ok(FrameAnnotation {
            image_id: self.image_id,
            objects,
            active_object_id,
        })
    }
}

// =============================================================================
// Annotation Store
// =============================================================================

/// Manages per-image annotation files
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    /// Base directory for annotations
    annotations_dir: PathBuf,
}

impl AnnotationStore {
    /// Creates a store inside an image folder using the default directory name
    pub fn new(images_dir: &Path) -> Self {
        Self::with_dir_name(images_dir, ANNOTATIONS_DIR_NAME)
    }

    /// Creates a store inside an image folder with a custom directory name
    pub fn with_dir_name(images_dir: &Path, dir_name: &str) -> Self {
        Self {
            annotations_dir: images_dir.join(dir_name),
        }
    }

    /// Creates the store from an existing annotations directory
    pub fn from_dir(annotations_dir: PathBuf) -> Self {
        Self { annotations_dir }
    }

    /// Returns the annotations directory path
    pub fn annotations_dir(&self) -> &Path {
        &self.annotations_dir
    }

    /// Ensures the annotations directory exists
    pub fn ensure_dir(&self) -> CoreResult<()> {
        if !self.annotations_dir.exists() {
            fs::create_dir_all(&self.annotations_dir).map_err(|e| {
                CoreError::persistence(
                    format!(
                        "Failed to create annotations directory {}",
                        self.annotations_dir.display()
                    ),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Returns the file path for an image's annotation
    pub fn annotation_path(&self, image_id: &str) -> CoreResult<PathBuf> {
        validate_path_id_component(image_id, "imageId").map_err(CoreError::PersistenceError)?;
        Ok(self.annotations_dir.join(format!("{}.json", image_id)))
    }

    /// Loads the annotation for an image; `None` if it was never annotated
    pub fn load(&self, image_id: &str) -> CoreResult<Option<FrameAnnotation>> {
        let path = self.annotation_path(image_id)?;

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            CoreError::persistence(
                format!("Failed to read annotation file {}", path.display()),
                e,
            )
        })?;

        let record: FrameRecord = serde_json::from_str(&content).map_err(|e| {
            CoreError::persistence(
                format!("Failed to parse annotation file {}", path.display()),
                e,
            )
        })?;

        if record.image_id != image_id {
            return Err(CoreError::PersistenceError(format!(
                "Annotation file {} belongs to {}",
                path.display(),
                record.image_id
            )));
        }

        record.into_frame().map(Some)
    }

    /// Saves the annotation for an image (atomic write)
    pub fn save(&self, image_id: &str, frame: &FrameAnnotation) -> CoreResult<()> {
        if frame.image_id != image_id {
            return Err(CoreError::InvalidState(format!(
                "Frame for {} cannot be saved as {}",
                frame.image_id, image_id
            )));
        }

        let path = self.annotation_path(image_id)?;
        self.ensure_dir()?;

        atomic_write_json_pretty(&path, &FrameRecord::from_frame(frame)).map_err(|e| {
            CoreError::persistence(
                format!("Failed to write annotation file {}", path.display()),
                e,
            )
        })?;

        tracing::debug!(
            image_id = %image_id,
            objects = frame.objects.len(),
            "Saved annotation"
        );
        Ok(())
    }

    /// Deletes the annotation for an image
    pub fn delete(&self, image_id: &str) -> CoreResult<()> {
        let path = self.annotation_path(image_id)?;

        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                CoreError::persistence(
                    format!("Failed to delete annotation file {}", path.display()),
                    e,
                )
            })?;
        }

        Ok(())
    }

    /// Checks if an annotation exists for an image
    pub fn exists(&self, image_id: &str) -> bool {
        self.annotation_path(image_id)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Lists all annotated image ids
    pub fn list_annotated(&self) -> CoreResult<Vec<ImageId>> {
        if !self.annotations_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.annotations_dir).map_err(|e| {
            CoreError::persistence(
                format!(
                    "Failed to read annotations directory {}",
                    self.annotations_dir.display()
                ),
                e,
            )
        })?;

        let mut image_ids = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| CoreError::persistence("Failed to read directory entry", e))?;

            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    // Skip temp files
                    if !name.starts_with('.') {
                        image_ids.push(name.to_string());
                    }
                }
            }
        }

        image_ids.sort();
        Ok(image_ids)
    }

    /// Clears all annotations
    pub fn clear_all(&self) -> CoreResult<()> {
        for image_id in self.list_annotated()? {
            self.delete(&image_id)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
