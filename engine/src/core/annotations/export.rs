//! Annotation Exports
//!
//! Writes segmentation results in formats consumed outside the annotator:
//! per-object grayscale mask PNGs and YOLO detection label files.

use std::path::{Path, PathBuf};

use crate::core::{
    fs::{atomic_write_bytes, validate_path_id_component},
    masks::MEMBERSHIP_THRESHOLD,
    CoreError, CoreResult,
};

use super::FrameAnnotation;

/// Image id without its extension (`frame_01.png` -> `frame_01`)
pub fn image_stem(image_id: &str) -> &str {
    Path::new(image_id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(image_id)
}

// =============================================================================
// Mask PNGs
// =============================================================================

/// Writes one binary grayscale PNG per masked object to
/// `{dir}/{stem}_{object_id}.png`. Returns the written paths.
pub fn export_mask_pngs(frame: &FrameAnnotation, dir: &Path) -> CoreResult<Vec<PathBuf>> {
    validate_path_id_component(&frame.image_id, "imageId").map_err(CoreError::ValidationError)?;
    let stem = image_stem(&frame.image_id);

    let mut written = Vec::new();
    for object in &frame.objects {
        let Some(mask) = &object.mask else {
            continue;
        };

        let pixels: Vec<u8> = mask
            .data()
            .iter()
            .map(|&v| if v >= MEMBERSHIP_THRESHOLD { 255 } else { 0 })
            .collect();
        let gray = image::GrayImage::from_raw(mask.width(), mask.height(), pixels).ok_or_else(
            || CoreError::Internal(format!("Mask buffer for {} has wrong length", object.id)),
        )?;

        let mut bytes = std::io::Cursor::new(Vec::new());
        gray.write_to(&mut bytes, image::ImageFormat::Png)
            .map_err(|e| CoreError::persistence(format!("Failed to encode mask {}", object.id), e))?;

        let path = dir.join(format!("{}_{}.png", stem, object.id));
        atomic_write_bytes(&path, bytes.get_ref())
            .map_err(|e| CoreError::persistence(format!("Failed to write {}", path.display()), e))?;
        written.push(path);
    }

    tracing::debug!(
        image_id = %frame.image_id,
        count = written.len(),
        "Exported mask images"
    );
    Ok(written)
}

// =============================================================================
// YOLO Labels
// =============================================================================

/// Formats YOLO detection lines (`class cx cy w h`, normalized to `[0, 1]`).
///
/// The class is the object's insertion index; objects without a mask or with
/// an empty mask are skipped.
pub fn yolo_label_lines(frame: &FrameAnnotation) -> Vec<String> {
    frame
        .objects
        .iter()
        .enumerate()
        .filter_map(|(class, object)| {
            let mask = object.mask.as_ref()?;
            let bounds = mask.bounds()?;
            let (w, h) = (mask.width() as f64, mask.height() as f64);

            let box_w = bounds.width() as f64 / w;
            let box_h = bounds.height() as f64 / h;
            let cx = (bounds.x_min as f64 + bounds.width() as f64 / 2.0) / w;
            let cy = (bounds.y_min as f64 + bounds.height() as f64 / 2.0) / h;

            Some(format!(
                "{} {:.6} {:.6} {:.6} {:.6}",
                class, cx, cy, box_w, box_h
            ))
        })
        .collect()
}

/// Writes `{dir}/{stem}.txt` with the frame's YOLO lines
pub fn export_yolo_labels(frame: &FrameAnnotation, dir: &Path) -> CoreResult<PathBuf> {
    validate_path_id_component(&frame.image_id, "imageId").map_err(CoreError::ValidationError)?;

    let mut content = yolo_label_lines(frame).join("\n");
    if !content.is_empty() {
        content.push('\n');
    }

    let path = dir.join(format!("{}.txt", image_stem(&frame.image_id)));
    atomic_write_bytes(&path, content.as_bytes())
        .map_err(|e| CoreError::persistence(format!("Failed to write {}", path.display()), e))?;
    Ok(path)
}
