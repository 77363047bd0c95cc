//! Folder Image Source
//!
//! Scans one directory (non-recursive) for image files and serves them in
//! file-name order.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::core::{CoreError, CoreResult, ImageExtent, ImageId};

use super::{ImageFrame, ImageInfo, ImageSource, DEFAULT_IMAGE_EXTENSIONS};

/// Image sequence backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FolderImageSource {
    root: PathBuf,
    entries: Vec<(ImageId, PathBuf)>,
}

impl FolderImageSource {
    /// Scans a folder using the default image extensions
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        Self::open_with_extensions(root, DEFAULT_IMAGE_EXTENSIONS)
    }

    /// Scans a folder, keeping files whose extension matches (case-insensitive)
    pub fn open_with_extensions<S: AsRef<str>>(
        root: impl Into<PathBuf>,
        extensions: &[S],
    ) -> CoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CoreError::InvalidState(format!(
                "Image folder does not exist: {}",
                root.display()
            )));
        }

        let extensions: Vec<String> = extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let mut entries = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable entry during image scan");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext.to_ascii_lowercase()));
            if !matches {
                continue;
            }

            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                entries.push((name.to_string(), path.to_path_buf()));
            }
        }

        // Sort by file name for a stable ordering
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            "Loaded {} images from {}",
            entries.len(),
            root.display()
        );

        Ok(Self { root, entries })
    }

    /// Folder this source was scanned from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an image
    pub fn path_of(&self, image_id: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(id, _)| id == image_id)
            .map(|(_, path)| path.as_path())
    }

    fn require_path(&self, image_id: &str) -> CoreResult<&Path> {
        self.path_of(image_id).ok_or_else(|| CoreError::ImageLoad {
            image_id: image_id.to_string(),
            reason: "not part of this image set".to_string(),
        })
    }

    /// Position, size and path of the image at `index`
    pub fn image_info(&self, index: usize) -> CoreResult<ImageInfo> {
        let (image_id, path) = self.entries.get(index).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Image index {} out of range (0..{})",
                index,
                self.entries.len()
            ))
        })?;
        let extent = self.dimensions(image_id)?;
        Ok(ImageInfo {
            image_id: image_id.clone(),
            path: path.to_string_lossy().to_string(),
            index,
            total: self.entries.len(),
            width: extent.width,
            height: extent.height,
        })
    }
}

impl ImageSource for FolderImageSource {
    fn list(&self) -> Vec<ImageId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    fn get(&self, image_id: &str) -> CoreResult<ImageFrame> {
        let path = self.require_path(image_id)?;
        let decoded = image::open(path).map_err(|e| CoreError::ImageLoad {
            image_id: image_id.to_string(),
            reason: e.to_string(),
        })?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        ImageFrame::new(image_id, width, height, rgb.into_raw())
    }

    fn dimensions(&self, image_id: &str) -> CoreResult<ImageExtent> {
        let path = self.require_path(image_id)?;
        let (width, height) = image::image_dimensions(path).map_err(|e| CoreError::ImageLoad {
            image_id: image_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ImageExtent::new(width, height))
    }

    fn locate(&self, image_id: &str) -> Option<String> {
        self.path_of(image_id)
            .map(|p| p.to_string_lossy().to_string())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn index_of(&self, image_id: &str) -> Option<usize> {
        self.entries.iter().position(|(id, _)| id == image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) {
        image::RgbImage::new(width, height)
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "b.png", 4, 4);
        write_png(dir.path(), "a.PNG", 4, 4);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_png(&dir.path().join("nested"), "c.png", 4, 4);

        let source = FolderImageSource::open(dir.path()).unwrap();
        assert_eq!(source.list(), vec!["a.PNG".to_string(), "b.png".to_string()]);
        assert_eq!(source.len(), 2);
        assert_eq!(source.index_of("b.png"), Some(1));
    }

    #[test]
    fn test_missing_folder_is_invalid_state() {
        let err = FolderImageSource::open("/definitely/not/here").unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[test]
    fn test_get_and_dimensions() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "frame.png", 7, 5);

        let source = FolderImageSource::open(dir.path()).unwrap();
        assert_eq!(source.dimensions("frame.png").unwrap(), ImageExtent::new(7, 5));

        let frame = source.get("frame.png").unwrap();
        assert_eq!((frame.width, frame.height), (7, 5));
        assert_eq!(frame.pixels.len(), 7 * 5 * 3);

        let info = source.image_info(0).unwrap();
        assert_eq!(info.image_id, "frame.png");
        assert_eq!(info.total, 1);
        assert_eq!((info.width, info.height), (7, 5));
    }

    #[test]
    fn test_unknown_or_corrupt_image() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let source = FolderImageSource::open(dir.path()).unwrap();
        assert!(matches!(
            source.get("broken.png"),
            Err(CoreError::ImageLoad { .. })
        ));
        assert!(matches!(
            source.get("missing.png"),
            Err(CoreError::ImageLoad { .. })
        ));
    }

    #[test]
    fn test_custom_extensions() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png", 2, 2);
        std::fs::write(dir.path().join("b.jpg"), b"").unwrap();

        let source = FolderImageSource::open_with_extensions(dir.path(), &[".PNG"]).unwrap();
        assert_eq!(source.list(), vec!["a.png".to_string()]);
    }
}
