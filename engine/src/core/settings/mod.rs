//! Settings Persistence System
//!
//! Provides persistent annotator settings with:
//! - Atomic file writes (temp file + rename)
//! - Schema validation with defaults
//! - Migration support for schema changes
//!
//! Storage location: {config_dir}/samlabel/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::core::{
    annotations::store::ANNOTATIONS_DIR_NAME,
    fs::{atomic_write_json_pretty, validate_path_id_component},
    images::DEFAULT_IMAGE_EXTENSIONS,
    segmentation::{
        providers::remote::DEFAULT_MASK_THRESHOLD, SegmentationLimits, DEFAULT_MIN_CONFIDENCE,
        DEFAULT_TIMEOUT_SECS,
    },
    CoreError, CoreResult,
};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Application directory name under the user config dir
pub const APP_DIR_NAME: &str = "samlabel";

/// Annotator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatorSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Segmentation service settings
    #[serde(default)]
    pub segmentation: SegmentationSettings,

    /// Batch processing settings
    #[serde(default)]
    pub batch: BatchSettings,

    /// Image discovery settings
    #[serde(default)]
    pub images: ImageSettings,

    /// Annotation storage settings
    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for AnnotatorSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            segmentation: SegmentationSettings::default(),
            batch: BatchSettings::default(),
            images: ImageSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl AnnotatorSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Bad values are corrected instead of rejected so an old or hand-edited
    /// file never prevents startup.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        let seg = &mut self.segmentation;
        seg.endpoint = seg.endpoint.trim().trim_end_matches('/').to_string();
        if seg.endpoint.is_empty() {
            seg.endpoint = default_endpoint();
        }
        seg.model = normalize_enum(
            &seg.model,
            &["tiny", "small", "baseplus", "large"],
            default_model(),
        );
        seg.timeout_secs = seg.timeout_secs.clamp(1, 600);
        seg.mask_threshold = clamp_f32(seg.mask_threshold, 0.0, 1.0, DEFAULT_MASK_THRESHOLD);
        seg.min_confidence = clamp_f32(seg.min_confidence, 0.0, 1.0, DEFAULT_MIN_CONFIDENCE);

        self.batch.concurrency = self.batch.concurrency.clamp(1, max_concurrency());
        if validate_path_id_component(&self.batch.runs_dir, "runsDir").is_err() {
            self.batch.runs_dir = default_runs_dir();
        }
        if validate_path_id_component(&self.batch.labels_dir, "labelsDir").is_err() {
            self.batch.labels_dir = default_labels_dir();
        }

        let mut extensions: Vec<String> = Vec::new();
        for ext in &self.images.extensions {
            let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
            if !ext.is_empty() && !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        self.images.extensions = if extensions.is_empty() {
            default_extensions()
        } else {
            extensions
        };

        if validate_path_id_component(&self.storage.annotations_dir, "annotationsDir").is_err() {
            self.storage.annotations_dir = default_annotations_dir();
        }
    }

    /// Limits applied around each segmentation call
    pub fn segmentation_limits(&self) -> SegmentationLimits {
        SegmentationLimits {
            timeout: Duration::from_secs(self.segmentation.timeout_secs),
            min_confidence: self.segmentation.min_confidence,
        }
    }
}

fn clamp_f32(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if !value.is_finite() {
        return fallback;
    }
    value.clamp(min, max)
}

fn normalize_enum(value: &str, allowed: &[&str], fallback: String) -> String {
    if allowed.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        value.to_ascii_lowercase()
    } else {
        fallback
    }
}

fn max_concurrency() -> u32 {
    num_cpus::get().clamp(1, 32) as u32
}

// ============================================================
// Segmentation Settings
// ============================================================

/// Segmentation service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationSettings {
    /// Base URL of the SAM2 service
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model size: "tiny", "small", "baseplus", "large"
    #[serde(default = "default_model")]
    pub model: String,

    /// Deadline for one segmentation call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Probability threshold for mask membership (0.0 - 1.0)
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,

    /// Scores below this are flagged as low confidence (0.0 - 1.0)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            mask_threshold: default_mask_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_model() -> String {
    "large".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_mask_threshold() -> f32 {
    DEFAULT_MASK_THRESHOLD
}

fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

// ============================================================
// Batch Settings
// ============================================================

/// Batch processing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettings {
    /// Images segmented in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Pad every object's points to the same count before replay
    #[serde(default)]
    pub balance_points: bool,

    /// Write a PNG per object mask after each image
    #[serde(default)]
    pub export_masks: bool,

    /// Write YOLO label files after each image
    #[serde(default)]
    pub export_labels: bool,

    /// Mask PNG directory, relative to the image folder
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,

    /// Label directory, relative to the image folder
    #[serde(default = "default_labels_dir")]
    pub labels_dir: String,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            balance_points: false,
            export_masks: false,
            export_labels: false,
            runs_dir: default_runs_dir(),
            labels_dir: default_labels_dir(),
        }
    }
}

fn default_concurrency() -> u32 {
    1
}

fn default_runs_dir() -> String {
    "runs".to_string()
}

fn default_labels_dir() -> String {
    "labels".to_string()
}

// ============================================================
// Image and Storage Settings
// ============================================================

/// Image discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSettings {
    /// File extensions treated as images (case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_IMAGE_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}

/// Annotation storage settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    /// Annotation directory name inside the image folder
    #[serde(default = "default_annotations_dir")]
    pub annotations_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            annotations_dir: default_annotations_dir(),
        }
    }
}

fn default_annotations_dir() -> String {
    ANNOTATIONS_DIR_NAME.to_string()
}

// ============================================================
// Settings Manager
// ============================================================

/// Settings manager for loading, saving, and resetting settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager with the given config directory
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            settings_path: config_dir.join(SETTINGS_FILE),
        }
    }

    /// Create a settings manager for an explicit settings file
    pub fn from_file(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    /// Default config directory (`{config_dir}/samlabel`)
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME))
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        // Ensure parent directory exists so the lock file can be created.
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CoreError::persistence("Failed to create settings directory", e))?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(|e| CoreError::persistence("Failed to open settings lock file", e))?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file).map_err(|e| {
                CoreError::persistence("Failed to lock settings file (exclusive)", e)
            })?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)
                .map_err(|e| CoreError::persistence("Failed to lock settings file (shared)", e))?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or unreadable
    pub fn load(&self) -> AnnotatorSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(AnnotatorSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)
                .map_err(|e| CoreError::persistence("Failed to read settings file", e))?;

            let mut settings = serde_json::from_str::<AnnotatorSettings>(&content)
                .map_err(|e| CoreError::persistence("Failed to parse settings file", e))?;

            // Run migrations if needed
            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
                settings = self.migrate(settings);
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                AnnotatorSettings::default()
            }
        }
    }

    /// Save settings to disk using an atomic write; returns the normalized settings
    pub fn save(&self, settings: &AnnotatorSettings) -> CoreResult<AnnotatorSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            atomic_write_json_pretty(&self.settings_path, &normalized)
                .map_err(|e| CoreError::persistence("Failed to write settings file", e))?;

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Reset settings to defaults and delete the settings file
    pub fn reset(&self) -> CoreResult<AnnotatorSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)
                    .map_err(|e| CoreError::persistence("Failed to delete settings file", e))?;
                info!("Settings file deleted");
            }
            Ok(AnnotatorSettings::default())
        })
    }

    /// Migrate settings from an older version
    fn migrate(&self, mut settings: AnnotatorSettings) -> AnnotatorSettings {
        settings.version = SETTINGS_VERSION;
        settings
    }
}
