//! Annotation System
//!
//! Frame annotations (objects, points, masks), the state machine that keeps
//! them consistent, per-image storage and exports.
//!
//! All annotations are stored per image in a flat JSON record:
//! `{images_dir}/annotations/{image_id}.json`

pub mod export;
pub mod models;
pub mod state;
pub mod store;

pub use models::*;
pub use state::{AnnotationState, ApplyOutcome, MaskUpdate, VersionStamp};
pub use store::AnnotationStore;
