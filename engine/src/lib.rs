//! Samlabel Core Library
//!
//! Point-prompted, multi-object segmentation annotator.
//! This library contains the annotation state machine, the controller that
//! drives segmentation calls on a background path, batch orchestration across
//! an image folder, and per-frame persistence.
//!
//! Front ends (an interactive canvas, the `samlabel` CLI) talk to the engine
//! only through [`core::controller::AnnotationController`].

pub mod core;
pub mod logging;

pub use crate::core::{CoreError, CoreResult};
