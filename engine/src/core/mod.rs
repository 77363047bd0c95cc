//! Samlabel Core Engine
//!
//! Core annotation engine module.
//! Handles image sets, annotation state, segmentation providers, persistence
//! and the controller that ties them together.

pub mod annotations;
pub mod controller;
pub mod fs;
pub mod images;
pub mod masks;
pub mod segmentation;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scenarios;
