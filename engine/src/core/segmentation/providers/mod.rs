//! Segmentation Provider Implementations

pub mod remote;

pub use remote::{RemoteSam2Provider, Sam2Model};
