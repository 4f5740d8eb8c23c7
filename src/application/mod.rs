//! Application layer: the snapshot pipeline and the seams it depends on.

pub mod error;
pub mod repos;
pub mod screenshot;
