//! Domain layer: pure types shared by the snapshot pipeline.

pub mod cards;
