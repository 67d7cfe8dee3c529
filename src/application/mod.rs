//! Application layer: the render pipeline and its error surface.

pub mod error;
pub mod render;
