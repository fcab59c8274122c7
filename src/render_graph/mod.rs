//! Render Graph System
//!
//! A per-frame list of render passes. The graph creates the textures and
//! framebuffers its passes render into, records every pass into one command
//! list in declaration order, submits it, and destroys what it created.

pub mod cube;
pub mod graph;
pub mod pass;
pub mod resource;

pub use cube::*;
pub use graph::*;
pub use pass::*;
pub use resource::*;
