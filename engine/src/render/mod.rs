//! The rendering sub-pipeline: backend capability traits, render
//! components, frustum culling, and the deferred flush systems.

pub mod backend;
pub mod components;
pub mod frustum;
pub mod systems;

pub use backend::{NavigationBackend, RenderBackend, SpaceBackend};
pub use systems::{RenderSystemsConfig, register_render_systems};
