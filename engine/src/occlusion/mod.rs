//! Tile-binned software occlusion culling: a per-tile hi-Z depth image fed
//! by occluder triangles, sampled by occludee screen bounds.

pub mod manager;
pub mod systems;
pub mod tile;

pub use manager::TileOcclusionManager;
pub use systems::register_occlusion_systems;
