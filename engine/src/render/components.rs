//! Component types shared by the render and culling systems.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::ecs::entity::Entity;
use crate::ecs::error::EcsError;
use crate::ecs::handle::Rid;
use crate::ecs::world::World;
use crate::math::{Aabb, Projection, Transform3D};
use crate::occlusion::tile::ScreenTriangle;
use crate::{component, tag};

/// Placement of an entity in the scene; the unit of replication for moving
/// objects.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform3DComponent {
    pub transform: Transform3D,
}
component!(Transform3DComponent, "Transform3DComponent");

/// Host-driven visibility toggle; invisible instances are parked far away
/// rather than skipped so stale geometry never lingers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisibilityComponent {
    pub visible: bool,
}
component!(VisibilityComponent, "VisibilityComponent");

impl Default for VisibilityComponent {
    fn default() -> Self {
        Self { visible: true }
    }
}

/// Present iff the entity's transform mutated since the render consumer
/// last flushed it.
pub struct DirtyTransform;
tag!(DirtyTransform, "DirtyTransform");

/// Applied by the frustum culling pass; toggled per tick.
pub struct FrustumCulled;
tag!(FrustumCulled, "FrustumCulled");

/// Applied by the occlusion culling pass; toggled per tick.
pub struct Occluded;
tag!(Occluded, "Occluded");

/// The camera the culling passes project through. The entity carrying this
/// is referenced by the world's main-camera slot.
#[derive(Debug, Clone, Copy)]
pub struct CameraComponent {
    pub projection: Projection,
    pub camera_offset: Vec2,
}
component!(CameraComponent, "CameraComponent");

/// A mesh resource plus its authoring-time bounds.
#[derive(Debug, Clone, Copy)]
pub struct MeshComponent {
    pub mesh: Rid,
    pub custom_aabb: Aabb,
}
component!(MeshComponent, "MeshComponent");

/// A renderable instance of a mesh in the host scenario.
#[derive(Debug, Clone, Copy)]
pub struct MeshInstanceComponent {
    pub instance: Rid,
}
component!(MeshInstanceComponent, "MeshInstanceComponent");

/// A multimesh resource owning `instance_count` slots.
#[derive(Debug, Clone, Copy)]
pub struct MultiMeshComponent {
    pub multimesh: Rid,
    pub instance_count: u32,
}
component!(MultiMeshComponent, "MultiMeshComponent");

/// One slot of a parent multimesh; the parent is found through [`ChildOf`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MultiMeshInstanceComponent {
    pub index: u32,
}
component!(MultiMeshInstanceComponent, "MultiMeshInstanceComponent");

/// Directed parent edge: the relation half of a `(ChildOf, parent)` pair.
/// Stored as an entity index, never a back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildOf {
    pub parent: Entity,
}
component!(ChildOf, "ChildOf", pair);

/// Geometry contributing depth to the occlusion buffer.
#[derive(Debug, Clone, Default)]
pub struct Occluder {
    /// Local-space triangle soup.
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    /// Refreshed by the UpdateTris stage each tick.
    pub screen_triangles: Vec<ScreenTriangle>,
}
component!(Occluder, "Occluder");

/// Geometry tested against the occlusion buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Occludee {
    pub local_aabb: Aabb,
    /// Refreshed by the UpdateAABBs stage each tick.
    pub world_aabb: Aabb,
}
component!(Occludee, "Occludee");

/// Register every render/culling component on a world. Transform and
/// visibility are wire-capable for the replication layer.
pub fn register_render_components(world: &mut World) -> Result<(), EcsError> {
    world.register_serde::<Transform3DComponent>()?;
    world.register_serde::<VisibilityComponent>()?;
    world.register::<DirtyTransform>()?;
    world.register::<FrustumCulled>()?;
    world.register::<Occluded>()?;
    world.register::<CameraComponent>()?;
    world.register::<MeshComponent>()?;
    world.register::<MeshInstanceComponent>()?;
    world.register::<MultiMeshComponent>()?;
    world.register_serde::<MultiMeshInstanceComponent>()?;
    world.register::<ChildOf>()?;
    world.register::<Occluder>()?;
    world.register::<Occludee>()?;
    Ok(())
}
