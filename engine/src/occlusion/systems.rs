//! The occlusion culling chain: six systems strung on a strict `DependsOn`
//! phase chain after `OnUpdate`.
//!
//! ```text
//! Reset → Occluder::UpdateTris → Occludee::UpdateAABBs
//!       → Occluder::Binning → Occluder::Rasterize → Occludee::Cull
//! ```
//!
//! Reset and Rasterize are whole-frame stages and run on the main thread
//! (Rasterize fans tiles out to the worker pool itself); the per-entity
//! stages are `multi_threaded`. Because every stage owns its own phase, the
//! command queue drains between stages and `Occluded` tags applied by Cull
//! are visible to the render systems that follow.

use std::sync::Arc;

use glam::Vec2;

use crate::ecs::error::EcsError;
use crate::ecs::pipeline::phases;
use crate::ecs::query::Filter;
use crate::ecs::system::{Iter, SystemDesc};
use crate::ecs::world::World;
use crate::math::Transform3D;
use crate::occlusion::manager::TileOcclusionManager;
use crate::occlusion::tile::{ScreenAabb, ScreenTriangle};
use crate::render::components::{
    CameraComponent, FrustumCulled, Occluded, Occludee, Occluder, Transform3DComponent,
    VisibilityComponent,
};

/// Phase (and system) names of the chain, in execution order.
pub mod stage {
    pub const RESET: &str = "OcclusionSystem::Reset";
    pub const UPDATE_TRIS: &str = "OcclusionSystem::Occluder::UpdateTris";
    pub const UPDATE_AABBS: &str = "OcclusionSystem::Occludee::UpdateAABBs";
    pub const BINNING: &str = "OcclusionSystem::Occluder::Binning";
    pub const RASTERIZE: &str = "OcclusionSystem::Occluder::Rasterize";
    pub const CULL: &str = "OcclusionSystem::Occludee::Cull";
}

/// The main camera's placement and projection, if one is set and complete.
fn camera_state(iter: &Iter<'_>) -> Option<(Transform3D, CameraComponent)> {
    let world = iter.world();
    let camera = world.main_camera()?;
    let camera_component = *world.get::<CameraComponent>(camera)?;
    let transform = world.get::<Transform3DComponent>(camera)?.transform;
    Some((transform, camera_component))
}

/// Register the occlusion chain. The manager is shared with the caller so
/// hosts can inspect the depth image (diagnostics, tests).
pub fn register_occlusion_systems(
    world: &mut World,
    manager: Arc<TileOcclusionManager>,
) -> Result<(), EcsError> {
    let transform = world
        .id_of::<Transform3DComponent>()
        .ok_or_else(|| EcsError::UnknownComponent("Transform3DComponent".into()))?;
    let visibility = world
        .id_of::<VisibilityComponent>()
        .ok_or_else(|| EcsError::UnknownComponent("VisibilityComponent".into()))?;
    let camera = world
        .id_of::<CameraComponent>()
        .ok_or_else(|| EcsError::UnknownComponent("CameraComponent".into()))?;
    let occluder = world
        .id_of::<Occluder>()
        .ok_or_else(|| EcsError::UnknownComponent("Occluder".into()))?;
    let occludee = world
        .id_of::<Occludee>()
        .ok_or_else(|| EcsError::UnknownComponent("Occludee".into()))?;
    let frustum_culled = world
        .id_of::<FrustumCulled>()
        .ok_or_else(|| EcsError::UnknownComponent("FrustumCulled".into()))?;

    let mut previous = phases::ON_UPDATE;
    for name in [
        stage::RESET,
        stage::UPDATE_TRIS,
        stage::UPDATE_AABBS,
        stage::BINNING,
        stage::RASTERIZE,
        stage::CULL,
    ] {
        world.create_phase(name, Some(previous))?;
        previous = name;
    }

    // Reset: clear bins and track the window size.
    let reset_manager = Arc::clone(&manager);
    world.register_system(
        SystemDesc::new(stage::RESET, move |iter| {
            let (width, height) = iter.world().window_size();
            reset_manager.reset(width, height);
        })
        .phase(stage::RESET),
    )?;

    // UpdateTris: project every visible occluder's triangles to screen
    // space, discarding triangles behind the near plane.
    let tris_manager = Arc::clone(&manager);
    world.register_system(
        SystemDesc::new(stage::UPDATE_TRIS, move |iter| {
            let Some((camera_transform, camera_component)) = camera_state(iter) else {
                return;
            };
            let (width, height) = tris_manager.dimensions();
            let screen = Vec2::new(width as f32, height as f32);
            for &entity in iter.entities() {
                if !iter
                    .get::<VisibilityComponent>(entity)
                    .is_some_and(|v| v.visible)
                {
                    continue;
                }
                let Some(world_transform) =
                    iter.get::<Transform3DComponent>(entity).map(|t| t.transform)
                else {
                    continue;
                };
                let Some(occ) = iter.get_mut::<Occluder>(entity) else {
                    continue;
                };
                occ.screen_triangles = ScreenTriangle::project_triangles(
                    &occ.vertices,
                    &occ.indices,
                    &world_transform,
                    &camera_transform,
                    &camera_component.projection,
                    screen,
                );
            }
        })
        .phase(stage::UPDATE_TRIS)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .write(occluder)
                .read(transform)
                .read(visibility)
                // The projection lives on the camera entity.
                .read_optional(camera)
                .without(frustum_culled),
        ),
    )?;

    // UpdateAABBs: refresh each occludee's world bounds from its transform.
    world.register_system(
        SystemDesc::new(stage::UPDATE_AABBS, move |iter| {
            for &entity in iter.entities() {
                let Some(world_transform) =
                    iter.get::<Transform3DComponent>(entity).map(|t| t.transform)
                else {
                    continue;
                };
                if let Some(occ) = iter.get_mut::<Occludee>(entity) {
                    occ.world_aabb = occ.local_aabb.transformed(&world_transform);
                }
            }
        })
        .phase(stage::UPDATE_AABBS)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .write(occludee)
                .read(transform)
                .read(visibility)
                .without(frustum_culled),
        ),
    )?;

    // Binning: append each visible occluder's screen triangles to the tile
    // bins. Appends are per-tile queues, so batches never contend.
    let binning_manager = Arc::clone(&manager);
    world.register_system(
        SystemDesc::new(stage::BINNING, move |iter| {
            for &entity in iter.entities() {
                if !iter
                    .get::<VisibilityComponent>(entity)
                    .is_some_and(|v| v.visible)
                {
                    continue;
                }
                if let Some(occ) = iter.get::<Occluder>(entity) {
                    binning_manager.bin_triangles(&occ.screen_triangles);
                }
            }
        })
        .phase(stage::BINNING)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .read(occluder)
                .read(visibility)
                .without(frustum_culled),
        ),
    )?;

    // Rasterize: whole-frame stage; tiles fan out across the worker pool,
    // one owner per tile.
    let raster_manager = Arc::clone(&manager);
    world.register_system(
        SystemDesc::new(stage::RASTERIZE, move |iter| {
            raster_manager.rasterize(iter.world().workers());
        })
        .phase(stage::RASTERIZE),
    )?;

    // Cull: sample the depth image and toggle the Occluded tag through the
    // command queue.
    let cull_manager = manager;
    world.register_system(
        SystemDesc::new(stage::CULL, move |iter| {
            let Some((camera_transform, camera_component)) = camera_state(iter) else {
                return;
            };
            let (width, height) = cull_manager.dimensions();
            let screen = Vec2::new(width as f32, height as f32);
            for &entity in iter.entities() {
                let Some(occ) = iter.get::<Occludee>(entity) else {
                    continue;
                };
                let projected = ScreenAabb::from_world_aabb(
                    &occ.world_aabb,
                    &camera_transform,
                    &camera_component.projection,
                    screen,
                    camera_component.camera_offset,
                );
                // A box that fails to project is treated as visible.
                let visible = projected
                    .map(|screen_aabb| cull_manager.is_visible(&screen_aabb))
                    .unwrap_or(true);
                if visible {
                    let _ = iter.commands().enqueue(move |world: &mut World| {
                        let _ = world.detach::<Occluded>(entity);
                    });
                } else {
                    let _ = iter.commands().enqueue(move |world: &mut World| {
                        let _ = world.attach(entity, Occluded);
                    });
                }
            }
        })
        .phase(stage::CULL)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .read(occludee)
                .read(transform)
                // The projection lives on the camera entity.
                .read_optional(camera)
                .without(frustum_culled),
        ),
    )?;

    Ok(())
}
