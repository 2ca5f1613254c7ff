//! The render sub-pipeline: frustum culling plus the multimesh and mesh
//! flush systems.
//!
//! All backend work is expressed as deferred commands; the main thread
//! drains them into the [`RenderBackend`](crate::render::backend::RenderBackend)
//! between phases. The flush systems run in custom phases chained after the
//! occlusion cull so `FrustumCulled` / `Occluded` tags from this tick are
//! already in place.

use std::sync::atomic::Ordering;

use glam::Vec3;

use crate::ecs::error::EcsError;
use crate::ecs::pipeline::phases;
use crate::ecs::query::Filter;
use crate::ecs::system::{Iter, SystemDesc};
use crate::ecs::world::World;
use crate::math::Transform3D;
use crate::occlusion::systems::stage;
use crate::render::components::{
    CameraComponent, ChildOf, DirtyTransform, FrustumCulled, MeshComponent,
    MeshInstanceComponent, MultiMeshComponent, MultiMeshInstanceComponent, Occluded,
    Transform3DComponent, VisibilityComponent,
};
use crate::render::frustum::camera_frustum;

/// System and phase names.
pub mod names {
    pub const FRUSTUM_CULLING: &str = "MultiMeshRenderSystem::FrustumCulling";
    pub const MULTIMESH_RENDER: &str = "MultiMeshRenderSystem::Render";
    pub const MESH_RENDER: &str = "MeshRenderSystem::Render";
}

/// Tuning knobs for the render systems.
#[derive(Debug, Clone, Copy)]
pub struct RenderSystemsConfig {
    /// Frustum culling cadence in seconds.
    pub frustum_interval: f32,
    /// Round-robin divisor for multimesh flushes.
    pub batch_modulus: u64,
    /// How far from the camera invisible instances are parked.
    pub far_distance: f32,
}

impl Default for RenderSystemsConfig {
    fn default() -> Self {
        Self {
            frustum_interval: 0.016,
            batch_modulus: 50_000,
            far_distance: 10_000.0,
        }
    }
}

fn component_id<T: crate::ecs::component::Component>(
    world: &World,
) -> Result<crate::ecs::component::ComponentId, EcsError> {
    world
        .id_of::<T>()
        .ok_or_else(|| EcsError::UnknownComponent(T::NAME.to_string()))
}

/// The camera placement, if a complete main camera exists.
fn camera_transform(iter: &Iter<'_>) -> Option<Transform3D> {
    let world = iter.world();
    let camera = world.main_camera()?;
    Some(world.get::<Transform3DComponent>(camera)?.transform)
}

/// Register the frustum culling system (phase `OnUpdate`, interval-gated,
/// multi-threaded). For each visible multimesh instance the world-space
/// bounds are rebuilt from the parent mesh's authored AABB and tested
/// against the main camera's six planes; the `FrustumCulled` tag is toggled
/// through the command queue.
pub fn register_frustum_culling(
    world: &mut World,
    config: RenderSystemsConfig,
) -> Result<(), EcsError> {
    let transform = component_id::<Transform3DComponent>(world)?;
    let visibility = component_id::<VisibilityComponent>(world)?;
    let camera = component_id::<CameraComponent>(world)?;
    let instance = component_id::<MultiMeshInstanceComponent>(world)?;
    let child_of = component_id::<ChildOf>(world)?;
    let mesh = component_id::<MeshComponent>(world)?;

    world.register_system(
        SystemDesc::new(names::FRUSTUM_CULLING, move |iter| {
            let world = iter.world();
            let Some(camera_entity) = world.main_camera() else {
                return;
            };
            let Some(camera_component) = world.get::<CameraComponent>(camera_entity) else {
                return;
            };
            let Some(camera_placement) = camera_transform(iter) else {
                return;
            };
            let frustum = camera_frustum(&camera_component.projection, &camera_placement);

            for &entity in iter.entities() {
                if !iter
                    .get::<VisibilityComponent>(entity)
                    .is_some_and(|v| v.visible)
                {
                    continue;
                }
                let Some(placement) = iter.get::<Transform3DComponent>(entity) else {
                    continue;
                };
                let Some(parent) = iter.get::<ChildOf>(entity).map(|c| c.parent) else {
                    continue;
                };
                let Some(local_aabb) = world.get::<MeshComponent>(parent).map(|m| m.custom_aabb)
                else {
                    continue;
                };

                let world_aabb = local_aabb.transformed(&placement.transform);
                if frustum.intersects_aabb(&world_aabb) {
                    let _ = iter.commands().enqueue(move |world: &mut World| {
                        let _ = world.detach::<FrustumCulled>(entity);
                    });
                } else {
                    let _ = iter.commands().enqueue(move |world: &mut World| {
                        let _ = world.attach(entity, FrustumCulled);
                    });
                }
            }
        })
        .phase(phases::ON_UPDATE)
        .interval(config.frustum_interval)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .read(instance)
                .read(transform)
                .read(visibility)
                .read(child_of)
                // Camera and parent mesh bounds live on other entities.
                .read_optional(camera)
                .read_optional(mesh),
        ),
    )
}

/// Register the multimesh flush system in a phase after the occlusion cull.
///
/// Flushing is throttled round-robin by the world's FrameCounter: an
/// instance flushes when its index matches the counter modulo
/// `batch_modulus`, and the counter advances with each flush, so a dense
/// run of dirty instances drains in one tick while enormous multimeshes
/// spread across ticks. Invisible instances are parked `far_distance` from
/// the camera instead of skipped.
pub fn register_multimesh_render(
    world: &mut World,
    config: RenderSystemsConfig,
) -> Result<(), EcsError> {
    let transform = component_id::<Transform3DComponent>(world)?;
    let visibility = component_id::<VisibilityComponent>(world)?;
    let instance = component_id::<MultiMeshInstanceComponent>(world)?;
    let child_of = component_id::<ChildOf>(world)?;
    let multimesh = component_id::<MultiMeshComponent>(world)?;
    let dirty = component_id::<DirtyTransform>(world)?;
    let frustum_culled = component_id::<FrustumCulled>(world)?;
    let occluded = component_id::<Occluded>(world)?;

    // Chain after the occlusion cull when the chain is present.
    let after = if world.pipeline().id_of(stage::CULL).is_ok() {
        stage::CULL
    } else {
        phases::ON_UPDATE
    };
    world.create_phase(names::MULTIMESH_RENDER, Some(after))?;

    let modulus = config.batch_modulus.max(1);
    let far_distance = config.far_distance;

    world.register_system(
        SystemDesc::new(names::MULTIMESH_RENDER, move |iter| {
            let counter = iter.world().frame_counter();
            let frame = iter.world().frame();
            let camera_origin = camera_transform(iter).map(|t| t.origin).unwrap_or(Vec3::ZERO);

            for &entity in iter.entities() {
                let Some(slot) = iter.get::<MultiMeshInstanceComponent>(entity).map(|i| i.index)
                else {
                    continue;
                };
                // Round-robin gate. The counter chains through dense dirty
                // runs (it advances with every flush, so consecutive indices
                // drain in one tick); the frame fallback guarantees every
                // instance still gets a turn within `modulus` ticks even if
                // the chain never reaches it.
                let turn = (slot as u64) % modulus;
                if turn == counter.load(Ordering::Relaxed) % modulus {
                    counter.fetch_add(1, Ordering::Relaxed);
                } else if turn != frame % modulus {
                    continue;
                }

                let Some(parent) = iter.get::<ChildOf>(entity).map(|c| c.parent) else {
                    continue;
                };
                let Some(mm) = iter.world().get::<MultiMeshComponent>(parent).map(|m| m.multimesh)
                else {
                    continue;
                };
                let visible = iter
                    .get::<VisibilityComponent>(entity)
                    .is_some_and(|v| v.visible);
                let placement = match iter.get::<Transform3DComponent>(entity) {
                    Some(t) if visible => t.transform,
                    // Park invisible instances outside render range so stale
                    // geometry never lingers on screen.
                    _ => Transform3D::from_origin(camera_origin + Vec3::splat(far_distance)),
                };

                let _ = iter.commands().enqueue(move |world: &mut World| {
                    let applied = world
                        .render()
                        .map(|backend| {
                            backend.multimesh_instance_set_transform(mm, slot, placement)
                        })
                        .unwrap_or(false);
                    if !applied && world.warn_invalid_rid_once(mm) {
                        log::warn!(
                            "multimesh_instance_set_transform on invalid multimesh {mm:?}"
                        );
                    }
                    let _ = world.detach::<DirtyTransform>(entity);
                });
            }
        })
        .phase(names::MULTIMESH_RENDER)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .read(instance)
                .read(transform)
                .read(visibility)
                .read(child_of)
                // The multimesh handle lives on the parent entity.
                .read_optional(multimesh)
                .with(dirty)
                .without(frustum_culled)
                .without(occluded),
        ),
    )
}

/// Register the mesh flush system in a phase after the multimesh flush.
///
/// Occluded meshes keep their stale transform (a deliberate no-op command
/// preserves the per-producer ordering of the queue); invalid instance
/// handles are logged once per RID and skipped.
pub fn register_mesh_render(world: &mut World) -> Result<(), EcsError> {
    let transform = component_id::<Transform3DComponent>(world)?;
    let visibility = component_id::<VisibilityComponent>(world)?;
    let instance = component_id::<MeshInstanceComponent>(world)?;
    let dirty = component_id::<DirtyTransform>(world)?;

    let after = if world.pipeline().id_of(names::MULTIMESH_RENDER).is_ok() {
        names::MULTIMESH_RENDER
    } else {
        phases::ON_UPDATE
    };
    world.create_phase(names::MESH_RENDER, Some(after))?;

    world.register_system(
        SystemDesc::new(names::MESH_RENDER, move |iter| {
            for &entity in iter.entities() {
                if !iter
                    .get::<VisibilityComponent>(entity)
                    .is_some_and(|v| v.visible)
                {
                    continue;
                }
                let Some(rid) = iter.get::<MeshInstanceComponent>(entity).map(|i| i.instance)
                else {
                    continue;
                };
                if iter.world().has::<Occluded>(entity) {
                    // Stale-safe: the transform stays dirty and flushes when
                    // the entity becomes visible again.
                    let _ = iter.commands().enqueue(|_: &mut World| {});
                    continue;
                }
                let Some(placement) = iter.get::<Transform3DComponent>(entity).map(|t| t.transform)
                else {
                    continue;
                };
                let _ = iter.commands().enqueue(move |world: &mut World| {
                    let applied = world
                        .render()
                        .map(|backend| backend.instance_set_transform(rid, placement))
                        .unwrap_or(false);
                    if !applied {
                        if world.warn_invalid_rid_once(rid) {
                            log::warn!("instance_set_transform on invalid instance {rid:?}");
                        }
                        return;
                    }
                    let _ = world.detach::<DirtyTransform>(entity);
                });
            }
        })
        .phase(names::MESH_RENDER)
        .multi_threaded(true)
        .filter(
            Filter::new()
                .read(instance)
                .read(transform)
                .read(visibility)
                .with(dirty),
        ),
    )
}

/// Register frustum culling plus both flush systems.
pub fn register_render_systems(
    world: &mut World,
    config: RenderSystemsConfig,
) -> Result<(), EcsError> {
    register_frustum_culling(world, config)?;
    register_multimesh_render(world, config)?;
    register_mesh_render(world)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec2;

    use crate::core::tasks::WorkerPool;
    use crate::ecs::entity::Entity;
    use crate::ecs::world::{World, WorldId};
    use crate::math::{Aabb, Projection};
    use crate::render::backend::{RecordingBackend, RenderBackend, RenderCall};
    use crate::render::components::register_render_components;

    use super::*;

    fn render_world() -> (World, RecordingBackend) {
        let mut world =
            World::with_workers(WorldId::new(0), "render", Arc::new(WorkerPool::new(2)));
        register_render_components(&mut world).unwrap();
        let backend = RecordingBackend::new();
        world.set_render_backend(Box::new(backend.clone()));

        let camera = world.create_entity();
        world
            .attach(
                camera,
                CameraComponent {
                    projection: Projection::perspective_hfov(
                        90f32.to_radians(),
                        320.0 / 180.0,
                        0.05,
                        1000.0,
                    ),
                    camera_offset: Vec2::ZERO,
                },
            )
            .unwrap();
        world
            .attach(camera, Transform3DComponent::default())
            .unwrap();
        world.set_main_camera(Some(camera));
        (world, backend)
    }


    /// A multimesh parent with `count` instance children, all dirty.
    fn spawn_multimesh(world: &mut World, count: u32) -> (Entity, crate::ecs::handle::Rid, Vec<Entity>) {
        let multimesh_rid = {
            let backend = world.render().unwrap();
            let rid = backend.multimesh_create();
            backend.multimesh_allocate_data(rid, count);
            rid
        };

        let parent = world.create_entity();
        world
            .attach(
                parent,
                MultiMeshComponent {
                    multimesh: multimesh_rid,
                    instance_count: count,
                },
            )
            .unwrap();
        world
            .attach(
                parent,
                MeshComponent {
                    mesh: crate::ecs::handle::Rid::INVALID,
                    custom_aabb: Aabb::new(Vec3::splat(-0.5), Vec3::splat(1.0)),
                },
            )
            .unwrap();

        let instances = (0..count)
            .map(|index| {
                let child = world.create_entity();
                world
                    .attach(child, MultiMeshInstanceComponent { index })
                    .unwrap();
                world.attach(child, ChildOf { parent }).unwrap();
                world
                    .attach(
                        child,
                        Transform3DComponent {
                            transform: Transform3D::from_origin(Vec3::new(
                                index as f32, 0.0, -5.0,
                            )),
                        },
                    )
                    .unwrap();
                world
                    .attach(child, VisibilityComponent { visible: true })
                    .unwrap();
                world.attach(child, DirtyTransform).unwrap();
                child
            })
            .collect();

        (parent, multimesh_rid, instances)
    }

    #[test]
    fn multimesh_batched_update_flushes_all_dirty_instances() {
        // Given: 100 dirty instances under the default 50000 modulus
        let (mut world, backend) = render_world();
        register_multimesh_render(&mut world, RenderSystemsConfig::default()).unwrap();
        let (_parent, multimesh_rid, instances) = spawn_multimesh(&mut world, 100);

        // When
        world.progress(0.016);

        // Then: exactly 100 backend transforms observed, nothing dirty
        assert_eq!(
            backend.multimesh_transform_updates(multimesh_rid),
            100
        );
        for entity in &instances {
            assert!(!world.has::<DirtyTransform>(*entity));
        }

        // And a second tick flushes nothing new
        world.progress(0.016);
        assert_eq!(
            backend.multimesh_transform_updates(multimesh_rid),
            100
        );
    }

    #[test]
    fn culled_instances_are_not_flushed() {
        // Given: one instance tagged Occluded, one FrustumCulled
        let (mut world, backend) = render_world();
        register_multimesh_render(&mut world, RenderSystemsConfig::default()).unwrap();
        let (_parent, multimesh_rid, instances) = spawn_multimesh(&mut world, 3);
        world.attach(instances[1], Occluded).unwrap();
        world.attach(instances[2], FrustumCulled).unwrap();

        // When
        world.progress(0.016);

        // Then: only the untagged instance flushed; the tagged stay dirty
        assert_eq!(
            backend.multimesh_transform_updates(multimesh_rid),
            1
        );
        assert!(!world.has::<DirtyTransform>(instances[0]));
        assert!(world.has::<DirtyTransform>(instances[1]));
        assert!(world.has::<DirtyTransform>(instances[2]));
    }

    #[test]
    fn invisible_instances_park_far_from_camera() {
        // Given a single invisible instance
        let (mut world, backend) = render_world();
        register_multimesh_render(&mut world, RenderSystemsConfig::default()).unwrap();
        let (_parent, multimesh_rid, instances) = spawn_multimesh(&mut world, 1);
        world
            .attach(instances[0], VisibilityComponent { visible: false })
            .unwrap();

        // When
        world.progress(0.016);

        // Then: flushed to the far park position, not skipped
        let calls = backend.calls().to_vec();
        let parked = calls.iter().any(|call| {
            matches!(
                call,
                RenderCall::MultimeshInstanceSetTransform { multimesh, transform, .. }
                    if *multimesh == multimesh_rid
                        && transform.origin.x >= 9_000.0
            )
        });
        assert!(parked, "invisible instance was not parked: {calls:?}");
        assert!(!world.has::<DirtyTransform>(instances[0]));
    }

    #[test]
    fn frustum_culling_scenario() {
        // Given: camera at origin looking down -Z, 90 degree horizontal FOV;
        // instance A straight ahead, instance B far off to the side.
        let (mut world, _backend) = render_world();
        register_frustum_culling(&mut world, RenderSystemsConfig::default()).unwrap();
        let (_parent, _rid, instances) = spawn_multimesh(&mut world, 2);
        world
            .get_mut::<Transform3DComponent>(instances[0])
            .unwrap()
            .transform = Transform3D::from_origin(Vec3::new(0.0, 0.0, -5.0));
        world
            .get_mut::<Transform3DComponent>(instances[1])
            .unwrap()
            .transform = Transform3D::from_origin(Vec3::new(100.0, 0.0, 0.0));

        // When
        world.progress(0.016);

        // Then
        assert!(!world.has::<FrustumCulled>(instances[0]));
        assert!(world.has::<FrustumCulled>(instances[1]));
    }

    #[test]
    fn frustum_culling_honors_interval() {
        // Given a 16ms interval
        let (mut world, _backend) = render_world();
        register_frustum_culling(&mut world, RenderSystemsConfig::default()).unwrap();
        let (_parent, _rid, instances) = spawn_multimesh(&mut world, 1);
        world
            .get_mut::<Transform3DComponent>(instances[0])
            .unwrap()
            .transform = Transform3D::from_origin(Vec3::new(100.0, 0.0, 0.0));

        // When: a 1ms tick, not enough budget
        world.progress(0.001);
        assert!(!world.has::<FrustumCulled>(instances[0]));

        // And when the budget accumulates past 16ms
        world.progress(0.02);
        assert!(world.has::<FrustumCulled>(instances[0]));
    }

    #[test]
    fn mesh_render_flushes_dirty_visible_meshes() {
        // Given a dirty mesh instance
        let (mut world, backend) = render_world();
        register_mesh_render(&mut world).unwrap();
        let instance_rid = {
            let backend = world.render().unwrap();
            let scenario = backend.scenario_create();
            backend.instance_create(crate::ecs::handle::Rid::INVALID, scenario)
        };
        let entity = world.create_entity();
        world
            .attach(entity, MeshInstanceComponent { instance: instance_rid })
            .unwrap();
        world
            .attach(
                entity,
                Transform3DComponent {
                    transform: Transform3D::from_origin(Vec3::new(1.0, 2.0, 3.0)),
                },
            )
            .unwrap();
        world.attach(entity, VisibilityComponent { visible: true }).unwrap();
        world.attach(entity, DirtyTransform).unwrap();

        // When
        world.progress(0.016);

        // Then
        assert_eq!(backend.instance_transform_updates(instance_rid), 1);
        assert!(!world.has::<DirtyTransform>(entity));

        // Two consecutive ticks with no new mutation commit nothing new
        world.progress(0.0);
        world.progress(0.0);
        assert_eq!(backend.instance_transform_updates(instance_rid), 1);
    }

    #[test]
    fn occluded_mesh_keeps_stale_transform() {
        // Given an occluded dirty mesh
        let (mut world, backend) = render_world();
        register_mesh_render(&mut world).unwrap();
        let instance_rid = {
            let backend = world.render().unwrap();
            let scenario = backend.scenario_create();
            backend.instance_create(crate::ecs::handle::Rid::INVALID, scenario)
        };
        let entity = world.create_entity();
        world
            .attach(entity, MeshInstanceComponent { instance: instance_rid })
            .unwrap();
        world.attach(entity, Transform3DComponent::default()).unwrap();
        world.attach(entity, VisibilityComponent { visible: true }).unwrap();
        world.attach(entity, DirtyTransform).unwrap();
        world.attach(entity, Occluded).unwrap();

        // When
        world.progress(0.016);

        // Then: no backend call, transform still dirty
        assert_eq!(backend.instance_transform_updates(instance_rid), 0);
        assert!(world.has::<DirtyTransform>(entity));

        // And once visible again, the flush happens
        world.detach::<Occluded>(entity).unwrap();
        world.progress(0.016);
        assert_eq!(backend.instance_transform_updates(instance_rid), 1);
    }

    #[test]
    fn invalid_instance_handle_is_skipped() {
        // Given a mesh entity whose backend instance was freed
        let (mut world, backend) = render_world();
        register_mesh_render(&mut world).unwrap();
        let instance_rid = {
            let backend = world.render().unwrap();
            let scenario = backend.scenario_create();
            let rid = backend.instance_create(crate::ecs::handle::Rid::INVALID, scenario);
            backend.free(rid);
            rid
        };
        let entity = world.create_entity();
        world
            .attach(entity, MeshInstanceComponent { instance: instance_rid })
            .unwrap();
        world.attach(entity, Transform3DComponent::default()).unwrap();
        world.attach(entity, VisibilityComponent { visible: true }).unwrap();
        world.attach(entity, DirtyTransform).unwrap();

        // When
        world.progress(0.016);

        // Then: nothing recorded, world survives
        assert_eq!(backend.instance_transform_updates(instance_rid), 0);
    }
}
