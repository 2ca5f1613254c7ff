//! The process-wide runtime: world lifecycle plus the host-facing API.
//!
//! The original embedding exposed these operations through a global server
//! singleton; here the singleton collapses into an explicit [`Runtime`]
//! value with `new`/`shutdown`; the host decides whether to make it
//! global. The runtime never assumes a single world: worlds are slots in a
//! handle registry, addressed by [`Rid`].
//!
//! Backends are injected once at construction. The physics space and
//! navigation map hosts are shared by every world (only creation and
//! teardown flow through them); each world receives its own render backend
//! handle at creation, which the command drain consumes on the main thread.

use std::sync::Arc;

use crate::core::tasks::WorkerPool;
use crate::ecs::entity::Entity;
use crate::ecs::error::EcsError;
use crate::ecs::handle::{HandleRegistry, Rid};
use crate::ecs::query::Filter;
use crate::ecs::system::SystemDesc;
use crate::ecs::world::{World, World3D, WorldId};
use crate::render::backend::{NavigationBackend, RenderBackend, SpaceBackend};

/// A query filter described by component names, the host-facing mirror of
/// [`Filter`].
#[derive(Debug, Clone, Default)]
pub struct QueryDesc {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub with: Vec<String>,
    pub without: Vec<String>,
    pub detect_changes: bool,
}

/// The embedding-facing runtime owning every world.
pub struct Runtime {
    worlds: HandleRegistry<World>,
    workers: Arc<WorkerPool>,
    space: Box<dyn SpaceBackend>,
    navigation: Box<dyn NavigationBackend>,
    next_world_id: u32,
}

impl Runtime {
    /// Initialize the runtime with its host backends and a worker pool
    /// bounded by `max_threads`.
    pub fn new(
        space: Box<dyn SpaceBackend>,
        navigation: Box<dyn NavigationBackend>,
        max_threads: usize,
    ) -> Self {
        Self {
            worlds: HandleRegistry::new(),
            workers: Arc::new(WorkerPool::with_max_threads(max_threads)),
            space,
            navigation,
            next_world_id: 0,
        }
    }

    /// Tear the runtime down, destroying every world.
    pub fn shutdown(mut self) {
        let mut rids = Vec::new();
        self.worlds.for_each(|rid, _| rids.push(rid));
        for rid in rids {
            let _ = self.destroy_world(rid);
        }
    }

    #[inline]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }

    // ===================== world lifecycle =====================

    /// Create a world, allocating its scenario/space/navigation singletons
    /// from the backends.
    pub fn create_world(
        &mut self,
        name: &str,
        mut render: Box<dyn RenderBackend>,
    ) -> Rid {
        let world3d = World3D {
            scenario: render.scenario_create(),
            fallback_environment: render.environment_create(),
            space: self.space.space_create(),
            navigation_map: self.navigation.map_create(),
        };
        let id = WorldId::new(self.next_world_id);
        self.next_world_id += 1;
        let mut world = World::with_workers(id, name, Arc::clone(&self.workers));
        world.set_render_backend(render);
        world.set_world3d(world3d);
        self.worlds.insert(world)
    }

    /// Destroy a world and release its backend singletons.
    pub fn destroy_world(&mut self, rid: Rid) -> Result<(), EcsError> {
        let mut world = self.worlds.remove(rid).ok_or(EcsError::UnknownWorld)?;
        let world3d = *world.world3d();
        if let Some(render) = world.render() {
            render.free(world3d.scenario);
            render.free(world3d.fallback_environment);
        }
        self.space.free(world3d.space);
        self.navigation.free(world3d.navigation_map);
        Ok(())
    }

    /// Advance one world by `delta` seconds.
    pub fn progress(&self, rid: Rid, delta: f32) -> Result<bool, EcsError> {
        self.worlds
            .with_mut(rid, |world| world.progress(delta))
            .ok_or(EcsError::UnknownWorld)
    }

    /// Run `f` with shared access to a world.
    pub fn with_world<R>(&self, rid: Rid, f: impl FnOnce(&World) -> R) -> Result<R, EcsError> {
        self.worlds.with(rid, f).ok_or(EcsError::UnknownWorld)
    }

    /// Run `f` with exclusive access to a world.
    pub fn with_world_mut<R>(
        &self,
        rid: Rid,
        f: impl FnOnce(&mut World) -> R,
    ) -> Result<R, EcsError> {
        self.worlds.with_mut(rid, f).ok_or(EcsError::UnknownWorld)
    }

    /// Visit every world (diagnostics, debugger).
    pub fn for_each_world(&self, mut f: impl FnMut(Rid, &World)) {
        self.worlds.for_each(|rid, world| f(rid, world));
    }

    // ===================== entities =====================

    pub fn create_entity(&self, world: Rid) -> Result<Entity, EcsError> {
        self.with_world(world, |w| w.create_entity())
    }

    pub fn destroy_entity(&self, world: Rid, entity: Entity) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.destroy_entity(entity))?
    }

    pub fn set_name(&self, world: Rid, entity: Entity, name: &str) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.set_name(entity, name))?
    }

    pub fn get_name(&self, world: Rid, entity: Entity) -> Result<Option<String>, EcsError> {
        self.with_world(world, |w| w.get_name(entity).map(str::to_string))
    }

    // ===================== components =====================

    /// Register a dynamic component type by descriptor; Rust-typed
    /// components register through `with_world_mut` and the typed API.
    pub fn register_component_type(
        &self,
        world: Rid,
        name: &str,
        is_tag: bool,
    ) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.register_dynamic(name, is_tag).map(|_| ()))?
    }

    pub fn attach(
        &self,
        world: Rid,
        entity: Entity,
        type_name: &str,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| {
            let id = w
                .component_id(type_name)
                .ok_or_else(|| EcsError::UnknownComponent(type_name.to_string()))?;
            w.attach_bytes(entity, id, bytes)
        })?
    }

    pub fn detach(&self, world: Rid, entity: Entity, type_name: &str) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| {
            let id = w
                .component_id(type_name)
                .ok_or_else(|| EcsError::UnknownComponent(type_name.to_string()))?;
            w.detach_id(entity, id)
        })?
    }

    pub fn has(&self, world: Rid, entity: Entity, type_name: &str) -> Result<bool, EcsError> {
        self.with_world(world, |w| {
            w.component_id(type_name)
                .is_some_and(|id| w.has_id(entity, id))
        })
    }

    /// A component's value as a dictionary, for host bindings.
    pub fn get(
        &self,
        world: Rid,
        entity: Entity,
        type_name: &str,
    ) -> Result<serde_json::Value, EcsError> {
        self.with_world(world, |w| {
            match w.component_id(type_name) {
                Some(id) if w.has_id(entity, id) => w.inspect_component(entity, id),
                _ => serde_json::Value::Null,
            }
        })
    }

    // ===================== queries =====================

    pub fn create_query(&self, world: Rid, desc: &QueryDesc) -> Result<u64, EcsError> {
        self.with_world_mut(world, |w| {
            let mut filter = Filter::new();
            let resolve = |w: &World, name: &String| {
                w.component_id(name)
                    .ok_or_else(|| EcsError::UnknownComponent(name.clone()))
            };
            for name in &desc.read {
                filter = filter.read(resolve(w, name)?);
            }
            for name in &desc.write {
                filter = filter.write(resolve(w, name)?);
            }
            for name in &desc.with {
                filter = filter.with(resolve(w, name)?);
            }
            for name in &desc.without {
                filter = filter.without(resolve(w, name)?);
            }
            if desc.detect_changes {
                filter = filter.detect_changes();
            }
            Ok(w.create_query(filter))
        })?
    }

    pub fn query_entities(
        &self,
        world: Rid,
        query: u64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Entity>, EcsError> {
        self.with_world_mut(world, |w| w.query_entities(query, limit, offset))?
    }

    pub fn query_count(&self, world: Rid, query: u64) -> Result<usize, EcsError> {
        self.with_world(world, |w| w.query_count(query))?
    }

    pub fn free_query(&self, world: Rid, query: u64) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.free_query(query))?
    }

    // ===================== systems =====================

    pub fn register_system(&self, world: Rid, desc: SystemDesc) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.register_system(desc))?
    }

    pub fn create_phase(
        &self,
        world: Rid,
        name: &str,
        depends_on: Option<&str>,
    ) -> Result<(), EcsError> {
        self.with_world_mut(world, |w| w.create_phase(name, depends_on).map(|_| ()))?
    }
}
