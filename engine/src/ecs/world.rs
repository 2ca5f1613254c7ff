//! The world: entities, components, queries, systems, and the tick loop.
//!
//! A [`World`] owns its entity registry, component store, query cache,
//! system set, pipeline, and per-world singletons (the [`World3D`] resource
//! handles, the frame counter, an optional main camera, and the window
//! size). [`progress`](World::progress) runs one tick: phases in topological
//! order, systems per phase grouped by access conflicts, and a command-queue
//! drain at every phase boundary.
//!
//! # Concurrency model
//!
//! The main thread owns the world. During a phase, groups of
//! non-conflicting systems execute (`multi_threaded` ones fan their entity
//! batches out to the worker pool) holding only `&World`. Component writes
//! from workers reach exactly one column each, through the store's
//! per-column cells, under the scheduler's guarantee that no two
//! concurrently running systems write the same column and no two batches of
//! one system share an entity. Structural changes (spawn, despawn, attach,
//! detach) and backend calls are deferred through the command queue and
//! applied on the main thread between phases.
//!
//! # Change ticks
//!
//! The world keeps a monotonically increasing change tick, bumped at every
//! phase boundary *before* the drain. Mutations stamp the current tick;
//! a system's `detect_changes` query remembers the tick it last ran at.
//! Because the drain stamps a strictly larger tick than any system that ran
//! in the phase, attachments enqueued during a system run become visible to
//! every system's next execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::core::tasks::WorkerPool;
use crate::ecs::command::CommandQueue;
use crate::ecs::component::{self, Component, ComponentId, ErasedValue};
use crate::ecs::entity::{self, Entity};
use crate::ecs::error::EcsError;
use crate::ecs::handle::Rid;
use crate::ecs::pipeline::{PhaseId, Pipeline};
use crate::ecs::query::{Filter, Query};
use crate::ecs::storage::Store;
use crate::ecs::system::{self, System, SystemDesc};
use crate::render::backend::RenderBackend;

/// Identifies a world within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldId(u32);

impl WorldId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Per-world host resource handles, allocated by the runtime at world
/// creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct World3D {
    pub scenario: Rid,
    pub space: Rid,
    pub navigation_map: Rid,
    pub fallback_environment: Rid,
}

/// A self-contained universe of entities, components, systems, and a
/// pipeline.
pub struct World {
    id: WorldId,
    name: String,
    entities: entity::Registry,
    registry: component::Registry,
    /// Columns carry their own cells; workers write disjoint columns
    /// through per-column raw pointers while the world is shared. See the
    /// store's own safety notes.
    store: Store,
    entity_names: HashMap<Entity, String>,
    names_reverse: HashMap<String, Entity>,
    host_queries: HashMap<u64, Query>,
    next_query_handle: u64,
    systems: Vec<System>,
    pipeline: Pipeline,
    commands: Arc<CommandQueue>,
    workers: Arc<WorkerPool>,
    change_tick: u64,
    frame: u64,
    window_size: (u32, u32),
    main_camera: Option<Entity>,
    world3d: World3D,
    render: Option<Box<dyn RenderBackend>>,
    /// Backend handles already reported invalid; each is logged once.
    warned_rids: HashSet<Rid>,
    /// The FrameCounter singleton: advanced by the multimesh render system
    /// as instances flush, driving its round-robin batching.
    frame_counter: AtomicU64,
}

// SAFETY: `World` is shared (`&World`) with worker threads only while a
// phase group executes. In that window:
// - plain fields (names, pipeline, singletons) are only ever read,
// - `entities`, `registry`, `commands`, and the store discharge their own
//   `Sync` contracts (the store's under the scheduler's column-exclusivity
//   guarantee),
// - the render backend (`Box<dyn RenderBackend>`, `Send` but not `Sync`) is
//   reachable only through `&mut World`, which cannot exist while the world
//   is shared.
unsafe impl Sync for World {}

impl World {
    pub fn new(id: WorldId, name: impl Into<String>) -> Self {
        Self::with_workers(id, name, Arc::new(WorkerPool::default_pool()))
    }

    pub fn with_workers(id: WorldId, name: impl Into<String>, workers: Arc<WorkerPool>) -> Self {
        Self {
            id,
            name: name.into(),
            entities: entity::Registry::new(),
            registry: component::Registry::new(),
            store: Store::new(),
            entity_names: HashMap::new(),
            names_reverse: HashMap::new(),
            host_queries: HashMap::new(),
            next_query_handle: 1,
            systems: Vec::new(),
            pipeline: Pipeline::new(),
            commands: Arc::new(CommandQueue::new()),
            workers,
            change_tick: 1,
            frame: 0,
            window_size: (320, 180),
            main_camera: None,
            world3d: World3D::default(),
            render: None,
            warned_rids: HashSet::new(),
            frame_counter: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> WorldId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn entities(&self) -> &entity::Registry {
        &self.entities
    }

    #[inline]
    pub fn registry(&self) -> &component::Registry {
        &self.registry
    }

    #[inline]
    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn commands_arc(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.commands)
    }

    #[inline]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// The tick counter: incremented once per `progress`.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// The change tick mutations are currently stamped with.
    #[inline]
    pub fn change_tick(&self) -> u64 {
        self.change_tick
    }

    /// The FrameCounter singleton consumed by the multimesh render system.
    #[inline]
    pub fn frame_counter(&self) -> &AtomicU64 {
        &self.frame_counter
    }

    #[inline]
    pub fn window_size(&self) -> (u32, u32) {
        self.window_size
    }

    pub fn set_window_size(&mut self, width: u32, height: u32) {
        self.window_size = (width, height);
    }

    #[inline]
    pub fn main_camera(&self) -> Option<Entity> {
        self.main_camera.filter(|&e| self.entities.is_live(e))
    }

    pub fn set_main_camera(&mut self, camera: Option<Entity>) {
        self.main_camera = camera;
    }

    #[inline]
    pub fn world3d(&self) -> &World3D {
        &self.world3d
    }

    pub fn set_world3d(&mut self, world3d: World3D) {
        self.world3d = world3d;
    }

    // ===================== store access =====================

    /// Shared store access. Concurrent column *writes* are excluded by the
    /// scheduler; see the store's safety notes.
    #[inline]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    #[inline]
    fn store_exclusive(&mut self) -> &mut Store {
        &mut self.store
    }

    fn sync_store(&mut self) {
        let infos = self.registry.infos();
        self.store.sync(&infos);
    }

    // ===================== component registration =====================

    pub fn register<T: Component>(&mut self) -> Result<ComponentId, EcsError> {
        let id = self.registry.register::<T>()?;
        self.sync_store();
        Ok(id)
    }

    pub fn register_serde<T>(&mut self) -> Result<ComponentId, EcsError>
    where
        T: Component + serde::Serialize + serde::de::DeserializeOwned,
    {
        let id = self.registry.register_serde::<T>()?;
        self.sync_store();
        Ok(id)
    }

    pub fn register_dynamic(&mut self, name: &str, is_tag: bool) -> Result<ComponentId, EcsError> {
        let id = self.registry.register_dynamic(name, is_tag)?;
        self.sync_store();
        Ok(id)
    }

    #[inline]
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.registry.id_of::<T>()
    }

    #[inline]
    pub fn component_id(&self, name: &str) -> Option<ComponentId> {
        self.registry.id_by_name(name)
    }

    // ===================== entities =====================

    /// Allocate an entity handle. Callable from any thread; attaching
    /// components from workers must go through the command queue.
    pub fn create_entity(&self) -> Entity {
        self.entities.allocate()
    }

    /// Destroy an entity and every component attached to it. Main thread
    /// only; workers defer through the command queue.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<(), EcsError> {
        if !self.entities.free(entity) {
            return Err(EcsError::DeadEntity(entity));
        }
        self.store_exclusive().remove_entity(entity);
        if let Some(name) = self.entity_names.remove(&entity) {
            self.names_reverse.remove(&name);
        }
        Ok(())
    }

    #[inline]
    pub fn is_live(&self, entity: Entity) -> bool {
        self.entities.is_live(entity)
    }

    pub fn set_name(&mut self, entity: Entity, name: impl Into<String>) -> Result<(), EcsError> {
        if !self.entities.is_live(entity) {
            return Err(EcsError::DeadEntity(entity));
        }
        let name = name.into();
        if let Some(old) = self.entity_names.insert(entity, name.clone()) {
            self.names_reverse.remove(&old);
        }
        self.names_reverse.insert(name, entity);
        Ok(())
    }

    pub fn get_name(&self, entity: Entity) -> Option<&str> {
        self.entity_names.get(&entity).map(|s| s.as_str())
    }

    pub fn find_entity_by_name(&self, name: &str) -> Option<Entity> {
        self.names_reverse
            .get(name)
            .copied()
            .filter(|&e| self.entities.is_live(e))
    }

    // ===================== components =====================

    /// Insert or overwrite a component. Main thread only (workers defer
    /// through the command queue).
    pub fn attach<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        if !self.entities.is_live(entity) {
            log::warn!("attach on dead entity {entity}");
            return Err(EcsError::DeadEntity(entity));
        }
        let id = self
            .registry
            .id_of::<T>()
            .ok_or_else(|| EcsError::UnknownComponent(T::NAME.to_string()))?;
        let tick = self.change_tick;
        self.store_exclusive()
            .column_mut(id)
            .expect("store out of sync with registry")
            .insert(entity, value, tick);
        Ok(())
    }

    /// Type-erased attach used by the drain path and replication.
    pub fn attach_erased(
        &mut self,
        entity: Entity,
        id: ComponentId,
        value: Option<ErasedValue>,
    ) -> Result<(), EcsError> {
        if !self.entities.is_live(entity) {
            return Err(EcsError::DeadEntity(entity));
        }
        let info = self
            .registry
            .info(id)
            .ok_or_else(|| EcsError::UnknownComponent(format!("#{}", id.raw())))?;
        let tick = self.change_tick;
        let column = self
            .store_exclusive()
            .column_mut(id)
            .expect("store out of sync with registry");
        if !column.insert_erased(entity, value, tick) {
            return Err(EcsError::Serialization(info.name));
        }
        Ok(())
    }

    /// Attach from wire/host bytes: typed components go through their
    /// deserialize hook, dynamic components store the blob, tags ignore the
    /// payload.
    pub fn attach_bytes(
        &mut self,
        entity: Entity,
        id: ComponentId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        let info = self
            .registry
            .info(id)
            .ok_or_else(|| EcsError::UnknownComponent(format!("#{}", id.raw())))?;
        let value: Option<ErasedValue> = if info.is_tag {
            None
        } else if let Some(deserialize) = info.deserialize {
            Some(deserialize(bytes).ok_or_else(|| EcsError::Serialization(info.name.clone()))?)
        } else if info.type_id.is_none() {
            Some(Box::new(bytes.to_vec()))
        } else {
            return Err(EcsError::Serialization(info.name.clone()));
        };
        self.attach_erased(entity, id, value)
    }

    /// Remove a component; idempotent.
    pub fn detach<T: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let id = self
            .registry
            .id_of::<T>()
            .ok_or_else(|| EcsError::UnknownComponent(T::NAME.to_string()))?;
        self.detach_id(entity, id)
    }

    pub fn detach_id(&mut self, entity: Entity, id: ComponentId) -> Result<(), EcsError> {
        if !self.entities.is_live(entity) {
            return Err(EcsError::DeadEntity(entity));
        }
        if let Some(column) = self.store_exclusive().column_mut(id) {
            column.remove(entity);
        }
        Ok(())
    }

    #[inline]
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.registry
            .id_of::<T>()
            .is_some_and(|id| self.has_id(entity, id))
    }

    #[inline]
    pub fn has_id(&self, entity: Entity, id: ComponentId) -> bool {
        self.entities.is_live(entity)
            && self
                .store()
                .column(id)
                .is_some_and(|column| column.contains(entity))
    }

    #[inline]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        if !self.entities.is_live(entity) {
            return None;
        }
        self.store().column(self.registry.id_of::<T>()?)?.get(entity)
    }

    /// Mutable access; stamps the component's change tick.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.entities.is_live(entity) {
            return None;
        }
        let id = self.registry.id_of::<T>()?;
        let tick = self.change_tick;
        self.store_exclusive().column_mut(id)?.get_mut(entity, tick)
    }

    /// Serialize one component to wire bytes. Tags serialize to an empty
    /// payload; unknown or non-serializable types return `None`.
    pub fn serialize_component(&self, entity: Entity, id: ComponentId) -> Option<Vec<u8>> {
        let info = self.registry.info(id)?;
        let column = self.store().column(id)?;
        if !column.contains(entity) {
            return None;
        }
        if info.is_tag {
            return Some(Vec::new());
        }
        if let Some(serialize) = info.serialize {
            return serialize(column.value_any(entity)?);
        }
        if info.type_id.is_none() {
            return column.get_blob(entity).map(|b| b.to_vec());
        }
        None
    }

    /// The component's change tick, used by replication's dirty tracking.
    pub fn component_change_tick(&self, entity: Entity, id: ComponentId) -> Option<u64> {
        self.store().column(id)?.change_tick(entity)
    }

    /// A debugger-facing view of one component. Pair components always
    /// report empty data; values without an inspect hook report null.
    pub fn inspect_component(&self, entity: Entity, id: ComponentId) -> serde_json::Value {
        let Some(info) = self.registry.info(id) else {
            return serde_json::Value::Null;
        };
        if info.is_pair || info.is_tag {
            return serde_json::Value::Object(serde_json::Map::new());
        }
        match (info.inspect, self.store().column(id).and_then(|c| c.value_any(entity))) {
            (Some(inspect), Some(value)) => inspect(value),
            _ => serde_json::Value::Null,
        }
    }

    // ===================== queries =====================

    /// Compile (or re-use) a cached query and hand out a handle.
    pub fn create_query(&mut self, filter: Filter) -> u64 {
        let handle = self.next_query_handle;
        self.next_query_handle += 1;
        self.host_queries.insert(handle, Query::new(filter));
        handle
    }

    /// Page through a query's results. A `detect_changes` query advances its
    /// reference tick on every call.
    pub fn query_entities(
        &mut self,
        handle: u64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Entity>, EcsError> {
        let tick = self.change_tick;
        let store = &self.store;
        let query = self
            .host_queries
            .get_mut(&handle)
            .ok_or(EcsError::UnknownQuery)?;
        let all = query.collect(store);
        if query.filter().detects_changes() {
            query.mark_run(tick);
        }
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    pub fn query_count(&self, handle: u64) -> Result<usize, EcsError> {
        let query = self.host_queries.get(&handle).ok_or(EcsError::UnknownQuery)?;
        Ok(query.count(self.store()))
    }

    pub fn free_query(&mut self, handle: u64) -> Result<(), EcsError> {
        self.host_queries
            .remove(&handle)
            .map(|_| ())
            .ok_or(EcsError::UnknownQuery)
    }

    // ===================== phases & systems =====================

    pub fn create_phase(
        &mut self,
        name: &str,
        depends_on: Option<&str>,
    ) -> Result<PhaseId, EcsError> {
        self.pipeline.create_phase(name, depends_on)
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Register a system. Duplicate names and unknown phases are fatal
    /// registration errors.
    pub fn register_system(&mut self, desc: SystemDesc) -> Result<(), EcsError> {
        if self.systems.iter().any(|s| s.name == desc.name) {
            return Err(EcsError::DuplicateSystem(desc.name));
        }
        let phase = self.pipeline.id_of(&desc.phase)?;
        self.sync_store();
        self.systems.push(System::new(desc, phase));
        Ok(())
    }

    pub fn set_system_paused(&mut self, name: &str, paused: bool) -> Result<(), EcsError> {
        let system = self
            .systems
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| EcsError::DuplicateSystem(name.to_string()))?;
        system.paused = paused;
        Ok(())
    }

    #[inline]
    pub fn systems(&self) -> &[System] {
        &self.systems
    }

    // ===================== render backend =====================

    pub fn set_render_backend(&mut self, backend: Box<dyn RenderBackend>) {
        self.render = Some(backend);
    }

    /// The render backend, main thread only (reached through `&mut World`
    /// during the command drain).
    pub fn render(&mut self) -> Option<&mut (dyn RenderBackend + 'static)> {
        self.render.as_deref_mut()
    }

    /// Record an invalid backend handle; returns true the first time so the
    /// caller logs exactly once per RID.
    pub fn warn_invalid_rid_once(&mut self, rid: Rid) -> bool {
        self.warned_rids.insert(rid)
    }

    // ===================== tick =====================

    /// Run one tick. Returns `false` only when the schedule is unrunnable
    /// (phase dependency cycle).
    pub fn progress(&mut self, delta: f32) -> bool {
        self.frame += 1;
        for system in &mut self.systems {
            system.accumulator += delta;
            system.failed = false;
        }

        let order = match self.pipeline.topological_order() {
            Ok(order) => order.to_vec(),
            Err(error) => {
                log::error!("world `{}` schedule rejected: {error}", self.name);
                return false;
            }
        };

        for phase in order {
            self.run_phase(phase, delta);
            // Bump before draining so command effects are visible to every
            // system's next run, including systems that ran this phase.
            self.change_tick += 1;
            let commands = Arc::clone(&self.commands);
            commands.drain(self);
        }
        true
    }

    fn run_phase(&mut self, phase: PhaseId, delta: f32) {
        let due: Vec<usize> = self
            .systems
            .iter()
            .enumerate()
            .filter(|(_, s)| s.phase == phase && s.due())
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }

        // Group consecutive non-conflicting systems. A system joins the last
        // open group only if it conflicts with none of its members; a
        // conflicting system opens a new group, which preserves registration
        // order for overlapping write sets.
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for &index in &due {
            let access = self.systems[index].query.access();
            let joins = groups.last().is_some_and(|group| {
                group
                    .iter()
                    .all(|&member| !access.conflicts_with(self.systems[member].query.access()))
            });
            match groups.last_mut() {
                Some(group) if joins => group.push(index),
                _ => groups.push(vec![index]),
            }
        }

        let tick = self.change_tick;
        let workers = Arc::clone(&self.workers);
        let mut systems = std::mem::take(&mut self.systems);
        let world: &World = &*self;

        for group in groups {
            let prepared: Vec<(usize, Vec<Vec<Entity>>)> = group
                .iter()
                .map(|&index| (index, systems[index].collect_batches(world)))
                .collect();

            struct RunState {
                panicked: AtomicBool,
                nanos: AtomicU64,
            }
            let states: Vec<RunState> = prepared
                .iter()
                .map(|_| RunState {
                    panicked: AtomicBool::new(false),
                    nanos: AtomicU64::new(0),
                })
                .collect();

            // Non-parallel members run here on the main thread; parallel
            // members contribute one task per batch to a single dispatch
            // group, whose completion is the phase-group barrier.
            let mut tasks: Vec<crate::core::tasks::GroupTask<'_>> = Vec::new();
            for ((index, batches), state) in prepared.iter().zip(&states) {
                let sys = &systems[*index];
                if sys.multi_threaded {
                    for batch in batches {
                        let run = Arc::clone(&sys.run);
                        let name: &str = &sys.name;
                        let batch: &[Entity] = batch;
                        let state: &RunState = state;
                        tasks.push(Box::new(move || {
                            system::run_batch(
                                &run,
                                name,
                                world,
                                batch,
                                delta,
                                tick,
                                &state.panicked,
                                &state.nanos,
                            );
                        }));
                    }
                } else {
                    for batch in batches {
                        system::run_batch(
                            &sys.run,
                            &sys.name,
                            world,
                            batch,
                            delta,
                            tick,
                            &state.panicked,
                            &state.nanos,
                        );
                    }
                }
            }
            workers.run_group(tasks);

            for ((index, batches), state) in prepared.iter().zip(&states) {
                let entity_count = batches.iter().map(|b| b.len() as u64).sum();
                system::finish_run(
                    &mut systems[*index],
                    tick,
                    entity_count,
                    state.panicked.load(Ordering::Relaxed),
                    state.nanos.load(Ordering::Relaxed),
                );
            }
        }

        self.systems = systems;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::ecs::pipeline::phases;
    use crate::{component, tag};

    use super::*;

    #[derive(Debug, PartialEq, Clone)]
    struct Health {
        hp: u32,
    }
    component!(Health, "Health");

    #[derive(Debug, PartialEq)]
    struct Position {
        x: f32,
    }
    component!(Position, "Position");

    struct Frozen;
    tag!(Frozen, "Frozen");

    fn test_world() -> World {
        World::with_workers(
            WorldId::new(0),
            "test",
            Arc::new(WorkerPool::new(2)),
        )
    }

    #[test]
    fn has_iff_get_returns_value() {
        // Given
        let mut world = test_world();
        world.register::<Health>().unwrap();
        let e = world.create_entity();

        // Then: before attach, both deny
        assert!(!world.has::<Health>(e));
        assert!(world.get::<Health>(e).is_none());

        // When
        world.attach(e, Health { hp: 5 }).unwrap();

        // Then: both agree
        assert!(world.has::<Health>(e));
        assert_eq!(world.get::<Health>(e), Some(&Health { hp: 5 }));
    }

    #[test]
    fn attach_then_detach_restores_pre_attach_state() {
        let mut world = test_world();
        world.register::<Health>().unwrap();
        let e = world.create_entity();

        world.attach(e, Health { hp: 5 }).unwrap();
        world.detach::<Health>(e).unwrap();

        assert!(!world.has::<Health>(e));
        assert!(world.get::<Health>(e).is_none());
        // Detach is idempotent
        assert!(world.detach::<Health>(e).is_ok());
    }

    #[test]
    fn dead_entities_reject_operations() {
        let mut world = test_world();
        world.register::<Health>().unwrap();
        let e = world.create_entity();
        world.destroy_entity(e).unwrap();

        assert!(matches!(
            world.attach(e, Health { hp: 1 }),
            Err(EcsError::DeadEntity(_))
        ));
        assert!(!world.has::<Health>(e));
        assert!(matches!(
            world.destroy_entity(e),
            Err(EcsError::DeadEntity(_))
        ));
    }

    #[test]
    fn destroying_entity_clears_components_and_name() {
        let mut world = test_world();
        world.register::<Health>().unwrap();
        let e = world.create_entity();
        world.attach(e, Health { hp: 5 }).unwrap();
        world.set_name(e, "boss").unwrap();

        world.destroy_entity(e).unwrap();

        assert!(world.find_entity_by_name("boss").is_none());
        assert!(!world.has::<Health>(e));
    }

    #[test]
    fn entity_names_resolve_both_ways() {
        let mut world = test_world();
        let e = world.create_entity();
        world.set_name(e, "player").unwrap();

        assert_eq!(world.get_name(e), Some("player"));
        assert_eq!(world.find_entity_by_name("player"), Some(e));

        // Renaming drops the old key
        world.set_name(e, "hero").unwrap();
        assert!(world.find_entity_by_name("player").is_none());
        assert_eq!(world.find_entity_by_name("hero"), Some(e));
    }

    #[test]
    fn pipeline_ordering_scenario() {
        // Given: phase B depends on phase A
        let mut world = test_world();
        world.create_phase("A", None).unwrap();
        world.create_phase("B", Some("A")).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = Arc::clone(&order);
        let order_b = Arc::clone(&order);

        world
            .register_system(
                SystemDesc::new("S_A", move |_| {
                    order_a.lock().unwrap().push(1);
                })
                .phase("A"),
            )
            .unwrap();
        world
            .register_system(
                SystemDesc::new("S_B", move |_| {
                    order_b.lock().unwrap().push(2);
                })
                .phase("B"),
            )
            .unwrap();

        // When
        assert!(world.progress(0.016));

        // Then
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn command_drain_barrier_scenario() {
        // Given: S_A (OnUpdate) defers a Health attach; S_B (PostUpdate)
        // reads it in the same tick.
        let mut world = test_world();
        world.register::<Health>().unwrap();
        let entity = world.create_entity();

        let seen = Arc::new(Mutex::new(None));
        let seen_reader = Arc::clone(&seen);

        world
            .register_system(
                SystemDesc::new("S_A", move |iter| {
                    let _ = iter.commands().enqueue(move |world: &mut World| {
                        let _ = world.attach(entity, Health { hp: 10 });
                    });
                })
                .phase(phases::ON_UPDATE),
            )
            .unwrap();
        world
            .register_system(
                SystemDesc::new("S_B", move |iter| {
                    *seen_reader.lock().unwrap() =
                        iter.world().get::<Health>(entity).map(|h| h.hp);
                })
                .phase(phases::POST_UPDATE),
            )
            .unwrap();

        // When
        world.progress(0.016);

        // Then: the PostUpdate system observed the drained command
        assert_eq!(*seen.lock().unwrap(), Some(10));
    }

    #[test]
    fn queue_is_empty_after_progress() {
        let mut world = test_world();
        world
            .register_system(SystemDesc::new("spammer", |iter| {
                for _ in 0..10 {
                    let _ = iter.commands().enqueue(|_: &mut World| {});
                }
            }))
            .unwrap();

        world.progress(0.016);
        assert!(world.commands().is_empty());
    }

    #[test]
    fn interval_systems_respect_their_budget() {
        // Given a 50ms interval system ticked at 20ms
        let mut world = test_world();
        let runs = Arc::new(Mutex::new(0));
        let runs_clone = Arc::clone(&runs);
        world
            .register_system(
                SystemDesc::new("slow", move |_| {
                    *runs_clone.lock().unwrap() += 1;
                })
                .interval(0.05),
            )
            .unwrap();

        // When: five 20ms ticks = 100ms of budget
        for _ in 0..5 {
            world.progress(0.02);
        }

        // Then: ran twice (at 60ms and 100ms of accumulated time)
        assert_eq!(*runs.lock().unwrap(), 2);
    }

    #[test]
    fn panicking_system_is_isolated() {
        // Given: a panicking system followed by a healthy one
        let mut world = test_world();
        let healthy_runs = Arc::new(Mutex::new(0));
        let healthy_clone = Arc::clone(&healthy_runs);

        world
            .register_system(SystemDesc::new("bomb", |_| panic!("boom")))
            .unwrap();
        world
            .register_system(SystemDesc::new("healthy", move |_| {
                *healthy_clone.lock().unwrap() += 1;
            }))
            .unwrap();

        // When: two ticks
        assert!(world.progress(0.016));
        assert!(world.progress(0.016));

        // Then: the healthy system ran every tick; the world survived
        assert_eq!(*healthy_runs.lock().unwrap(), 2);
    }

    #[test]
    fn conflicting_systems_run_in_registration_order() {
        // Given two writers of the same column
        let mut world = test_world();
        let pos = world.register::<Position>().unwrap();
        let e = world.create_entity();
        world.attach(e, Position { x: 0.0 }).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let log1 = Arc::clone(&log);
        let log2 = Arc::clone(&log);

        world
            .register_system(
                SystemDesc::new("first_writer", move |_| {
                    log1.lock().unwrap().push("first");
                })
                .filter(Filter::new().write(pos))
                .multi_threaded(true),
            )
            .unwrap();
        world
            .register_system(
                SystemDesc::new("second_writer", move |_| {
                    log2.lock().unwrap().push("second");
                })
                .filter(Filter::new().write(pos))
                .multi_threaded(true),
            )
            .unwrap();

        // When
        world.progress(0.016);

        // Then
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn multi_threaded_system_mutates_through_iter() {
        // Given a writer over many entities
        let mut world = test_world();
        let pos = world.register::<Position>().unwrap();
        let entities: Vec<Entity> = (0..600)
            .map(|i| {
                let e = world.create_entity();
                world.attach(e, Position { x: i as f32 }).unwrap();
                e
            })
            .collect();

        world
            .register_system(
                SystemDesc::new("mover", |iter| {
                    for &e in iter.entities() {
                        if let Some(p) = iter.get_mut::<Position>(e) {
                            p.x += 1.0;
                        }
                    }
                })
                .filter(Filter::new().write(pos))
                .multi_threaded(true),
            )
            .unwrap();

        // When
        world.progress(0.016);

        // Then
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(world.get::<Position>(e).unwrap().x, i as f32 + 1.0);
        }
    }

    #[test]
    fn duplicate_system_name_is_fatal_at_registration() {
        let mut world = test_world();
        world.register_system(SystemDesc::new("dup", |_| {})).unwrap();
        assert!(matches!(
            world.register_system(SystemDesc::new("dup", |_| {})),
            Err(EcsError::DuplicateSystem(_))
        ));
    }

    #[test]
    fn unknown_phase_is_fatal_at_registration() {
        let mut world = test_world();
        assert!(matches!(
            world.register_system(SystemDesc::new("ghost", |_| {}).phase("NoSuchPhase")),
            Err(EcsError::UnknownPhase(_))
        ));
    }

    #[test]
    fn host_query_pages_and_counts() {
        // Given
        let mut world = test_world();
        let pos = world.register::<Position>().unwrap();
        for i in 0..10 {
            let e = world.create_entity();
            world.attach(e, Position { x: i as f32 }).unwrap();
        }

        // When
        let handle = world.create_query(Filter::new().read(pos));

        // Then
        assert_eq!(world.query_count(handle).unwrap(), 10);
        let page = world.query_entities(handle, 4, 2).unwrap();
        assert_eq!(page.len(), 4);
        world.free_query(handle).unwrap();
        assert!(world.query_count(handle).is_err());
    }

    #[test]
    fn tag_attach_via_typed_path() {
        let mut world = test_world();
        world.register::<Frozen>().unwrap();
        let e = world.create_entity();
        world.attach(e, Frozen).unwrap();
        assert!(world.has::<Frozen>(e));
    }

    #[test]
    fn deferred_attach_detected_by_change_query() {
        // Given: a detect_changes system watching Health, and a producer
        // that defers an attach through the queue.
        let mut world = test_world();
        let health = world.register::<Health>().unwrap();
        let entity = world.create_entity();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        world
            .register_system(
                SystemDesc::new("watcher", move |iter| {
                    for &e in iter.entities() {
                        seen_clone.lock().unwrap().push(e);
                    }
                })
                .filter(Filter::new().read(health).detect_changes())
                .phase(phases::ON_UPDATE),
            )
            .unwrap();

        // When: tick 1 enqueues the attach from outside, drain applies it
        let _ = world.commands().enqueue(move |world: &mut World| {
            let _ = world.attach(entity, Health { hp: 3 });
        });
        world.progress(0.016); // drain happens at phase boundaries
        world.progress(0.016); // watcher sees the new component
        world.progress(0.016); // no further changes: watcher stays quiet

        // Then: exactly one sighting
        assert_eq!(*seen.lock().unwrap(), vec![entity]);
    }
}
