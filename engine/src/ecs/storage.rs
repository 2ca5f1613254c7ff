//! Per-world dense component storage.
//!
//! The store keeps one [`Column`] per registered component type. A column is
//! a sparse set: a dense array of entities, a parallel dense payload array,
//! and a sparse index keyed by entity slot. Query iteration walks dense
//! arrays in order with no per-entity indirection through the entity
//! registry; membership and random access are O(1) through the sparse index.
//!
//! # Change detection
//!
//! Every dense entry carries the world tick of its last mutation, and each
//! column tracks the highest tick it has seen. `detect_changes` queries
//! compare entry ticks against their last execution tick; no entity scan is
//! needed to answer "did anything change" (the column counter short-circuits
//! untouched columns).
//!
//! # Payload erasure
//!
//! Payloads live behind [`ColumnData`]: `Vec<T>` for Rust-typed components,
//! `Vec<Vec<u8>>` for dynamically registered blob components, nothing at all
//! for tags. Typed access downcasts once per column, not per entity.

use std::any::Any;

use crate::ecs::component::{Component, ComponentId, ComponentInfo, ErasedValue};
use crate::ecs::entity::Entity;

const INVALID_SLOT: u32 = u32::MAX;

/// Dense payload storage for one column.
pub trait ColumnData: Send + Sync {
    fn len(&self) -> usize;
    /// Remove `slot` by swapping the last entry in.
    fn swap_remove(&mut self, slot: usize);
    /// Append an erased value; `false` if the concrete type does not match.
    fn push_erased(&mut self, value: ErasedValue) -> bool;
    /// Overwrite `slot` with an erased value; `false` on type mismatch.
    fn replace_erased(&mut self, slot: usize, value: ErasedValue) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// The value at `slot` as `&dyn Any` (for serialize/inspect hooks).
    fn value_any(&self, slot: usize) -> Option<&dyn Any>;
}

struct TypedData<T>(Vec<T>);

impl<T: Send + Sync + 'static> ColumnData for TypedData<T> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn swap_remove(&mut self, slot: usize) {
        self.0.swap_remove(slot);
    }

    fn push_erased(&mut self, value: ErasedValue) -> bool {
        match value.downcast::<T>() {
            Ok(value) => {
                self.0.push(*value);
                true
            }
            Err(_) => false,
        }
    }

    fn replace_erased(&mut self, slot: usize, value: ErasedValue) -> bool {
        match value.downcast::<T>() {
            Ok(value) => {
                self.0[slot] = *value;
                true
            }
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn value_any(&self, slot: usize) -> Option<&dyn Any> {
        self.0.get(slot).map(|v| v as &dyn Any)
    }
}

struct BlobData(Vec<Vec<u8>>);

impl ColumnData for BlobData {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn swap_remove(&mut self, slot: usize) {
        self.0.swap_remove(slot);
    }

    fn push_erased(&mut self, value: ErasedValue) -> bool {
        match value.downcast::<Vec<u8>>() {
            Ok(bytes) => {
                self.0.push(*bytes);
                true
            }
            Err(_) => false,
        }
    }

    fn replace_erased(&mut self, slot: usize, value: ErasedValue) -> bool {
        match value.downcast::<Vec<u8>>() {
            Ok(bytes) => {
                self.0[slot] = *bytes;
                true
            }
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn value_any(&self, slot: usize) -> Option<&dyn Any> {
        self.0.get(slot).map(|v| v as &dyn Any)
    }
}

/// Column constructor for Rust-typed components.
pub fn new_typed_data<T: Send + Sync + 'static>() -> Box<dyn ColumnData> {
    Box::new(TypedData::<T>(Vec::new()))
}

/// Column constructor for dynamic blob components.
pub fn new_blob_data() -> Box<dyn ColumnData> {
    Box::new(BlobData(Vec::new()))
}

/// One component type's storage: sparse set plus change ticks.
pub struct Column {
    id: ComponentId,
    is_tag: bool,
    /// Dense entity list; iteration order for queries driven by this column.
    entities: Vec<Entity>,
    /// Sparse index: entity slot index -> dense slot, or `INVALID_SLOT`.
    sparse: Vec<u32>,
    /// Dense payloads, parallel to `entities`. `None` for tags.
    data: Option<Box<dyn ColumnData>>,
    /// Last-change tick, parallel to `entities`.
    ticks: Vec<u64>,
    /// Highest change tick in this column.
    changed: u64,
}

impl Column {
    pub fn new(info: &ComponentInfo) -> Self {
        Self {
            id: info.id,
            is_tag: info.is_tag,
            entities: Vec::new(),
            sparse: Vec::new(),
            data: info.new_data.map(|make| make()),
            ticks: Vec::new(),
            changed: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ComponentId {
        self.id
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.is_tag
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Dense entity list, in iteration order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Dense slot for a live member, validating the generation.
    #[inline]
    pub fn slot_of(&self, entity: Entity) -> Option<usize> {
        let slot = *self.sparse.get(entity.index() as usize)?;
        if slot == INVALID_SLOT {
            return None;
        }
        let slot = slot as usize;
        (self.entities[slot] == entity).then_some(slot)
    }

    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.slot_of(entity).is_some()
    }

    /// Insert or overwrite a typed value. Returns `false` on type mismatch
    /// (the column belongs to another type).
    pub fn insert<T: Component>(&mut self, entity: Entity, value: T, tick: u64) -> bool {
        self.insert_erased(entity, Some(Box::new(value)), tick)
    }

    /// Insert or overwrite from an erased value (`None` for tags).
    pub fn insert_erased(
        &mut self,
        entity: Entity,
        value: Option<ErasedValue>,
        tick: u64,
    ) -> bool {
        if let Some(slot) = self.slot_of(entity) {
            if let (Some(data), Some(value)) = (self.data.as_mut(), value) {
                if !data.replace_erased(slot, value) {
                    return false;
                }
            }
            self.ticks[slot] = tick;
            self.changed = self.changed.max(tick);
            return true;
        }

        match (self.data.as_mut(), value) {
            (Some(data), Some(value)) => {
                if !data.push_erased(value) {
                    return false;
                }
            }
            (None, _) => {}
            // Payload column but no value supplied: reject.
            (Some(_), None) => return false,
        }

        let slot = self.entities.len() as u32;
        self.entities.push(entity);
        self.ticks.push(tick);
        self.changed = self.changed.max(tick);
        let index = entity.index() as usize;
        if self.sparse.len() <= index {
            self.sparse.resize(index + 1, INVALID_SLOT);
        }
        self.sparse[index] = slot;
        true
    }

    /// Remove an entity's entry; idempotent.
    pub fn remove(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.slot_of(entity) else {
            return false;
        };
        self.entities.swap_remove(slot);
        self.ticks.swap_remove(slot);
        if let Some(data) = self.data.as_mut() {
            data.swap_remove(slot);
        }
        self.sparse[entity.index() as usize] = INVALID_SLOT;
        // The former last entry moved into `slot`; repoint its sparse entry.
        if slot < self.entities.len() {
            self.sparse[self.entities[slot].index() as usize] = slot as u32;
        }
        true
    }

    /// Typed read access.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let slot = self.slot_of(entity)?;
        self.typed::<T>()?.get(slot)
    }

    /// Typed write access; stamps the entry with `tick`.
    pub fn get_mut<T: Component>(&mut self, entity: Entity, tick: u64) -> Option<&mut T> {
        let slot = self.slot_of(entity)?;
        self.ticks[slot] = tick;
        self.changed = self.changed.max(tick);
        self.typed_mut::<T>()?.get_mut(slot)
    }

    /// Typed read access by dense slot (query fast path).
    pub fn get_dense<T: Component>(&self, slot: usize) -> Option<&T> {
        self.typed::<T>()?.get(slot)
    }

    /// Blob read access for dynamic components.
    pub fn get_blob(&self, entity: Entity) -> Option<&[u8]> {
        let slot = self.slot_of(entity)?;
        let data = self.data.as_ref()?.as_any().downcast_ref::<BlobData>()?;
        data.0.get(slot).map(|v| v.as_slice())
    }

    /// The entry's value as `&dyn Any`, for serialize/inspect hooks.
    pub fn value_any(&self, entity: Entity) -> Option<&dyn Any> {
        let slot = self.slot_of(entity)?;
        self.data.as_ref()?.value_any(slot)
    }

    /// Stamp an entry as changed without touching the payload.
    pub fn mark_changed(&mut self, entity: Entity, tick: u64) -> bool {
        let Some(slot) = self.slot_of(entity) else {
            return false;
        };
        self.ticks[slot] = tick;
        self.changed = self.changed.max(tick);
        true
    }

    /// Last-change tick of an entry.
    pub fn change_tick(&self, entity: Entity) -> Option<u64> {
        self.slot_of(entity).map(|slot| self.ticks[slot])
    }

    /// Whether the entry changed strictly after `since`.
    #[inline]
    pub fn changed_since(&self, entity: Entity, since: u64) -> bool {
        self.change_tick(entity).is_some_and(|tick| tick > since)
    }

    /// Whether anything in the column changed strictly after `since`.
    #[inline]
    pub fn column_changed_since(&self, since: u64) -> bool {
        self.changed > since
    }

    fn typed<T: Component>(&self) -> Option<&Vec<T>> {
        Some(&self.data.as_ref()?.as_any().downcast_ref::<TypedData<T>>()?.0)
    }

    fn typed_mut<T: Component>(&mut self) -> Option<&mut Vec<T>> {
        Some(
            &mut self
                .data
                .as_mut()?
                .as_any_mut()
                .downcast_mut::<TypedData<T>>()?
                .0,
        )
    }
}

/// The per-world store: one column per registered component type.
///
/// Every column sits in its own cell so a worker holding write access to
/// one component id can mutate exactly that column through a raw pointer
/// while other workers touch other columns. Nothing ever materializes a
/// `&mut Store` (or any reference spanning multiple columns) on the
/// parallel path; whole-store mutation is only reachable through
/// `&mut Store`, which the world holds exclusively between phases.
#[derive(Default)]
pub struct Store {
    columns: Vec<std::cell::UnsafeCell<Column>>,
}

// SAFETY: the scheduler is the synchronization. While the store is shared
// across worker threads, no two concurrently running systems write the same
// column and no column is read while another thread writes it (conflicting
// systems are serialized into different groups). Structural changes (sync,
// remove_entity) require `&mut Store` and happen on the main thread only.
unsafe impl Sync for Store {}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append columns for any types registered since the last sync.
    pub fn sync(&mut self, infos: &[ComponentInfo]) {
        for info in &infos[self.columns.len()..] {
            self.columns.push(std::cell::UnsafeCell::new(Column::new(info)));
        }
    }

    /// Shared access to one column. Sound while no other thread writes the
    /// same column, which the scheduler's conflict grouping guarantees.
    #[inline]
    pub fn column(&self, id: ComponentId) -> Option<&Column> {
        // SAFETY: see `unsafe impl Sync`.
        self.columns.get(id.index()).map(|cell| unsafe { &*cell.get() })
    }

    /// Exclusive access to one column through `&mut Store` (main thread).
    #[inline]
    pub fn column_mut(&mut self, id: ComponentId) -> Option<&mut Column> {
        self.columns.get_mut(id.index()).map(|cell| cell.get_mut())
    }

    /// Raw pointer to one column, for system write access from a shared
    /// store.
    ///
    /// # Safety
    ///
    /// The caller must hold the scheduler's write grant for this component
    /// id: no other thread may read or write this column while the pointer
    /// (or anything derived from it) is in use. Entities mutated through it
    /// must be disjoint across the batches of the owning system.
    #[inline]
    pub(crate) unsafe fn column_mut_unchecked(
        &self,
        id: ComponentId,
    ) -> Option<*mut Column> {
        self.columns.get(id.index()).map(|cell| cell.get())
    }

    /// Number of columns (registered component types).
    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Remove every component of `entity` (despawn path).
    pub fn remove_entity(&mut self, entity: Entity) {
        for cell in &mut self.columns {
            cell.get_mut().remove(entity);
        }
    }

    /// Number of component instances attached to `entity`.
    pub fn component_count(&self, entity: Entity) -> usize {
        (0..self.columns.len())
            .filter(|&index| {
                self.column(ComponentId::new(index as u32))
                    .is_some_and(|column| column.contains(entity))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use crate::ecs::component::Registry;
    use crate::ecs::entity;
    use crate::{component, tag};

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }
    component!(Position, "Position");

    struct Marked;
    tag!(Marked, "Marked");

    fn store_with(registry: &Registry) -> Store {
        let mut store = Store::new();
        store.sync(&registry.infos());
        store
    }

    #[test]
    fn insert_get_remove_round_trip() {
        // Given
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();

        // When
        let column = store.column_mut(id).unwrap();
        assert!(column.insert(e, Position { x: 1.0, y: 2.0 }, 1));

        // Then
        assert!(column.contains(e));
        assert_eq!(column.get::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));

        // And when removed, the entity state matches pre-attach
        assert!(column.remove(e));
        assert!(!column.contains(e));
        assert_eq!(column.get::<Position>(e), None);
        // Idempotent
        assert!(!column.remove(e));
    }

    #[test]
    fn insert_overwrites_existing_instance() {
        // Given: at most one instance of a type per entity
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        let column = store.column_mut(id).unwrap();

        // When
        column.insert(e, Position { x: 1.0, y: 1.0 }, 1);
        column.insert(e, Position { x: 9.0, y: 9.0 }, 2);

        // Then
        assert_eq!(column.len(), 1);
        assert_eq!(column.get::<Position>(e), Some(&Position { x: 9.0, y: 9.0 }));
    }

    #[test]
    fn swap_remove_repoints_moved_entity() {
        // Given three members
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let a = entities.allocate();
        let b = entities.allocate();
        let c = entities.allocate();
        let column = store.column_mut(id).unwrap();
        column.insert(a, Position { x: 1.0, y: 0.0 }, 1);
        column.insert(b, Position { x: 2.0, y: 0.0 }, 1);
        column.insert(c, Position { x: 3.0, y: 0.0 }, 1);

        // When: removing the first swaps the last into its slot
        column.remove(a);

        // Then: survivors still resolve correctly
        assert_eq!(column.get::<Position>(b), Some(&Position { x: 2.0, y: 0.0 }));
        assert_eq!(column.get::<Position>(c), Some(&Position { x: 3.0, y: 0.0 }));
        assert_eq!(column.len(), 2);
    }

    #[test]
    fn stale_generation_does_not_resolve() {
        // Given
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        store
            .column_mut(id)
            .unwrap()
            .insert(e, Position { x: 0.0, y: 0.0 }, 1);

        // When: the slot is recycled with a new generation
        entities.free(e);
        let reused = entities.allocate();
        assert_eq!(reused.index(), e.index());

        // Then: neither handle resolves (old is stale, new was never attached)
        store.remove_entity(e);
        let column = store.column(id).unwrap();
        assert!(!column.contains(e));
        assert!(!column.contains(reused));
    }

    #[test]
    fn tag_columns_carry_no_payload() {
        // Given
        let registry = Registry::new();
        let id = registry.register::<Marked>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        let column = store.column_mut(id).unwrap();

        // When
        assert!(column.insert_erased(e, None, 1));

        // Then
        assert!(column.contains(e));
        assert!(column.is_tag());
        assert!(column.value_any(e).is_none());
    }

    #[test]
    fn change_ticks_answer_detect_changes() {
        // Given
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        let column = store.column_mut(id).unwrap();
        column.insert(e, Position { x: 0.0, y: 0.0 }, 5);

        // Then: visible as changed after tick 4, not after tick 5
        assert!(column.changed_since(e, 4));
        assert!(!column.changed_since(e, 5));
        assert!(column.column_changed_since(4));
        assert!(!column.column_changed_since(5));

        // When mutated later
        column.get_mut::<Position>(e, 9).unwrap().x = 7.0;

        // Then
        assert!(column.changed_since(e, 5));
        assert!(column.column_changed_since(8));
    }

    #[test]
    fn blob_columns_round_trip_bytes() {
        // Given a dynamically registered component
        let registry = Registry::new();
        let id = registry.register_dynamic("ScriptState", false).unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        let column = store.column_mut(id).unwrap();

        // When
        let payload: Vec<u8> = vec![1, 2, 3];
        assert!(column.insert_erased(e, Some(Box::new(payload.clone())), 1));

        // Then
        assert_eq!(column.get_blob(e), Some(payload.as_slice()));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        // Given a Position column
        let registry = Registry::new();
        let id = registry.register::<Position>().unwrap();
        let entities = entity::Registry::new();
        let mut store = store_with(&registry);
        let e = entities.allocate();
        let column = store.column_mut(id).unwrap();

        // When: pushing a value of the wrong type
        let ok = column.insert_erased(e, Some(Box::new(42u32)), 1);

        // Then: rejected, no membership recorded
        assert!(!ok);
        assert!(!column.contains(e));
    }

    #[test]
    fn store_sync_is_incremental() {
        let registry = Registry::new();
        registry.register::<Position>().unwrap();
        let mut store = store_with(&registry);
        assert_eq!(store.column_count(), 1);

        registry.register::<Marked>().unwrap();
        store.sync(&registry.infos());
        assert_eq!(store.column_count(), 2);
    }
}
