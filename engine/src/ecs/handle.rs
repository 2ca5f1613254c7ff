//! Opaque resource handles for everything that is not an entity: worlds,
//! backend resources (meshes, multimeshes, scenarios, cameras, canvases),
//! and cached queries.
//!
//! [`Rid`] uses the same (index, generation) packing as entity handles, so a
//! stale handle can never resolve to a recycled slot. The generic
//! [`HandleRegistry`] stores the owning value next to its generation; lookups
//! are lock-free reads through the sharded map.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

/// An opaque resource id: slot index plus generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid(u64);

impl Rid {
    /// The invalid handle; never returned by a registry.
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    const fn from_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    #[inline]
    pub const fn to_bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

struct Slot<T> {
    generation: u32,
    value: T,
}

/// A generational slot registry handing out [`Rid`]s for owned values.
pub struct HandleRegistry<T> {
    slots: DashMap<u32, Slot<T>>,
    /// Generation watermark per slot index, kept across removals so recycled
    /// indices mint fresh generations.
    generations: DashMap<u32, u32>,
    free: crossbeam::queue::SegQueue<u32>,
    next_index: AtomicU32,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            generations: DashMap::new(),
            free: crossbeam::queue::SegQueue::new(),
            next_index: AtomicU32::new(0),
        }
    }

    /// Store a value and mint its handle.
    pub fn insert(&self, value: T) -> Rid {
        let index = self
            .free
            .pop()
            .unwrap_or_else(|| self.next_index.fetch_add(1, Ordering::Relaxed));
        let generation = self.generations.get(&index).map(|g| *g).unwrap_or(0);
        self.slots.insert(index, Slot { generation, value });
        Rid::from_parts(index, generation)
    }

    /// Remove the value for a live handle. Stale handles return `None`.
    pub fn remove(&self, rid: Rid) -> Option<T> {
        if !rid.is_valid() {
            return None;
        }
        let entry = self.slots.remove_if(&rid.index(), |_, slot| {
            slot.generation == rid.generation()
        })?;
        self.generations
            .insert(rid.index(), rid.generation().wrapping_add(1));
        self.free.push(rid.index());
        Some(entry.1.value)
    }

    /// Whether the handle names a live slot.
    pub fn contains(&self, rid: Rid) -> bool {
        rid.is_valid()
            && self
                .slots
                .get(&rid.index())
                .is_some_and(|slot| slot.generation == rid.generation())
    }

    /// Run `f` with a shared reference to the value behind a live handle.
    pub fn with<R>(&self, rid: Rid, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !rid.is_valid() {
            return None;
        }
        self.slots
            .get(&rid.index())
            .filter(|slot| slot.generation == rid.generation())
            .map(|slot| f(&slot.value))
    }

    /// Run `f` with a mutable reference to the value behind a live handle.
    pub fn with_mut<R>(&self, rid: Rid, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if !rid.is_valid() {
            return None;
        }
        let mut slot = self.slots.get_mut(&rid.index())?;
        if slot.generation != rid.generation() {
            return None;
        }
        Some(f(&mut slot.value))
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Visit every live (rid, value) pair.
    pub fn for_each(&self, mut f: impl FnMut(Rid, &T)) {
        for entry in self.slots.iter() {
            f(
                Rid::from_parts(*entry.key(), entry.value().generation),
                &entry.value().value,
            );
        }
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        // Given
        let registry = HandleRegistry::new();

        // When
        let rid = registry.insert("mesh");

        // Then
        assert!(registry.contains(rid));
        assert_eq!(registry.with(rid, |v| *v), Some("mesh"));
    }

    #[test]
    fn removed_handles_go_stale() {
        // Given
        let registry = HandleRegistry::new();
        let rid = registry.insert(7u32);

        // When
        assert_eq!(registry.remove(rid), Some(7));

        // Then
        assert!(!registry.contains(rid));
        assert_eq!(registry.remove(rid), None);
    }

    #[test]
    fn recycled_index_gets_new_generation() {
        // Given
        let registry = HandleRegistry::new();
        let first = registry.insert(1u32);
        registry.remove(first);

        // When
        let second = registry.insert(2u32);

        // Then: same slot, new generation, stale handle rejected
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(!registry.contains(first));
        assert_eq!(registry.with(second, |v| *v), Some(2));
    }

    #[test]
    fn invalid_rid_never_resolves() {
        let registry: HandleRegistry<u32> = HandleRegistry::new();
        assert!(!registry.contains(Rid::INVALID));
        assert!(registry.with(Rid::INVALID, |v| *v).is_none());
    }

    #[test]
    fn with_mut_updates_in_place() {
        let registry = HandleRegistry::new();
        let rid = registry.insert(10u32);
        registry.with_mut(rid, |v| *v += 5);
        assert_eq!(registry.with(rid, |v| *v), Some(15));
    }
}
