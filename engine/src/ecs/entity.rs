//! Entity handles and the process-safe handle registry.
//!
//! An [`Entity`] is an opaque 64-bit handle packing a 32-bit slot index and a
//! 32-bit generation. A handle is *live* iff the registry slot it names is
//! allocated and carries the same generation; freeing a slot bumps the
//! generation, so every stale handle is detectable in constant time.
//!
//! # Architecture
//!
//! The [`Registry`] serves three operations with different concurrency needs:
//!
//! - `allocate` may be called from any thread (systems spawn through it, the
//!   actual storage insert is deferred through the command queue),
//! - `free` invalidates a slot and recycles its index,
//! - `is_live` is the hot path, called per entity per query, so it must never
//!   block.
//!
//! Slot state lives in a chunked table of atomics that is only ever appended
//! to (chunks are allocated once behind a `OnceLock` and never move), so
//! `is_live` is a wait-free pair of loads. Freed indices are recycled through
//! lock-free freelists striped by `index % STRIPES` to spread contention.

use std::sync::{
    OnceLock,
    atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam::queue::SegQueue;

/// Slots per chunk of the generation table.
const CHUNK_SIZE: usize = 4096;

/// Maximum number of chunks; bounds the live index space.
const MAX_CHUNKS: usize = 16_384;

/// Number of freelist stripes.
const STRIPES: usize = 16;

/// Bit flagging a slot as allocated; the low 32 bits hold the generation.
const LIVE_BIT: u64 = 1 << 32;

/// An opaque handle to an entity: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(u64);

impl Entity {
    /// Build a handle from its parts.
    #[inline]
    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// The slot index; also the row key into sparse component columns.
    #[inline]
    pub const fn index(&self) -> u32 {
        self.0 as u32
    }

    /// The generation this handle was minted with.
    #[inline]
    pub const fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw 64-bit value, for wire formats and host bindings.
    #[inline]
    pub const fn to_bits(&self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value. Liveness is not implied.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

type Chunk = Box<[AtomicU64; CHUNK_SIZE]>;

/// The per-world entity handle registry.
///
/// Lock-striped for allocation/free, wait-free for liveness checks. Slot
/// generations increase monotonically on every free, invalidating dangling
/// handles for the lifetime of the world.
pub struct Registry {
    /// Chunked slot table. Chunks are initialized on demand and never moved,
    /// which is what makes concurrent `is_live` reads safe without locks.
    chunks: Box<[OnceLock<Chunk>]>,
    /// Recycled indices, striped by `index % STRIPES`.
    stripes: [SegQueue<u32>; STRIPES],
    /// Rotates the stripe scanned first on allocation.
    next_stripe: AtomicUsize,
    /// Bump cursor for fresh indices.
    next_index: AtomicU32,
    /// Number of currently live entities.
    alive: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            stripes: std::array::from_fn(|_| SegQueue::new()),
            next_stripe: AtomicUsize::new(0),
            next_index: AtomicU32::new(0),
            alive: AtomicUsize::new(0),
        }
    }

    /// Allocate a fresh handle. Amortized O(1); callable from any thread.
    ///
    /// # Panics
    ///
    /// Exhausting the index space is fatal, matching the contract that a
    /// runtime that has burned through four billion entity slots cannot
    /// continue meaningfully.
    pub fn allocate(&self) -> Entity {
        // Recycled slot first: scan stripes starting from a rotating cursor.
        let start = self.next_stripe.fetch_add(1, Ordering::Relaxed);
        for offset in 0..STRIPES {
            if let Some(index) = self.stripes[(start + offset) % STRIPES].pop() {
                let slot = self.slot(index);
                // The popper owns this index exclusively; the generation was
                // already bumped at free time.
                let generation = (slot.load(Ordering::Acquire) & 0xFFFF_FFFF) as u32;
                slot.store(LIVE_BIT | generation as u64, Ordering::Release);
                self.alive.fetch_add(1, Ordering::Relaxed);
                return Entity::from_parts(index, generation);
            }
        }

        // Fresh index.
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let max = (MAX_CHUNKS * CHUNK_SIZE) as u32;
        if index >= max {
            panic!("entity index space exhausted ({max} slots)");
        }
        let slot = self.slot(index);
        slot.store(LIVE_BIT, Ordering::Release);
        self.alive.fetch_add(1, Ordering::Relaxed);
        Entity::from_parts(index, 0)
    }

    /// Free a handle, bumping the slot generation. Stale handles are a no-op.
    pub fn free(&self, entity: Entity) -> bool {
        let Some(slot) = self.try_slot(entity.index()) else {
            return false;
        };
        let expected = LIVE_BIT | entity.generation() as u64;
        let next = (entity.generation().wrapping_add(1)) as u64;
        if slot
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Already freed, or a newer generation owns the slot.
            return false;
        }
        self.alive.fetch_sub(1, Ordering::Relaxed);
        self.stripes[entity.index() as usize % STRIPES].push(entity.index());
        true
    }

    /// Wait-free liveness check: allocated and generation matches.
    #[inline]
    pub fn is_live(&self, entity: Entity) -> bool {
        match self.try_slot(entity.index()) {
            Some(slot) => {
                slot.load(Ordering::Acquire) == (LIVE_BIT | entity.generation() as u64)
            }
            None => false,
        }
    }

    /// Number of live entities.
    #[inline]
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Relaxed)
    }

    /// Highest index ever handed out (exclusive); sizing hint for sparse
    /// columns.
    #[inline]
    pub fn index_high_water(&self) -> u32 {
        self.next_index.load(Ordering::Relaxed)
    }

    /// The live entity occupying `index`, if any.
    pub fn live_at(&self, index: u32) -> Option<Entity> {
        let slot = self.try_slot(index)?;
        let bits = slot.load(Ordering::Acquire);
        if bits & LIVE_BIT == 0 {
            return None;
        }
        Some(Entity::from_parts(index, bits as u32))
    }

    /// Snapshot of every live entity, in index order. Used by diagnostics;
    /// concurrent allocation may be missed.
    pub fn live_entities(&self) -> Vec<Entity> {
        (0..self.index_high_water())
            .filter_map(|index| self.live_at(index))
            .collect()
    }

    fn slot(&self, index: u32) -> &AtomicU64 {
        let chunk = self.chunks[index as usize / CHUNK_SIZE]
            .get_or_init(|| Box::new(std::array::from_fn(|_| AtomicU64::new(0))));
        &chunk[index as usize % CHUNK_SIZE]
    }

    fn try_slot(&self, index: u32) -> Option<&AtomicU64> {
        let chunk = self.chunks.get(index as usize / CHUNK_SIZE)?.get()?;
        Some(&chunk[index as usize % CHUNK_SIZE])
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn allocate_hands_out_unique_handles() {
    // Given
    let registry = Registry::new();

    // When
    let mut entities: Vec<_> = (0..200).map(|_| registry.allocate()).collect();

    // Then
    let before = entities.len();
    entities.sort();
    entities.dedup();
    assert_eq!(before, entities.len());
    assert_eq!(registry.alive(), 200);
}

#[test]
fn free_invalidates_exactly_that_handle() {
    // Given
    let registry = Registry::new();
    let entity = registry.allocate();
    assert!(registry.is_live(entity));

    // When
    assert!(registry.free(entity));

    // Then: handle stays dead forever, even after slot reuse
    assert!(!registry.is_live(entity));
    let reused = registry.allocate();
    assert_eq!(reused.index(), entity.index());
    assert_eq!(reused.generation(), entity.generation() + 1);
    assert!(registry.is_live(reused));
    assert!(!registry.is_live(entity));
}

#[test]
fn stale_free_is_a_no_op() {
    // Given
    let registry = Registry::new();
    let entity = registry.allocate();
    registry.free(entity);
    let reused = registry.allocate();

    // When: freeing through the stale handle
    assert!(!registry.free(entity));

    // Then: the reused slot is untouched
    assert!(registry.is_live(reused));
    assert_eq!(registry.alive(), 1);
}

#[test]
fn double_free_is_a_no_op() {
    let registry = Registry::new();
    let entity = registry.allocate();
    assert!(registry.free(entity));
    assert!(!registry.free(entity));
    assert_eq!(registry.alive(), 0);
}

#[test]
fn generations_increase_across_reuse_cycles() {
    // Given
    let registry = Registry::new();
    let first = registry.allocate();

    // When: free/alloc the same slot repeatedly
    let mut last = first;
    for expected_gen in 1..=3u32 {
        registry.free(last);
        last = registry.allocate();
        assert_eq!(last.index(), first.index());
        assert_eq!(last.generation(), expected_gen);
    }
}

#[test]
fn unknown_index_is_not_live() {
    let registry = Registry::new();
    assert!(!registry.is_live(Entity::from_parts(12_345, 0)));
}

#[test]
fn concurrent_allocation_is_collision_free() {
    use std::sync::Arc;

    // Given
    let registry = Arc::new(Registry::new());

    // When: several threads allocate and free concurrently
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut minted = Vec::new();
                for round in 0..500 {
                    let entity = registry.allocate();
                    minted.push(entity.to_bits());
                    if round % 3 == 0 {
                        registry.free(entity);
                        minted.pop();
                    }
                }
                minted
            })
        })
        .collect();

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    // Then: every surviving handle is unique and live
    let before = all.len();
    all.sort();
    all.dedup();
    assert_eq!(before, all.len());
    for bits in all {
        assert!(registry.is_live(Entity::from_bits(bits)));
    }
}

#[test]
fn entity_bits_round_trip() {
    let entity = Entity::from_parts(77, 3);
    assert_eq!(Entity::from_bits(entity.to_bits()), entity);
    assert_eq!(entity.index(), 77);
    assert_eq!(entity.generation(), 3);
}
