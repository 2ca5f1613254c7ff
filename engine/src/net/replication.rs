//! Replication bookkeeping: network identity, dirty collection, packet
//! batching, and applying remote state.
//!
//! The authoritative peer assigns every networked entity an injective
//! network id. Each replication tick the session:
//!
//! 1. **collects** dirty components by comparing store change ticks against
//!    per-component last-sent ticks,
//! 2. **serializes** them into [`EntityUpdateMessage`]s ordered by priority
//!    (descending) then network id (ascending), components within an entity
//!    ordered by type id,
//! 3. **batches** messages into MTU-bounded packets, reliable-mode
//!    components in reliable packets,
//! 4. **applies** incoming updates: directly into the store, or into the
//!    per-entity snapshot ring for interpolated components.
//!
//! Updates for unknown network ids are buffered for up to
//! [`PENDING_TTL_TICKS`] ticks awaiting a spawn, then dropped.

use std::collections::HashMap;

use crate::ecs::component::ComponentId;
use crate::ecs::entity::Entity;
use crate::ecs::world::World;
use crate::net::components::{
    AuthorityMode, ReplicatedComponent, ReplicationMode, SnapshotBuffer,
    lerp_transform_snapshots,
};
use crate::net::types::{
    ComponentBlob, EntityUpdateBatch, EntityUpdateMessage, NetError, PeerId,
};

/// How long an update for an unknown network id waits for its spawn.
pub const PENDING_TTL_TICKS: u64 = 5;

/// Replication state for one networked entity.
pub struct NetEntity {
    pub entity: Entity,
    pub network_id: u64,
    /// Kept sorted by component id; the wire order within an entity.
    pub components: Vec<ReplicatedComponent>,
    pub authority: AuthorityMode,
    pub authority_peer: PeerId,
    pub owner_peer: PeerId,
    pub spawn_scene: String,
    /// True for entities materialized from a remote spawn; these are torn
    /// down when the remote despawns them.
    pub spawned_by_remote: bool,
    /// Snapshot rings for interpolated components.
    pub snapshots: HashMap<ComponentId, SnapshotBuffer>,
}

struct PendingUpdates {
    expires_at_tick: u64,
    updates: Vec<EntityUpdateMessage>,
}

/// Per-world replication registry.
#[derive(Default)]
pub struct ReplicationState {
    by_entity: HashMap<Entity, u64>,
    entities: HashMap<u64, NetEntity>,
    /// Host-side id source; injective per world.
    next_network_id: u64,
    pending: HashMap<u64, PendingUpdates>,
    /// Authority transfer requests in arrival order.
    pending_authority: Vec<(u64, PeerId)>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self {
            next_network_id: 1,
            ..Self::default()
        }
    }

    // ===================== identity =====================

    /// Register an entity under a fresh network id (authoritative side).
    pub fn register(&mut self, entity: Entity, authority_peer: PeerId) -> u64 {
        let network_id = self.next_network_id;
        self.next_network_id += 1;
        self.register_with_id(entity, network_id, authority_peer, false);
        network_id
    }

    /// Register an entity under a remotely assigned id (receiving side).
    pub fn register_with_id(
        &mut self,
        entity: Entity,
        network_id: u64,
        authority_peer: PeerId,
        spawned_by_remote: bool,
    ) {
        self.by_entity.insert(entity, network_id);
        self.entities.insert(
            network_id,
            NetEntity {
                entity,
                network_id,
                components: Vec::new(),
                authority: AuthorityMode::ServerAuthority,
                authority_peer,
                owner_peer: authority_peer,
                spawn_scene: String::new(),
                spawned_by_remote,
                snapshots: HashMap::new(),
            },
        );
    }

    pub fn unregister(&mut self, entity: Entity) -> Option<u64> {
        let network_id = self.by_entity.remove(&entity)?;
        self.entities.remove(&network_id);
        Some(network_id)
    }

    pub fn network_id_of(&self, entity: Entity) -> Option<u64> {
        self.by_entity.get(&entity).copied()
    }

    pub fn entity_of(&self, network_id: u64) -> Option<Entity> {
        self.entities.get(&network_id).map(|n| n.entity)
    }

    pub fn get(&self, network_id: u64) -> Option<&NetEntity> {
        self.entities.get(&network_id)
    }

    pub fn get_mut(&mut self, network_id: u64) -> Option<&mut NetEntity> {
        self.entities.get_mut(&network_id)
    }

    pub fn get_by_entity_mut(&mut self, entity: Entity) -> Option<&mut NetEntity> {
        let network_id = self.by_entity.get(&entity)?;
        self.entities.get_mut(network_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetEntity> {
        self.entities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    // ===================== configuration =====================

    /// Declare (or re-declare) a component as replicated for an entity.
    pub fn add_replicated_component(
        &mut self,
        entity: Entity,
        id: ComponentId,
        name: impl Into<String>,
    ) -> Result<(), NetError> {
        let net = self
            .get_by_entity_mut(entity)
            .ok_or(NetError::NotNetworked)?;
        if net.components.iter().any(|c| c.id == id) {
            return Ok(());
        }
        let at = net.components.partition_point(|c| c.id < id);
        net.components.insert(at, ReplicatedComponent::new(id, name));
        Ok(())
    }

    /// Tune one replicated component's mode, interpolation, and priority.
    pub fn configure_component(
        &mut self,
        entity: Entity,
        id: ComponentId,
        mode: ReplicationMode,
        interpolate: bool,
        priority: u8,
    ) -> Result<(), NetError> {
        let net = self
            .get_by_entity_mut(entity)
            .ok_or(NetError::NotNetworked)?;
        let component = net
            .components
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(NetError::NotNetworked)?;
        component.mode = mode;
        component.interpolate = interpolate;
        component.priority = priority;
        Ok(())
    }

    pub fn set_authority(
        &mut self,
        entity: Entity,
        mode: AuthorityMode,
        authority_peer: PeerId,
    ) -> Result<(), NetError> {
        let net = self
            .get_by_entity_mut(entity)
            .ok_or(NetError::NotNetworked)?;
        net.authority = mode;
        net.authority_peer = authority_peer;
        Ok(())
    }

    // ===================== collect & batch =====================

    /// Serialize one entity's full replicated state (spawn payload).
    pub fn spawn_blobs(&self, world: &World, network_id: u64) -> Vec<ComponentBlob> {
        let Some(net) = self.entities.get(&network_id) else {
            return Vec::new();
        };
        net.components
            .iter()
            .filter(|c| c.mode != ReplicationMode::None)
            .filter_map(|c| {
                world
                    .serialize_component(net.entity, c.id)
                    .map(|data| ComponentBlob {
                        name: c.name.clone(),
                        type_order: c.id.raw(),
                        data,
                    })
            })
            .collect()
    }

    /// Gather dirty state for every entity the local peer has authority
    /// over. Returns `(reliable, unreliable)` update lists, each ordered by
    /// priority descending then network id ascending.
    pub fn collect(
        &mut self,
        world: &World,
        local_peer: PeerId,
        tick: u64,
    ) -> (Vec<EntityUpdateMessage>, Vec<EntityUpdateMessage>) {
        let mut reliable: Vec<(u8, EntityUpdateMessage)> = Vec::new();
        let mut unreliable: Vec<(u8, EntityUpdateMessage)> = Vec::new();

        let mut ids: Vec<u64> = self.entities.keys().copied().collect();
        ids.sort_unstable();

        for network_id in ids {
            let net = self.entities.get_mut(&network_id).expect("id just listed");
            if net.authority_peer != local_peer {
                continue;
            }

            let mut reliable_blobs = Vec::new();
            let mut unreliable_blobs = Vec::new();
            let mut priority = 0u8;

            for component in &mut net.components {
                let send = match component.mode {
                    ReplicationMode::None => false,
                    ReplicationMode::Once => !component.sent_once,
                    ReplicationMode::Continuous => true,
                    ReplicationMode::OnChange | ReplicationMode::Reliable => world
                        .component_change_tick(net.entity, component.id)
                        .is_some_and(|changed| changed > component.last_sent_tick),
                };
                if !send {
                    continue;
                }
                // A missing or non-serializable component is skipped;
                // replication continues with the rest.
                let Some(data) = world.serialize_component(net.entity, component.id) else {
                    continue;
                };
                let blob = ComponentBlob {
                    name: component.name.clone(),
                    type_order: component.id.raw(),
                    data,
                };
                component.last_sent_tick = world.change_tick();
                component.sent_once = true;
                priority = priority.max(component.priority);
                if component.mode == ReplicationMode::Reliable {
                    reliable_blobs.push(blob);
                } else {
                    unreliable_blobs.push(blob);
                }
            }

            if !reliable_blobs.is_empty() {
                reliable.push((
                    priority,
                    EntityUpdateMessage {
                        network_id,
                        tick,
                        components: reliable_blobs,
                    },
                ));
            }
            if !unreliable_blobs.is_empty() {
                unreliable.push((
                    priority,
                    EntityUpdateMessage {
                        network_id,
                        tick,
                        components: unreliable_blobs,
                    },
                ));
            }
        }

        let order = |list: &mut Vec<(u8, EntityUpdateMessage)>| {
            list.sort_by(|a, b| {
                b.0.cmp(&a.0)
                    .then_with(|| a.1.network_id.cmp(&b.1.network_id))
            });
        };
        order(&mut reliable);
        order(&mut unreliable);
        (
            reliable.into_iter().map(|(_, m)| m).collect(),
            unreliable.into_iter().map(|(_, m)| m).collect(),
        )
    }

    /// Pack update messages into batches no larger than `mtu` bytes each.
    /// A single oversized message still ships alone.
    pub fn batch(updates: Vec<EntityUpdateMessage>, tick: u64, mtu: usize) -> Vec<EntityUpdateBatch> {
        let mut batches = Vec::new();
        let mut current = EntityUpdateBatch {
            tick,
            updates: Vec::new(),
        };
        let mut current_size = 0usize;

        for update in updates {
            let size = bincode::serialized_size(&update).unwrap_or(0) as usize;
            if !current.updates.is_empty() && current_size + size > mtu {
                batches.push(std::mem::replace(
                    &mut current,
                    EntityUpdateBatch {
                        tick,
                        updates: Vec::new(),
                    },
                ));
                current_size = 0;
            }
            current_size += size;
            current.updates.push(update);
        }
        if !current.updates.is_empty() {
            batches.push(current);
        }
        batches
    }

    // ===================== apply =====================

    /// Apply one remote update to the local store. Components flagged
    /// `interpolate` go into the snapshot ring; unknown component names are
    /// skipped individually.
    pub fn apply_update(
        &mut self,
        world: &mut World,
        update: &EntityUpdateMessage,
    ) -> Result<(), NetError> {
        let net = self
            .entities
            .get_mut(&update.network_id)
            .ok_or(NetError::NotNetworked)?;
        let entity = net.entity;

        for blob in &update.components {
            let Some(id) = world.component_id(&blob.name) else {
                log::debug!("skipping unknown replicated component `{}`", blob.name);
                continue;
            };
            let interpolate = net
                .components
                .iter()
                .find(|c| c.id == id)
                .is_some_and(|c| c.interpolate);
            if interpolate {
                net.snapshots
                    .entry(id)
                    .or_default()
                    .push(update.tick, blob.data.clone());
            } else if let Err(error) = world.attach_bytes(entity, id, &blob.data) {
                log::debug!("skipping undecodable component `{}`: {error}", blob.name);
            }
        }
        Ok(())
    }

    /// Buffer an update whose network id is not known yet.
    pub fn buffer_pending(&mut self, update: EntityUpdateMessage, current_tick: u64) {
        let entry = self
            .pending
            .entry(update.network_id)
            .or_insert_with(|| PendingUpdates {
                expires_at_tick: current_tick + PENDING_TTL_TICKS,
                updates: Vec::new(),
            });
        entry.updates.push(update);
    }

    /// Drop pending updates whose spawn never arrived.
    pub fn purge_pending(&mut self, current_tick: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.expires_at_tick > current_tick);
        before - self.pending.len()
    }

    /// Pull any updates buffered for a just-spawned network id.
    pub fn take_pending(&mut self, network_id: u64) -> Vec<EntityUpdateMessage> {
        self.pending
            .remove(&network_id)
            .map(|p| p.updates)
            .unwrap_or_default()
    }

    // ===================== interpolation =====================

    /// Write interpolated component values for `render_tick` into the
    /// store. Transforms lerp between bracketing snapshots; other
    /// interpolated components step to the newest snapshot at or before the
    /// render tick.
    pub fn apply_interpolation(&mut self, world: &mut World, render_tick: u64, fraction: f32) {
        for net in self.entities.values_mut() {
            let entity = net.entity;
            for (id, buffer) in &net.snapshots {
                let (before, after) = buffer.bracket(render_tick);
                let payload: Option<Vec<u8>> = match (before, after) {
                    (Some(before), Some(after)) => {
                        let is_transform = net
                            .components
                            .iter()
                            .find(|c| c.id == *id)
                            .is_some_and(|c| c.name == "Transform3DComponent");
                        if is_transform {
                            lerp_transform_snapshots(before, after, render_tick, fraction)
                                .and_then(|value| bincode::serialize(&value).ok())
                        } else {
                            Some(before.1.clone())
                        }
                    }
                    (Some(before), None) => Some(before.1.clone()),
                    // Not enough history yet; wait rather than extrapolate
                    // backwards.
                    (None, _) => None,
                };
                if let Some(payload) = payload {
                    let _ = world.attach_bytes(entity, *id, &payload);
                }
            }
        }
    }

    // ===================== authority =====================

    /// Queue a transfer request; resolved in arrival order on the host's
    /// next tick.
    pub fn queue_authority_request(&mut self, network_id: u64, requester: PeerId) {
        self.pending_authority.push((network_id, requester));
    }

    /// Resolve queued transfer requests: the earliest request per entity
    /// wins; later requesters learn the actual holder.
    ///
    /// Returns `(network_id, winner, denied_requesters)` per transferable
    /// entity that had requests.
    pub fn resolve_authority_requests(&mut self) -> Vec<(u64, PeerId, Vec<PeerId>)> {
        let mut outcomes: Vec<(u64, PeerId, Vec<PeerId>)> = Vec::new();
        for (network_id, requester) in self.pending_authority.drain(..) {
            let Some(net) = self.entities.get_mut(&network_id) else {
                continue;
            };
            if net.authority != AuthorityMode::Transferable {
                continue;
            }
            match outcomes.iter_mut().find(|(id, _, _)| *id == network_id) {
                Some((_, winner, denied)) => {
                    if *winner != requester {
                        denied.push(requester);
                    }
                }
                None => {
                    net.authority_peer = requester;
                    outcomes.push((network_id, requester, Vec::new()));
                }
            }
        }
        outcomes
    }
}
