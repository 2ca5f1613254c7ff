//! Per-entity replication configuration and the client-side snapshot
//! buffers used for interpolation.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ecs::component::ComponentId;
use crate::math::Transform3D;
use crate::net::types::PeerId;
use crate::render::components::Transform3DComponent;

/// How a replicated component travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Sent every replication tick while the entity is networked.
    Continuous,
    /// Sent when the component's change tick advances.
    OnChange,
    /// Like `OnChange`, but on the reliable channel.
    Reliable,
    /// Sent exactly once, then never again.
    Once,
    /// Never sent.
    None,
}

/// Which peer may mutate a networked entity's replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityMode {
    /// Only the host writes; clients silently discard local writes.
    ServerAuthority,
    /// One designated client writes; the host relays to other peers.
    ClientAuthority,
    /// Like `ServerAuthority`, but peers may request a transfer.
    Transferable,
}

/// Replication settings for one component on one entity.
#[derive(Debug, Clone)]
pub struct ReplicatedComponent {
    pub id: ComponentId,
    pub name: String,
    pub mode: ReplicationMode,
    /// Higher priorities serialize first when packets fill up.
    pub priority: u8,
    /// Buffered and lerped on the receiver instead of written directly.
    pub interpolate: bool,
    /// Change tick at the last send; the dirty comparison point.
    pub last_sent_tick: u64,
    /// Set once a `Once` component has been emitted.
    pub sent_once: bool,
}

impl ReplicatedComponent {
    pub fn new(id: ComponentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            mode: ReplicationMode::OnChange,
            priority: 128,
            interpolate: false,
            last_sent_tick: 0,
            sent_once: false,
        }
    }
}

/// Bookkeeping for one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub connected_at_tick: u64,
    pub last_rtt_ms: f32,
    /// True once the handshake completed; replication only targets
    /// handshaken peers.
    pub handshaken: bool,
    /// Session time when the handshake began, for timeout tracking.
    pub handshake_started_at: f64,
}

/// Maximum snapshots retained per interpolated component.
pub const SNAPSHOT_CAPACITY: usize = 32;

/// A ring of `(tick, payload)` snapshots for one interpolated component.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    entries: VecDeque<(u64, Vec<u8>)>,
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a snapshot, keeping entries tick-ordered and bounded.
    pub fn push(&mut self, tick: u64, payload: Vec<u8>) {
        // Out-of-order arrivals insert at their tick position.
        let at = self.entries.partition_point(|(t, _)| *t < tick);
        if self.entries.get(at).is_some_and(|(t, _)| *t == tick) {
            self.entries[at] = (tick, payload);
        } else {
            self.entries.insert(at, (tick, payload));
        }
        while self.entries.len() > SNAPSHOT_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// The two snapshots bracketing `tick`: the newest at-or-before and the
    /// oldest after. Either side may be absent at the buffer edges.
    pub fn bracket(&self, tick: u64) -> (Option<&(u64, Vec<u8>)>, Option<&(u64, Vec<u8>)>) {
        let at = self.entries.partition_point(|(t, _)| *t <= tick);
        let before = at.checked_sub(1).and_then(|i| self.entries.get(i));
        let after = self.entries.get(at);
        (before, after)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&(u64, Vec<u8>)> {
        self.entries.back()
    }
}

/// Linear interpolation between two transform snapshots.
///
/// Basis columns are mixed linearly, which is exact for translation and
/// good enough for the small inter-snapshot rotations replication deals in.
pub fn lerp_transform(a: &Transform3D, b: &Transform3D, t: f32) -> Transform3D {
    let t = t.clamp(0.0, 1.0);
    Transform3D {
        basis: a.basis * (1.0 - t) + b.basis * t,
        origin: a.origin.lerp(b.origin, t),
    }
}

/// Decode two transform snapshots and lerp between their ticks.
pub fn lerp_transform_snapshots(
    before: &(u64, Vec<u8>),
    after: &(u64, Vec<u8>),
    tick: u64,
    fraction: f32,
) -> Option<Transform3DComponent> {
    let a: Transform3DComponent = bincode::deserialize(&before.1).ok()?;
    let b: Transform3DComponent = bincode::deserialize(&after.1).ok()?;
    let span = after.0.saturating_sub(before.0).max(1) as f32;
    let t = ((tick.saturating_sub(before.0) as f32) + fraction) / span;
    Some(Transform3DComponent {
        transform: lerp_transform(&a.transform, &b.transform, t),
    })
}
