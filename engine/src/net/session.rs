//! Connection lifecycle and the fixed replication tick.
//!
//! A [`NetworkSession`] binds one world to one [`TransportPeer`] in either
//! the [`Host`](NetworkRole::Host) or [`Client`](NetworkRole::Client) role.
//! `process` pumps the transport, walks the handshake state machine,
//! exchanges ping/pong once a second, advances the fixed replication tick
//! (default 20 Hz), and applies interpolation on the client.
//!
//! # Handshake
//!
//! ```text
//! client                         host
//!   │ ── HandshakeRequest{ver} ──▶ │   version gate
//!   │ ◀─ HandshakeResponse{id,t} ─ │
//!   │ ── HandshakeComplete ──────▶ │   existing entities spawn
//! ```
//!
//! Any mismatch or a 5-second stall tears the connection down with a typed
//! [`DisconnectReason`].

use std::collections::HashMap;

use crate::ecs::entity::Entity;
use crate::ecs::world::World;
use crate::net::components::{AuthorityMode, PeerInfo, ReplicationMode};
use crate::net::replication::ReplicationState;
use crate::net::transport::{TransportEvent, TransportPeer};
use crate::net::types::{
    self, AuthorityChange, AuthorityRequest, ComponentBlob, Disconnect,
    DisconnectReason, EntityDespawn, EntitySpawn, EntityUpdateBatch, EntityUpdateMessage,
    HOST_PEER_ID, HandshakeComplete, HandshakeRequest, HandshakeResponse, InputAck,
    InputCommand, NetError, PacketType, PeerId, Ping, Pong, RpcCall, RpcResponse, TickSync,
    decode_body, decode_header, encode_packet,
};

/// The role this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    Host,
    Client,
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

/// Session tuning; configured by API, never by environment.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    /// Replication ticks per second.
    pub tick_rate: u32,
    /// Client-side interpolation delay.
    pub interpolation_delay_ms: f32,
    /// Spawn unknown entities automatically when no spawn callback is set.
    pub auto_spawn: bool,
    /// Seconds before an unfinished handshake is dropped.
    pub handshake_timeout: f32,
    pub protocol_version: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            interpolation_delay_ms: 100.0,
            auto_spawn: true,
            handshake_timeout: 5.0,
            protocol_version: types::PROTOCOL_VERSION,
        }
    }
}

/// Session traffic counters; reset on disconnect.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Host-provided factory for entities spawned by remote peers.
pub type SpawnCallback = Box<dyn FnMut(&mut World, &EntitySpawn) -> Option<Entity> + Send>;
/// Host-provided RPC dispatcher: `(world, network_id, method, args) -> result`.
pub type RpcCallback = Box<dyn FnMut(&mut World, u64, &str, &[u8]) -> Vec<u8> + Send>;

/// One peer's view of a replicated multiplayer session.
pub struct NetworkSession {
    transport: Box<dyn TransportPeer>,
    role: NetworkRole,
    state: ConnectionState,
    local_peer_id: PeerId,
    config: NetworkConfig,
    stats: NetworkStats,
    peers: HashMap<PeerId, PeerInfo>,
    replication: ReplicationState,

    /// Local fixed-tick counter; on the host this *is* the server tick.
    current_tick: u64,
    /// Last server tick learned from the host (client side).
    server_tick: u64,
    /// Session time when `server_tick` last advanced.
    last_tick_sync_at: f64,
    tick_accumulator: f64,
    ping_accumulator: f64,
    /// Session-relative wall time, advanced by `process` deltas.
    time: f64,
    handshake_started_at: f64,

    disconnect_reason: Option<DisconnectReason>,
    spawn_callback: Option<SpawnCallback>,
    rpc_callback: Option<RpcCallback>,
    rpc_responses: HashMap<u64, Vec<u8>>,
    next_nonce: u64,
    next_call_id: u64,
}

impl NetworkSession {
    /// Start hosting. The host is authoritative and always peer 1.
    pub fn host(transport: Box<dyn TransportPeer>) -> Self {
        Self::new(transport, NetworkRole::Host, ConnectionState::Connected)
    }

    /// Connect to a host. The handshake begins immediately and completes
    /// during `process`.
    pub fn connect(transport: Box<dyn TransportPeer>) -> Self {
        let mut session = Self::new(transport, NetworkRole::Client, ConnectionState::Connecting);
        session.begin_handshake();
        session
    }

    fn new(transport: Box<dyn TransportPeer>, role: NetworkRole, state: ConnectionState) -> Self {
        Self {
            transport,
            role,
            state,
            local_peer_id: if role == NetworkRole::Host { HOST_PEER_ID } else { 0 },
            config: NetworkConfig::default(),
            stats: NetworkStats::default(),
            peers: HashMap::new(),
            replication: ReplicationState::new(),
            current_tick: 0,
            server_tick: 0,
            last_tick_sync_at: 0.0,
            tick_accumulator: 0.0,
            ping_accumulator: 0.0,
            time: 0.0,
            handshake_started_at: 0.0,
            disconnect_reason: None,
            spawn_callback: None,
            rpc_callback: None,
            rpc_responses: HashMap::new(),
            next_nonce: 1,
            next_call_id: 1,
        }
    }

    pub fn config_mut(&mut self) -> &mut NetworkConfig {
        &mut self.config
    }

    pub fn set_spawn_callback(&mut self, callback: SpawnCallback) {
        self.spawn_callback = Some(callback);
    }

    pub fn set_rpc_callback(&mut self, callback: RpcCallback) {
        self.rpc_callback = Some(callback);
    }

    #[inline]
    pub fn role(&self) -> NetworkRole {
        self.role
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    #[inline]
    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    #[inline]
    pub fn server_tick(&self) -> u64 {
        if self.role == NetworkRole::Host {
            self.current_tick
        } else {
            self.server_tick
        }
    }

    #[inline]
    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    #[inline]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn peer_latency(&self, peer: PeerId) -> Option<f32> {
        self.peers.get(&peer).map(|p| p.last_rtt_ms)
    }

    #[inline]
    pub fn replication(&self) -> &ReplicationState {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationState {
        &mut self.replication
    }

    /// The server tick projected forward by wall time since the last sync.
    pub fn estimated_server_tick(&self) -> u64 {
        if self.role == NetworkRole::Host {
            return self.current_tick;
        }
        let elapsed = (self.time - self.last_tick_sync_at).max(0.0);
        self.server_tick + (elapsed * self.config.tick_rate as f64) as u64
    }

    // ===================== lifecycle =====================

    /// Tear down the session, notifying the other side.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        let body = Disconnect { reason };
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            let _ = self.send_to(peer, PacketType::Disconnect, &body);
            self.transport.disconnect_peer(peer);
        }
        self.teardown(reason);
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        self.state = ConnectionState::Disconnected;
        self.disconnect_reason = Some(reason);
        self.peers.clear();
        self.stats = NetworkStats::default();
    }

    /// Kick a peer (host only).
    pub fn kick_peer(&mut self, peer: PeerId, reason: DisconnectReason) {
        if self.role != NetworkRole::Host {
            return;
        }
        let _ = self.send_to(peer, PacketType::Disconnect, &Disconnect { reason });
        self.transport.disconnect_peer(peer);
        self.peers.remove(&peer);
    }

    fn begin_handshake(&mut self) {
        self.state = ConnectionState::Handshaking;
        self.handshake_started_at = self.time;
        let body = HandshakeRequest {
            protocol_version: self.config.protocol_version,
        };
        let _ = self.send_to(HOST_PEER_ID, PacketType::HandshakeRequest, &body);
    }

    // ===================== pump =====================

    /// Drive the session: pump the transport, run timers, and fire
    /// replication ticks. Call every frame with the frame delta.
    pub fn process(&mut self, world: &mut World, delta: f64) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.time += delta;

        while let Some(event) = self.transport.poll() {
            match event {
                TransportEvent::PeerConnected(peer) => self.on_peer_connected(peer),
                TransportEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
                TransportEvent::Message { peer, payload, .. } => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += payload.len() as u64;
                    if let Err(error) = self.handle_packet(world, peer, &payload) {
                        log::warn!("malformed packet from peer {peer}: {error}");
                    }
                    if self.state == ConnectionState::Disconnected {
                        return;
                    }
                }
            }
        }

        self.run_timers();

        // Fixed replication tick.
        let interval = 1.0 / self.config.tick_rate as f64;
        self.tick_accumulator += delta;
        while self.tick_accumulator >= interval {
            self.tick_accumulator -= interval;
            self.current_tick += 1;
            self.replication_tick(world);
        }

        // Client-side interpolation runs every frame against the projected
        // server timeline.
        if self.role == NetworkRole::Client && self.state == ConnectionState::Connected {
            let delay_ticks = (self.config.interpolation_delay_ms / 1000.0
                * self.config.tick_rate as f32) as u64;
            let render_tick = self.estimated_server_tick().saturating_sub(delay_ticks);
            self.replication.apply_interpolation(world, render_tick, 0.0);
        }
    }

    fn run_timers(&mut self) {
        // Client handshake timeout.
        if self.role == NetworkRole::Client
            && self.state == ConnectionState::Handshaking
            && self.time - self.handshake_started_at > self.config.handshake_timeout as f64
        {
            log::warn!("handshake timed out");
            self.disconnect(DisconnectReason::Timeout);
            return;
        }

        // Host: drop peers that never complete their handshake.
        if self.role == NetworkRole::Host {
            let stalled: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| {
                    !p.handshaken
                        && self.time - p.handshake_started_at
                            > self.config.handshake_timeout as f64
                })
                .map(|p| p.peer_id)
                .collect();
            for peer in stalled {
                log::warn!("peer {peer} handshake timed out");
                self.kick_peer(peer, DisconnectReason::Timeout);
            }
        }

        // Ping every second; `ping_accumulator` holds the last ping time.
        if self.state == ConnectionState::Connected || self.role == NetworkRole::Host {
            if self.time - self.ping_accumulator >= 1.0 {
                self.ping_accumulator = self.time;
                let body = Ping {
                    nonce: self.next_nonce,
                    sent_at_ms: (self.time * 1000.0) as u64,
                };
                self.next_nonce += 1;
                let targets: Vec<PeerId> = self.peers.keys().copied().collect();
                for peer in targets {
                    let _ = self.send_to(peer, PacketType::Ping, &body);
                }
            }
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        if self.role != NetworkRole::Host {
            return;
        }
        self.peers.insert(
            peer,
            PeerInfo {
                peer_id: peer,
                connected_at_tick: self.current_tick,
                last_rtt_ms: 0.0,
                handshaken: false,
                handshake_started_at: self.time,
            },
        );
    }

    fn on_peer_disconnected(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        if self.role == NetworkRole::Client && peer == HOST_PEER_ID {
            let reason = self
                .disconnect_reason
                .unwrap_or(DisconnectReason::TransportError);
            self.teardown(reason);
        }
    }

    // ===================== replication tick =====================

    fn replication_tick(&mut self, world: &mut World) {
        // Host: settle authority transfers before collecting, so this
        // tick's updates already flow from the new holder.
        if self.role == NetworkRole::Host {
            for (network_id, winner, denied) in self.replication.resolve_authority_requests() {
                let change = AuthorityChange {
                    network_id,
                    authority_peer: winner,
                };
                self.broadcast(PacketType::AuthorityChange, &change, None);
                for peer in denied {
                    // The denial names the actual holder.
                    let _ = self.send_to(peer, PacketType::AuthorityChange, &change);
                }
            }
        }

        let tick = self.current_tick;
        let (reliable, unreliable) = self.replication.collect(world, self.local_peer_id, tick);
        let mtu = self.transport.mtu();
        for batch in ReplicationState::batch(reliable, tick, mtu) {
            self.send_update_batch(PacketType::EntityUpdateReliable, &batch);
        }
        for batch in ReplicationState::batch(unreliable, tick, mtu) {
            self.send_update_batch(PacketType::EntityUpdate, &batch);
        }

        if self.role == NetworkRole::Host {
            let sync = TickSync { server_tick: tick };
            self.broadcast(PacketType::TickSync, &sync, None);
        }

        let dropped = self.replication.purge_pending(tick);
        if dropped > 0 {
            log::debug!("dropped {dropped} pending spawn buffers");
        }
    }

    fn send_update_batch(&mut self, packet_type: PacketType, batch: &EntityUpdateBatch) {
        match self.role {
            NetworkRole::Host => self.broadcast(packet_type, batch, None),
            NetworkRole::Client => {
                if self.state == ConnectionState::Connected {
                    let _ = self.send_to(HOST_PEER_ID, packet_type, batch);
                }
            }
        }
    }

    // ===================== packet handling =====================

    fn handle_packet(
        &mut self,
        world: &mut World,
        from: PeerId,
        packet: &[u8],
    ) -> Result<(), NetError> {
        let (packet_type, _channel, body) = decode_header(packet)?;
        match packet_type {
            PacketType::HandshakeRequest => {
                let request: HandshakeRequest = decode_body(body)?;
                self.on_handshake_request(from, request)
            }
            PacketType::HandshakeResponse => {
                let response: HandshakeResponse = decode_body(body)?;
                self.on_handshake_response(response)
            }
            PacketType::HandshakeComplete => {
                decode_body::<HandshakeComplete>(body)?;
                self.on_handshake_complete(world, from)
            }
            PacketType::Disconnect => {
                let disconnect: Disconnect = decode_body(body)?;
                if self.role == NetworkRole::Client {
                    self.teardown(disconnect.reason);
                } else {
                    self.peers.remove(&from);
                }
                Ok(())
            }
            PacketType::Ping => {
                let ping: Ping = decode_body(body)?;
                let _ = self.send_to(
                    from,
                    PacketType::Pong,
                    &Pong {
                        nonce: ping.nonce,
                        sent_at_ms: ping.sent_at_ms,
                    },
                );
                Ok(())
            }
            PacketType::Pong => {
                let pong: Pong = decode_body(body)?;
                let rtt = (self.time * 1000.0 - pong.sent_at_ms as f64).max(0.0) as f32;
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.last_rtt_ms = rtt;
                }
                Ok(())
            }
            PacketType::TickSync => {
                let sync: TickSync = decode_body(body)?;
                if self.role == NetworkRole::Client && sync.server_tick > self.server_tick {
                    self.server_tick = sync.server_tick;
                    self.last_tick_sync_at = self.time;
                }
                Ok(())
            }
            PacketType::EntityUpdate | PacketType::EntityUpdateReliable => {
                let batch: EntityUpdateBatch = decode_body(body)?;
                self.on_update_batch(world, from, packet_type, batch);
                Ok(())
            }
            PacketType::EntitySpawn => {
                let spawn: EntitySpawn = decode_body(body)?;
                self.on_entity_spawn(world, spawn);
                Ok(())
            }
            PacketType::EntityDespawn => {
                let despawn: EntityDespawn = decode_body(body)?;
                self.on_entity_despawn(world, despawn.network_id);
                Ok(())
            }
            PacketType::AuthorityRequest => {
                let request: AuthorityRequest = decode_body(body)?;
                if self.role == NetworkRole::Host {
                    self.replication.queue_authority_request(request.network_id, from);
                }
                Ok(())
            }
            PacketType::AuthorityChange => {
                let change: AuthorityChange = decode_body(body)?;
                if let Some(net) = self.replication.get_mut(change.network_id) {
                    net.authority_peer = change.authority_peer;
                }
                Ok(())
            }
            PacketType::RpcCall => {
                let call: RpcCall = decode_body(body)?;
                let result = self
                    .rpc_callback
                    .as_mut()
                    .map(|callback| callback(world, call.network_id, &call.method, &call.args))
                    .unwrap_or_default();
                let _ = self.send_to(
                    from,
                    PacketType::RpcResponse,
                    &RpcResponse {
                        call_id: call.call_id,
                        result,
                    },
                );
                Ok(())
            }
            PacketType::RpcResponse => {
                let response: RpcResponse = decode_body(body)?;
                self.rpc_responses.insert(response.call_id, response.result);
                Ok(())
            }
            PacketType::InputCommand => {
                let input: InputCommand = decode_body(body)?;
                let _ = self.send_to(from, PacketType::InputAck, &InputAck { tick: input.tick });
                Ok(())
            }
            PacketType::InputAck => {
                decode_body::<InputAck>(body)?;
                Ok(())
            }
            PacketType::WorldSnapshot | PacketType::WorldSnapshotDelta => {
                let batch: EntityUpdateBatch = decode_body(body)?;
                self.on_update_batch(world, from, packet_type, batch);
                Ok(())
            }
        }
    }

    fn on_handshake_request(
        &mut self,
        from: PeerId,
        request: HandshakeRequest,
    ) -> Result<(), NetError> {
        if self.role != NetworkRole::Host {
            return Ok(());
        }
        if request.protocol_version != self.config.protocol_version {
            log::warn!(
                "peer {from} speaks protocol {} (want {}); disconnecting",
                request.protocol_version,
                self.config.protocol_version
            );
            let _ = self.send_to(
                from,
                PacketType::Disconnect,
                &Disconnect {
                    reason: DisconnectReason::UnsupportedProtocol,
                },
            );
            self.transport.disconnect_peer(from);
            self.peers.remove(&from);
            return Ok(());
        }
        let response = HandshakeResponse {
            assigned_peer_id: from,
            server_tick: self.current_tick,
        };
        self.send_to(from, PacketType::HandshakeResponse, &response)
    }

    fn on_handshake_response(&mut self, response: HandshakeResponse) -> Result<(), NetError> {
        if self.role != NetworkRole::Client || self.state != ConnectionState::Handshaking {
            return Ok(());
        }
        self.local_peer_id = response.assigned_peer_id;
        self.server_tick = response.server_tick;
        self.last_tick_sync_at = self.time;
        self.peers.insert(
            HOST_PEER_ID,
            PeerInfo {
                peer_id: HOST_PEER_ID,
                connected_at_tick: self.current_tick,
                last_rtt_ms: 0.0,
                handshaken: true,
                handshake_started_at: self.handshake_started_at,
            },
        );
        self.state = ConnectionState::Connected;
        self.send_to(HOST_PEER_ID, PacketType::HandshakeComplete, &HandshakeComplete)
    }

    fn on_handshake_complete(&mut self, world: &mut World, from: PeerId) -> Result<(), NetError> {
        if self.role != NetworkRole::Host {
            return Ok(());
        }
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.handshaken = true;
        }
        // Bring the new peer up to date with every networked entity.
        let spawns: Vec<EntitySpawn> = self
            .replication
            .iter()
            .map(|net| EntitySpawn {
                network_id: net.network_id,
                spawn_scene: net.spawn_scene.clone(),
                components: self.replication.spawn_blobs(world, net.network_id),
            })
            .collect();
        for spawn in spawns {
            let _ = self.send_to(from, PacketType::EntitySpawn, &spawn);
        }
        Ok(())
    }

    fn on_update_batch(
        &mut self,
        world: &mut World,
        from: PeerId,
        packet_type: PacketType,
        batch: EntityUpdateBatch,
    ) {
        for update in batch.updates {
            match self.role {
                NetworkRole::Host => {
                    // Only the entity's authority peer may push state; the
                    // host relays accepted client-authority updates onward.
                    let authorized = self
                        .replication
                        .get(update.network_id)
                        .is_some_and(|net| net.authority_peer == from);
                    if !authorized {
                        continue;
                    }
                    if self.replication.apply_update(world, &update).is_ok() {
                        let relay = EntityUpdateBatch {
                            tick: batch.tick,
                            updates: vec![update],
                        };
                        self.broadcast(packet_type, &relay, Some(from));
                    }
                }
                NetworkRole::Client => {
                    // Updates echoing our own authority are ignored.
                    if self
                        .replication
                        .get(update.network_id)
                        .is_some_and(|net| net.authority_peer == self.local_peer_id)
                    {
                        continue;
                    }
                    if self.replication.apply_update(world, &update).is_err() {
                        self.replication.buffer_pending(update, self.current_tick);
                    }
                }
            }
        }
    }

    fn on_entity_spawn(&mut self, world: &mut World, spawn: EntitySpawn) {
        if self.role != NetworkRole::Client
            || self.replication.entity_of(spawn.network_id).is_some()
        {
            return;
        }
        let entity = match self.spawn_callback.as_mut() {
            Some(callback) => match callback(world, &spawn) {
                Some(entity) => entity,
                None => return,
            },
            None if self.config.auto_spawn => world.create_entity(),
            None => return,
        };
        self.replication
            .register_with_id(entity, spawn.network_id, HOST_PEER_ID, true);

        // Mirror the sender's replicated component set so later updates and
        // interpolation configuration resolve.
        for blob in &spawn.components {
            if let Some(id) = world.component_id(&blob.name) {
                let _ = self
                    .replication
                    .add_replicated_component(entity, id, blob.name.clone());
                if let Err(error) = world.attach_bytes(entity, id, &blob.data) {
                    log::debug!("spawn blob for `{}` rejected: {error}", blob.name);
                }
            }
        }

        // Apply anything that arrived ahead of the spawn.
        for update in self.replication.take_pending(spawn.network_id) {
            let _ = self.replication.apply_update(world, &update);
        }
    }

    fn on_entity_despawn(&mut self, world: &mut World, network_id: u64) {
        if self.role != NetworkRole::Client {
            return;
        }
        if let Some(entity) = self.replication.entity_of(network_id) {
            let spawned_by_remote = self
                .replication
                .get(network_id)
                .is_some_and(|net| net.spawned_by_remote);
            self.replication.unregister(entity);
            if spawned_by_remote {
                let _ = world.destroy_entity(entity);
            }
        }
    }

    // ===================== host API =====================

    /// Register an entity for replication and announce it (host only).
    pub fn register_networked_entity(
        &mut self,
        world: &mut World,
        entity: Entity,
        spawn_scene: impl Into<String>,
    ) -> Result<u64, NetError> {
        if self.role != NetworkRole::Host {
            return Err(NetError::WrongRole("Host"));
        }
        let network_id = self.replication.register(entity, HOST_PEER_ID);
        if let Some(net) = self.replication.get_mut(network_id) {
            net.spawn_scene = spawn_scene.into();
        }
        let _ = world; // spawn blobs are emitted once components are declared
        Ok(network_id)
    }

    /// Remove an entity from replication and announce the despawn.
    pub fn unregister_networked_entity(&mut self, entity: Entity) -> Result<(), NetError> {
        let network_id = self
            .replication
            .unregister(entity)
            .ok_or(NetError::NotNetworked)?;
        if self.role == NetworkRole::Host {
            self.broadcast(
                PacketType::EntityDespawn,
                &EntityDespawn { network_id },
                None,
            );
        }
        Ok(())
    }

    /// Declare which components replicate for an entity, by registered
    /// name. Unknown names are skipped with a log line.
    pub fn set_entity_replicated_components(
        &mut self,
        world: &mut World,
        entity: Entity,
        components: &[&str],
    ) -> Result<(), NetError> {
        for name in components {
            match world.component_id(name) {
                Some(id) => {
                    self.replication
                        .add_replicated_component(entity, id, *name)?;
                }
                None => log::warn!("cannot replicate unregistered component `{name}`"),
            }
        }
        // Announce the (now describable) entity to handshaken peers.
        if self.role == NetworkRole::Host {
            if let Some(network_id) = self.replication.network_id_of(entity) {
                let spawn = EntitySpawn {
                    network_id,
                    spawn_scene: self
                        .replication
                        .get(network_id)
                        .map(|net| net.spawn_scene.clone())
                        .unwrap_or_default(),
                    components: self.replication.spawn_blobs(world, network_id),
                };
                self.broadcast(PacketType::EntitySpawn, &spawn, None);
            }
        }
        Ok(())
    }

    /// Tune one component's replication mode, interpolation, and priority.
    pub fn configure_component_replication(
        &mut self,
        world: &World,
        entity: Entity,
        component: &str,
        mode: ReplicationMode,
        interpolate: bool,
        priority: u8,
    ) -> Result<(), NetError> {
        let id = world.component_id(component).ok_or(NetError::NotNetworked)?;
        self.replication
            .configure_component(entity, id, mode, interpolate, priority)
    }

    pub fn set_entity_authority(
        &mut self,
        entity: Entity,
        mode: AuthorityMode,
        authority_peer: PeerId,
    ) -> Result<(), NetError> {
        self.replication.set_authority(entity, mode, authority_peer)
    }

    /// Ask the host for authority over a transferable entity (client only).
    pub fn request_authority(&mut self, entity: Entity) -> Result<(), NetError> {
        let network_id = self
            .replication
            .network_id_of(entity)
            .ok_or(NetError::NotNetworked)?;
        match self.role {
            NetworkRole::Client => {
                self.send_to(
                    HOST_PEER_ID,
                    PacketType::AuthorityRequest,
                    &AuthorityRequest { network_id },
                )
            }
            NetworkRole::Host => {
                self.replication
                    .queue_authority_request(network_id, HOST_PEER_ID);
                Ok(())
            }
        }
    }

    /// Invoke a method on a networked entity across the wire.
    pub fn entity_rpc(
        &mut self,
        entity: Entity,
        method: &str,
        args: Vec<u8>,
        target: Option<PeerId>,
    ) -> Result<u64, NetError> {
        let network_id = self
            .replication
            .network_id_of(entity)
            .ok_or(NetError::NotNetworked)?;
        let call_id = self.next_call_id;
        self.next_call_id += 1;
        let call = RpcCall {
            network_id,
            call_id,
            method: method.to_string(),
            args,
        };
        match (self.role, target) {
            (NetworkRole::Client, _) => {
                self.send_to(HOST_PEER_ID, PacketType::RpcCall, &call)?;
            }
            (NetworkRole::Host, Some(peer)) => {
                self.send_to(peer, PacketType::RpcCall, &call)?;
            }
            (NetworkRole::Host, None) => {
                self.broadcast(PacketType::RpcCall, &call, None);
            }
        }
        Ok(call_id)
    }

    /// The response to a finished RPC, if it has arrived.
    pub fn take_rpc_response(&mut self, call_id: u64) -> Option<Vec<u8>> {
        self.rpc_responses.remove(&call_id)
    }

    /// Send an input command for a client-authoritative entity.
    pub fn send_input(&mut self, payload: Vec<u8>) -> Result<(), NetError> {
        if self.role != NetworkRole::Client {
            return Err(NetError::WrongRole("Client"));
        }
        self.send_to(
            HOST_PEER_ID,
            PacketType::InputCommand,
            &InputCommand {
                tick: self.current_tick,
                payload,
            },
        )
    }

    // ===================== send helpers =====================

    fn send_to<T: serde::Serialize>(
        &mut self,
        peer: PeerId,
        packet_type: PacketType,
        body: &T,
    ) -> Result<(), NetError> {
        let packet = encode_packet(packet_type, body)?;
        self.transport
            .send(peer, packet_type.channel(), &packet)
            .map(|_| {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += packet.len() as u64;
            })
    }

    /// Send to every handshaken peer, optionally excluding one.
    fn broadcast<T: serde::Serialize>(
        &mut self,
        packet_type: PacketType,
        body: &T,
        exclude: Option<PeerId>,
    ) {
        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.handshaken && Some(p.peer_id) != exclude)
            .map(|p| p.peer_id)
            .collect();
        for peer in targets {
            let _ = self.send_to(peer, packet_type, body);
        }
    }

    /// A blob list for diagnostics: the components a spawn of this entity
    /// would currently carry.
    pub fn describe_entity(&self, world: &World, entity: Entity) -> Vec<ComponentBlob> {
        self.replication
            .network_id_of(entity)
            .map(|network_id| self.replication.spawn_blobs(world, network_id))
            .unwrap_or_default()
    }

    /// Silently drop an incoming local write on a client that lacks
    /// authority. Hosts always pass.
    pub fn has_authority(&self, entity: Entity) -> bool {
        self.replication
            .network_id_of(entity)
            .and_then(|id| self.replication.get(id))
            .map(|net| net.authority_peer == self.local_peer_id)
            .unwrap_or(self.role == NetworkRole::Host)
    }

    /// One update message applied directly; test and tooling hook.
    pub fn inject_update(&mut self, world: &mut World, update: EntityUpdateMessage) {
        if self.replication.apply_update(world, &update).is_err() {
            self.replication.buffer_pending(update, self.current_tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use crate::component;
    use crate::core::tasks::WorkerPool;
    use crate::ecs::world::WorldId;
    use crate::net::transport::MemoryHub;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health {
        hp: u32,
    }
    component!(Health, "Health");

    fn net_world(name: &str) -> World {
        let mut world = World::with_workers(
            WorldId::new(0),
            name,
            Arc::new(WorkerPool::single_threaded()),
        );
        world.register_serde::<Health>().unwrap();
        world
    }

    /// Pump both sides until quiescent or `seconds` of simulated time pass.
    fn pump(
        host: &mut NetworkSession,
        host_world: &mut World,
        client: &mut NetworkSession,
        client_world: &mut World,
        seconds: f64,
    ) {
        let step = 0.025;
        let mut elapsed = 0.0;
        while elapsed < seconds {
            host.process(host_world, step);
            client.process(client_world, step);
            elapsed += step;
        }
    }

    fn connected_pair() -> (NetworkSession, World, NetworkSession, World) {
        let hub = MemoryHub::new();
        let mut host = NetworkSession::host(Box::new(hub.host_endpoint()));
        let mut client = NetworkSession::connect(Box::new(hub.connect_client()));
        let mut host_world = net_world("host");
        let mut client_world = net_world("client");
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.2);
        (host, host_world, client, client_world)
    }

    #[test]
    fn handshake_succeeds_with_matching_protocol() {
        // Given
        let hub = MemoryHub::new();
        let mut host = NetworkSession::host(Box::new(hub.host_endpoint()));
        let mut client = NetworkSession::connect(Box::new(hub.connect_client()));
        let mut host_world = net_world("host");
        let mut client_world = net_world("client");

        // When: well under five simulated seconds
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.5);

        // Then
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.local_peer_id() >= 2);
        assert!(host.peers().any(|p| p.handshaken));
    }

    #[test]
    fn version_mismatch_disconnects_with_typed_reason() {
        // Given a client speaking a different protocol version
        let hub = MemoryHub::new();
        let mut host = NetworkSession::host(Box::new(hub.host_endpoint()));
        let transport = Box::new(hub.connect_client());
        let mut client = NetworkSession::new(
            transport,
            NetworkRole::Client,
            ConnectionState::Connecting,
        );
        client.config_mut().protocol_version = 99;
        client.begin_handshake();

        let mut host_world = net_world("host");
        let mut client_world = net_world("client");

        // When
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.5);

        // Then
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            client.disconnect_reason(),
            Some(DisconnectReason::UnsupportedProtocol)
        );
        assert_eq!(host.peers().count(), 0);
    }

    #[test]
    fn handshake_timeout_disconnects_client() {
        // Given a client whose requests reach nobody (no host session
        // polls the hub's host endpoint)
        let hub = MemoryHub::new();
        let _host_endpoint = hub.host_endpoint();
        let mut client = NetworkSession::connect(Box::new(hub.connect_client()));
        let mut client_world = net_world("client");

        // When: six simulated seconds pass
        for _ in 0..240 {
            client.process(&mut client_world, 0.025);
        }

        // Then
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.disconnect_reason(), Some(DisconnectReason::Timeout));
    }

    #[test]
    fn replicated_entity_spawns_and_updates_on_client() {
        // Given a connected pair and a networked entity on the host
        let (mut host, mut host_world, mut client, mut client_world) = connected_pair();
        let entity = host_world.create_entity();
        host_world.attach(entity, Health { hp: 10 }).unwrap();
        host.register_networked_entity(&mut host_world, entity, "")
            .unwrap();
        host.set_entity_replicated_components(&mut host_world, entity, &["Health"])
            .unwrap();

        // When: replication ticks flow
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.3);

        // Then: the client materialized the entity with its state
        let network_id = host.replication().network_id_of(entity).unwrap();
        let mirrored = client.replication().entity_of(network_id).expect("spawned");
        assert_eq!(client_world.get::<Health>(mirrored), Some(&Health { hp: 10 }));

        // And a later mutation arrives too
        host_world.progress(0.0);
        host_world.attach(entity, Health { hp: 4 }).unwrap();
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.3);
        assert_eq!(client_world.get::<Health>(mirrored), Some(&Health { hp: 4 }));
    }

    #[test]
    fn observed_values_are_a_subsequence_of_server_writes() {
        // Given
        let (mut host, mut host_world, mut client, mut client_world) = connected_pair();
        let entity = host_world.create_entity();
        host_world.attach(entity, Health { hp: 0 }).unwrap();
        host.register_networked_entity(&mut host_world, entity, "")
            .unwrap();
        host.set_entity_replicated_components(&mut host_world, entity, &["Health"])
            .unwrap();
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.2);
        let network_id = host.replication().network_id_of(entity).unwrap();
        let mirrored = client.replication().entity_of(network_id).unwrap();

        // When: the server walks hp through 1..=5, clients sampling along
        let mut observed = Vec::new();
        for hp in 1..=5u32 {
            host_world.progress(0.0);
            host_world.attach(entity, Health { hp }).unwrap();
            pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.1);
            if let Some(health) = client_world.get::<Health>(mirrored) {
                observed.push(health.hp);
            }
        }

        // Then: what the client saw is a subsequence of what was written
        let written = [1u32, 2, 3, 4, 5];
        let mut cursor = written.iter();
        for value in &observed {
            assert!(
                cursor.any(|w| w == value),
                "{observed:?} is not a subsequence of {written:?}"
            );
        }
        assert_eq!(observed.last(), Some(&5));
    }

    #[test]
    fn despawn_removes_remote_entity() {
        // Given a replicated entity on both sides
        let (mut host, mut host_world, mut client, mut client_world) = connected_pair();
        let entity = host_world.create_entity();
        host_world.attach(entity, Health { hp: 1 }).unwrap();
        host.register_networked_entity(&mut host_world, entity, "")
            .unwrap();
        host.set_entity_replicated_components(&mut host_world, entity, &["Health"])
            .unwrap();
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.2);
        let network_id = host.replication().network_id_of(entity).unwrap();
        let mirrored = client.replication().entity_of(network_id).unwrap();
        assert!(client_world.is_live(mirrored));

        // When
        host.unregister_networked_entity(entity).unwrap();
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 0.2);

        // Then
        assert!(!client_world.is_live(mirrored));
        assert!(client.replication().entity_of(network_id).is_none());
    }

    #[test]
    fn authority_transfer_earliest_request_wins() {
        // Given a transferable entity and two clients
        let hub = MemoryHub::new();
        let mut host = NetworkSession::host(Box::new(hub.host_endpoint()));
        let mut client_a = NetworkSession::connect(Box::new(hub.connect_client()));
        let mut client_b = NetworkSession::connect(Box::new(hub.connect_client()));
        let mut host_world = net_world("host");
        let mut world_a = net_world("a");
        let mut world_b = net_world("b");

        let step = 0.025;
        let mut pump_all = |host: &mut NetworkSession,
                            hw: &mut World,
                            a: &mut NetworkSession,
                            aw: &mut World,
                            b: &mut NetworkSession,
                            bw: &mut World,
                            seconds: f64| {
            let mut elapsed = 0.0;
            while elapsed < seconds {
                host.process(hw, step);
                a.process(aw, step);
                b.process(bw, step);
                elapsed += step;
            }
        };

        pump_all(
            &mut host, &mut host_world, &mut client_a, &mut world_a, &mut client_b, &mut world_b,
            0.3,
        );

        let entity = host_world.create_entity();
        host_world.attach(entity, Health { hp: 1 }).unwrap();
        let network_id = host
            .register_networked_entity(&mut host_world, entity, "")
            .unwrap();
        host.set_entity_replicated_components(&mut host_world, entity, &["Health"])
            .unwrap();
        host.set_entity_authority(entity, AuthorityMode::Transferable, HOST_PEER_ID)
            .unwrap();
        pump_all(
            &mut host, &mut host_world, &mut client_a, &mut world_a, &mut client_b, &mut world_b,
            0.3,
        );

        // When: both clients request authority, A first
        let entity_a = client_a.replication().entity_of(network_id).unwrap();
        let entity_b = client_b.replication().entity_of(network_id).unwrap();
        client_a.request_authority(entity_a).unwrap();
        client_b.request_authority(entity_b).unwrap();
        pump_all(
            &mut host, &mut host_world, &mut client_a, &mut world_a, &mut client_b, &mut world_b,
            0.3,
        );

        // Then: the earliest request won everywhere
        let winner = client_a.local_peer_id();
        assert_eq!(
            host.replication().get(network_id).unwrap().authority_peer,
            winner
        );
        assert_eq!(
            client_a.replication().get(network_id).unwrap().authority_peer,
            winner
        );
        assert_eq!(
            client_b.replication().get(network_id).unwrap().authority_peer,
            winner
        );
    }

    #[test]
    fn ping_pong_measures_rtt() {
        // Given
        let (mut host, mut host_world, mut client, mut client_world) = connected_pair();

        // When: enough simulated time for at least one ping round trip
        pump(&mut host, &mut host_world, &mut client, &mut client_world, 2.5);

        // Then: both directions measured something
        assert!(client.peer_latency(HOST_PEER_ID).is_some());
    }
}
