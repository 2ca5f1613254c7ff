//! Wire protocol: packet taxonomy, the fixed header, and message bodies.
//!
//! Every packet is `header || body`: a 7-byte little-endian header
//! (`packet_type: u16`, `channel: u8`, `payload_length: u32`) followed by a
//! bincode-encoded body. A single [`PROTOCOL_VERSION`] byte exchanged in
//! the handshake gates the session; any mismatch tears the connection down
//! with a typed [`DisconnectReason`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bumped on every incompatible wire change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 7;

/// Transport-assigned peer identifier. The host is always peer 1.
pub type PeerId = u32;

/// The host's transport address.
pub const HOST_PEER_ID: PeerId = 1;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("unknown packet type {0}")]
    UnknownPacketType(u16),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("transport send failed")]
    TransportSend,

    #[error("not connected")]
    NotConnected,

    #[error("operation requires the {0:?} role")]
    WrongRole(&'static str),

    #[error("entity is not registered for networking")]
    NotNetworked,
}

/// Delivery guarantees requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    Reliable = 0,
    Unreliable = 1,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reliable),
            1 => Some(Self::Unreliable),
            _ => None,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Graceful,
    UnsupportedProtocol,
    Timeout,
    Kicked,
    TransportError,
}

/// Every message the protocol speaks. Reliable and unreliable types are
/// fixed by the protocol, not by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    // Reliable.
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    HandshakeComplete = 3,
    Disconnect = 4,
    EntitySpawn = 5,
    EntityDespawn = 6,
    AuthorityRequest = 7,
    AuthorityChange = 8,
    RpcCall = 9,
    RpcResponse = 10,
    InputAck = 11,
    EntityUpdateReliable = 12,
    // Unreliable.
    Ping = 20,
    Pong = 21,
    TickSync = 22,
    WorldSnapshot = 23,
    WorldSnapshotDelta = 24,
    InputCommand = 25,
    EntityUpdate = 26,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Result<Self, NetError> {
        use PacketType::*;
        Ok(match value {
            1 => HandshakeRequest,
            2 => HandshakeResponse,
            3 => HandshakeComplete,
            4 => Disconnect,
            5 => EntitySpawn,
            6 => EntityDespawn,
            7 => AuthorityRequest,
            8 => AuthorityChange,
            9 => RpcCall,
            10 => RpcResponse,
            11 => InputAck,
            12 => EntityUpdateReliable,
            20 => Ping,
            21 => Pong,
            22 => TickSync,
            23 => WorldSnapshot,
            24 => WorldSnapshotDelta,
            25 => InputCommand,
            26 => EntityUpdate,
            other => return Err(NetError::UnknownPacketType(other)),
        })
    }

    /// The channel this packet type travels on.
    pub fn channel(&self) -> Channel {
        use PacketType::*;
        match self {
            HandshakeRequest | HandshakeResponse | HandshakeComplete | Disconnect | EntitySpawn
            | EntityDespawn | AuthorityRequest | AuthorityChange | RpcCall | RpcResponse
            | InputAck | EntityUpdateReliable => Channel::Reliable,
            Ping | Pong | TickSync | WorldSnapshot | WorldSnapshotDelta | InputCommand
            | EntityUpdate => Channel::Unreliable,
        }
    }
}

/// Encode `header || body` for one message.
pub fn encode_packet<T: Serialize>(packet_type: PacketType, body: &T) -> Result<Vec<u8>, NetError> {
    let payload =
        bincode::serialize(body).map_err(|_| NetError::MalformedPacket("body encode"))?;
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&(packet_type as u16).to_le_bytes());
    packet.push(packet_type.channel() as u8);
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.extend_from_slice(&payload);
    Ok(packet)
}

/// Split a raw packet into its type, channel, and body bytes.
pub fn decode_header(packet: &[u8]) -> Result<(PacketType, Channel, &[u8]), NetError> {
    if packet.len() < HEADER_SIZE {
        return Err(NetError::MalformedPacket("short header"));
    }
    let packet_type = PacketType::from_u16(u16::from_le_bytes([packet[0], packet[1]]))?;
    let channel =
        Channel::from_u8(packet[2]).ok_or(NetError::MalformedPacket("bad channel"))?;
    let length = u32::from_le_bytes([packet[3], packet[4], packet[5], packet[6]]) as usize;
    let body = &packet[HEADER_SIZE..];
    if body.len() != length {
        return Err(NetError::MalformedPacket("length mismatch"));
    }
    Ok((packet_type, channel, body))
}

/// Decode a packet body.
pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, NetError> {
    bincode::deserialize(body).map_err(|_| NetError::MalformedPacket("body decode"))
}

// ===================== message bodies =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub assigned_peer_id: PeerId,
    pub server_tick: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeComplete;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSync {
    pub server_tick: u64,
}

/// One component's serialized value. Components are identified on the wire
/// by their stable registered name; `type_order` carries the sender's dense
/// type id purely to fix intra-entity ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentBlob {
    pub name: String,
    pub type_order: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdateMessage {
    pub network_id: u64,
    pub tick: u64,
    pub components: Vec<ComponentBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdateBatch {
    pub tick: u64,
    pub updates: Vec<EntityUpdateMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySpawn {
    pub network_id: u64,
    pub spawn_scene: String,
    pub components: Vec<ComponentBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDespawn {
    pub network_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityRequest {
    pub network_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityChange {
    pub network_id: u64,
    pub authority_peer: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub network_id: u64,
    pub call_id: u64,
    pub method: String,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub call_id: u64,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputCommand {
    pub tick: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAck {
    pub tick: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trips_through_header() {
        // Given
        let body = HandshakeResponse {
            assigned_peer_id: 2,
            server_tick: 77,
        };

        // When
        let packet = encode_packet(PacketType::HandshakeResponse, &body).unwrap();
        let (packet_type, channel, payload) = decode_header(&packet).unwrap();

        // Then
        assert_eq!(packet_type, PacketType::HandshakeResponse);
        assert_eq!(channel, Channel::Reliable);
        let decoded: HandshakeResponse = decode_body(payload).unwrap();
        assert_eq!(decoded.assigned_peer_id, 2);
        assert_eq!(decoded.server_tick, 77);
    }

    #[test]
    fn short_and_corrupt_packets_are_rejected() {
        assert!(decode_header(&[1, 0]).is_err());

        let mut packet = encode_packet(PacketType::Ping, &Ping {
            nonce: 1,
            sent_at_ms: 2,
        })
        .unwrap();
        // Truncate the body: length no longer matches.
        packet.pop();
        assert!(decode_header(&packet).is_err());
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        let mut packet = encode_packet(PacketType::Ping, &Ping {
            nonce: 1,
            sent_at_ms: 2,
        })
        .unwrap();
        packet[0] = 0xFF;
        packet[1] = 0xFF;
        assert!(matches!(
            decode_header(&packet),
            Err(NetError::UnknownPacketType(_))
        ));
    }

    #[test]
    fn channels_follow_the_taxonomy() {
        // Reliable: lifecycle and authority traffic
        for packet_type in [
            PacketType::HandshakeRequest,
            PacketType::EntitySpawn,
            PacketType::EntityDespawn,
            PacketType::AuthorityChange,
            PacketType::RpcCall,
            PacketType::RpcResponse,
            PacketType::InputAck,
        ] {
            assert_eq!(packet_type.channel(), Channel::Reliable);
        }
        // Unreliable: periodic state
        for packet_type in [
            PacketType::TickSync,
            PacketType::WorldSnapshot,
            PacketType::InputCommand,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::EntityUpdate,
        ] {
            assert_eq!(packet_type.channel(), Channel::Unreliable);
        }
    }
}
