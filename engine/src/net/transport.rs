//! The transport boundary.
//!
//! The replication layer talks to the network exclusively through
//! [`TransportPeer`]: an interface offering a reliable and an unreliable
//! channel to a set of connected peers. Real transports (ENet, UDP+ARQ,
//! WebRTC) live in the host; the in-memory [`MemoryHub`] here wires
//! sessions together for tests and local loopback.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::net::types::{Channel, HOST_PEER_ID, NetError, PeerId};

/// Connection-level events surfaced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message {
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
}

/// A bidirectional, channelized link to some set of peers.
///
/// The host's transport addresses every client; a client's transport
/// addresses only the host ([`HOST_PEER_ID`]).
pub trait TransportPeer: Send {
    /// Drain one pending event, if any.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Send a raw packet to a peer on the given channel.
    fn send(&mut self, peer: PeerId, channel: Channel, payload: &[u8]) -> Result<(), NetError>;

    /// Largest payload a single packet should carry.
    fn mtu(&self) -> usize {
        1200
    }

    /// Drop the link to a peer.
    fn disconnect_peer(&mut self, peer: PeerId);
}

#[derive(Default)]
struct HubState {
    /// Pending events per endpoint. Key 1 is the host.
    inboxes: HashMap<PeerId, VecDeque<TransportEvent>>,
    next_client_id: PeerId,
    connected: Vec<PeerId>,
}

/// An in-process switchboard connecting one host endpoint with any number
/// of client endpoints. Delivery is in-order and loss-free on both
/// channels; the channel split still exercises the protocol's routing.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let mut state = HubState::default();
        state.inboxes.insert(HOST_PEER_ID, VecDeque::new());
        state.next_client_id = HOST_PEER_ID + 1;
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// The host endpoint. Call once.
    pub fn host_endpoint(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.state.clone(),
            local: HOST_PEER_ID,
        }
    }

    /// Connect a new client endpoint; the host observes a
    /// [`TransportEvent::PeerConnected`].
    pub fn connect_client(&self) -> MemoryTransport {
        let mut state = self.state.lock().expect("hub poisoned");
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.inboxes.insert(id, VecDeque::new());
        state.connected.push(id);
        state
            .inboxes
            .get_mut(&HOST_PEER_ID)
            .expect("host inbox missing")
            .push_back(TransportEvent::PeerConnected(id));
        MemoryTransport {
            hub: self.state.clone(),
            local: id,
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<Mutex<HubState>>,
    local: PeerId,
}

impl MemoryTransport {
    pub fn local_id(&self) -> PeerId {
        self.local
    }
}

impl TransportPeer for MemoryTransport {
    fn poll(&mut self) -> Option<TransportEvent> {
        let mut state = self.hub.lock().expect("hub poisoned");
        state.inboxes.get_mut(&self.local)?.pop_front()
    }

    fn send(&mut self, peer: PeerId, channel: Channel, payload: &[u8]) -> Result<(), NetError> {
        let mut state = self.hub.lock().expect("hub poisoned");
        let local = self.local;
        let inbox = state.inboxes.get_mut(&peer).ok_or(NetError::TransportSend)?;
        inbox.push_back(TransportEvent::Message {
            peer: local,
            channel,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn disconnect_peer(&mut self, peer: PeerId) {
        let mut state = self.hub.lock().expect("hub poisoned");
        let local = self.local;
        if let Some(inbox) = state.inboxes.get_mut(&peer) {
            inbox.push_back(TransportEvent::PeerDisconnected(local));
        }
        // Inboxes stay allocated so already-queued packets (a Disconnect
        // notice, typically) still drain; only the routing entry goes away.
        let client = if local == HOST_PEER_ID { peer } else { local };
        state.connected.retain(|&p| p != client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_sees_client_connections() {
        // Given
        let hub = MemoryHub::new();
        let mut host = hub.host_endpoint();

        // When
        let client_a = hub.connect_client();
        let client_b = hub.connect_client();

        // Then: connection events in order, ids start past the host's
        assert_eq!(
            host.poll(),
            Some(TransportEvent::PeerConnected(client_a.local_id()))
        );
        assert_eq!(
            host.poll(),
            Some(TransportEvent::PeerConnected(client_b.local_id()))
        );
        assert!(client_a.local_id() >= 2);
        assert_ne!(client_a.local_id(), client_b.local_id());
    }

    #[test]
    fn messages_flow_both_ways_in_order() {
        // Given
        let hub = MemoryHub::new();
        let mut host = hub.host_endpoint();
        let mut client = hub.connect_client();
        let client_id = client.local_id();
        let _ = host.poll(); // consume the connect event

        // When
        client.send(HOST_PEER_ID, Channel::Reliable, b"hello").unwrap();
        client.send(HOST_PEER_ID, Channel::Unreliable, b"state").unwrap();
        host.send(client_id, Channel::Reliable, b"welcome").unwrap();

        // Then
        assert_eq!(
            host.poll(),
            Some(TransportEvent::Message {
                peer: client_id,
                channel: Channel::Reliable,
                payload: b"hello".to_vec()
            })
        );
        assert_eq!(
            host.poll(),
            Some(TransportEvent::Message {
                peer: client_id,
                channel: Channel::Unreliable,
                payload: b"state".to_vec()
            })
        );
        assert_eq!(
            client.poll(),
            Some(TransportEvent::Message {
                peer: HOST_PEER_ID,
                channel: Channel::Reliable,
                payload: b"welcome".to_vec()
            })
        );
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let mut host = hub.host_endpoint();
        assert!(host.send(99, Channel::Reliable, b"x").is_err());
    }

    #[test]
    fn disconnect_notifies_the_other_side() {
        // Given
        let hub = MemoryHub::new();
        let mut host = hub.host_endpoint();
        let mut client = hub.connect_client();
        let client_id = client.local_id();
        let _ = host.poll();

        // When: the client hangs up
        client.disconnect_peer(HOST_PEER_ID);

        // Then
        assert_eq!(
            host.poll(),
            Some(TransportEvent::PeerDisconnected(client_id))
        );
    }
}
