//! Replication across peers: wire protocol, transport boundary,
//! per-entity replication state, and the session driving a fixed tick.

pub mod components;
pub mod replication;
pub mod session;
pub mod transport;
pub mod types;

pub use components::{AuthorityMode, ReplicationMode};
pub use replication::ReplicationState;
pub use session::{ConnectionState, NetworkConfig, NetworkRole, NetworkSession};
pub use transport::{MemoryHub, TransportPeer};
pub use types::{Channel, DisconnectReason, NetError, PROTOCOL_VERSION, PeerId};
