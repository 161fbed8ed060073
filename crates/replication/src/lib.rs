//! Match Replication - host authority with peer mirroring
//!
//! Architecture:
//! - One host owns the `MatchState` and ticks it at a fixed rate
//! - The host broadcasts sequenced state changes and snapshots to peers
//! - Peers mirror the stream in order and forward their player's commands
//! - Commands land in a bounded intake drained on the host's next tick

pub mod types;
pub mod transport;
pub mod broadcast;
pub mod host;
pub mod peer;

pub use types::*;
pub use transport::{MemoryTransport, Scope, Transport};
pub use host::HostNode;
pub use peer::PeerNode;
pub use broadcast::{BroadcastClient, BroadcastServer, ClientSender};
