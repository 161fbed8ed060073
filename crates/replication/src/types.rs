//! Core types for match replication

use borsh::{BorshDeserialize, BorshSerialize};
use match_runtime::{ClientCommand, Phase, PeerId, Sequenced, Team};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

/// Message types on the host/peer link
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum PeerMessage {
    /// First message from a peer: who it is and which team it plays
    Hello { peer_id: PeerId, team: Team },

    /// Host broadcasting a replicated state change
    Replicate(Sequenced),

    /// Peer forwarding a command to the host
    Command { team: Team, command: ClientCommand },

    /// Keep-alive from the host
    Heartbeat { tick: u64 },

    /// Peer asking for a fresh snapshot after falling behind
    SyncRequest { from_seq: u64 },
}

impl PeerMessage {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplicationError> {
        borsh::to_vec(self).map_err(ReplicationError::Encode)
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReplicationError> {
        borsh::from_slice(data).map_err(ReplicationError::Decode)
    }
}

/// A command received from a connected peer, tagged with the team that peer
/// announced in its `Hello`
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    pub team: Team,
    pub command: ClientCommand,
}

/// Node role in the match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns the authoritative match and broadcasts it
    Host,
    /// Mirrors the host and forwards its player's commands
    Peer,
}

/// Configuration for a replication node
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub role: NodeRole,
    pub peer_id: PeerId,
    /// Team this node's player controls
    pub team: Team,
    /// Host address (peers connect here)
    pub host_addr: String,
    /// Port for peer connections (host only)
    pub listen_port: u16,
    /// Tick period of the host loop
    pub tick_ms: u64,
    /// Ticks between heartbeats
    pub heartbeat_every: u64,
    /// Peer commands drained per tick
    pub max_commands_per_tick: usize,
    /// Capacity of the host's command intake
    pub intake_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Host,
            peer_id: 1,
            team: Team::A,
            host_addr: "127.0.0.1:9100".to_string(),
            listen_port: 9100,
            tick_ms: 33,
            heartbeat_every: 30,
            max_commands_per_tick: 64,
            intake_capacity: 1024,
        }
    }
}

/// Stats about the host loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub tick: u64,
    pub phase: Phase,
    pub round: u32,
    pub connected_peers: usize,
    pub messages_broadcast: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
}

/// Replication errors
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] borsh::io::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] borsh::io::Error),

    #[error("Not connected to host")]
    NotConnected,

    #[error("Connection channel closed")]
    ChannelClosed,
}

/// Monotonic millisecond clock shared by a node's loops
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
