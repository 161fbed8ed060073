//! Replicated messages and client commands
//!
//! Everything the host tells its peers goes through `Replicated`, wrapped in
//! a `Sequenced` envelope so peers can apply the stream strictly in order.

use crate::snapshot::SnapshotFrame;
use crate::types::{Millis, Phase, PlacementRequest, Team, UnitId};
use borsh::{BorshDeserialize, BorshSerialize};

/// Host → peer state change
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum Replicated {
    /// Phase transition, carrying the transition sequence number
    Phase {
        phase: Phase,
        round: u32,
        transition_seq: u64,
    },
    /// Full state resync point
    Snapshot(SnapshotFrame),
    PlacementConfirmed {
        team: Team,
        timestamp: Millis,
        unit: UnitId,
    },
    PlacementRejected {
        team: Team,
        timestamp: Millis,
        reason: String,
    },
    RoundEnded {
        winner: Team,
        survivors: u32,
        damage: f32,
    },
    MatchEnded {
        winner: Team,
    },
}

impl Replicated {
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Replicated::Snapshot(_))
    }
}

/// A replicated message with its stream position
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Sequenced {
    pub seq: u64,
    pub body: Replicated,
}

/// Peer → host command
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ClientCommand {
    Place(PlacementRequest),
    SetReady(Team),
    /// Host-only override; refused when relayed from a peer
    StartBattle,
    /// Ask the host for a fresh snapshot
    RequestSync,
}
