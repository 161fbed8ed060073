//! Match errors
//!
//! None of these are fatal: a refused request leaves the match untouched and
//! the caller logs it.

use crate::types::{Cell, Millis, Phase, Team, UnitArchetype, UnitId};
use thiserror::Error;

/// Errors returned by match operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("Team {team} has {have} command points, needs {need}")]
    InsufficientPoints { team: Team, have: u32, need: u32 },

    #[error("A placement is already in flight for team {0}")]
    PlacementInFlight(Team),

    #[error("Placement request {timestamp} from team {team} was already handled")]
    DuplicateRequest { team: Team, timestamp: Millis },

    #[error("Not allowed during {0:?}")]
    WrongPhase(Phase),

    #[error("Only the host may issue this command")]
    NotAuthority,

    #[error("Transport is not running")]
    TransportDown,

    #[error("Spawn failed: {0}")]
    SpawnFailed(#[from] SpawnError),

    #[error("Unknown unit {0}")]
    UnknownUnit(UnitId),

    #[error("No catalog entry for {0:?}")]
    UnknownArchetype(UnitArchetype),

    #[error("Match is already over")]
    MatchOver,
}

/// Reasons a debited placement could not be turned into a unit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("Cell {cell} is outside team {team}'s zone")]
    OutsideZone { cell: Cell, team: Team },

    #[error("Cell {0} is occupied")]
    CellOccupied(Cell),

    #[error("Team {0} has no free unit slots")]
    RosterFull(Team),
}

/// Snapshot encode/decode errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot encoding failed: {0}")]
    Encode(#[source] std::io::Error),

    #[error("Snapshot decoding failed: {0}")]
    Decode(#[source] std::io::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u16, expected: u16 },

    #[error("Snapshot checksum mismatch")]
    Checksum,
}

/// Config loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type alias for match operations
pub type MatchResult<T> = Result<T, MatchError>;
