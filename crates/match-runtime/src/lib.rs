//! Match Runtime - authoritative round/battle kernel
//!
//! This crate holds the synchronous core of a two-team tactics match:
//! - Command-point economy and per-team HP ledgers
//! - Unit registry with debounced deaths and tie-break resolution
//! - Order synergies
//! - Exactly-once placement with optimistic local debits
//! - The round/battle phase machine and its timer queue
//! - Versioned snapshots and the peer-side mirror

pub mod config;
pub mod economy;
pub mod error;
pub mod events;
pub mod hp;
pub mod machine;
pub mod mirror;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod synergy;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{MatchConfig, UnitCatalog};
pub use economy::CommandLedger;
pub use error::{ConfigError, MatchError, MatchResult, SnapshotError, SpawnError};
pub use events::{EventBus, EventKind, MatchEvent, SubscriptionId};
pub use hp::HpLedger;
pub use machine::{CombatDriver, IdleCombat, MatchState};
pub use mirror::{ApplyOutcome, MirrorState};
pub use placement::PlacementCoordinator;
pub use protocol::{ClientCommand, Replicated, Sequenced};
pub use registry::{DeathMark, UnitRegistry};
pub use scheduler::{Scheduler, TimerTask};
pub use snapshot::{MatchSnapshot, SnapshotFrame, SNAPSHOT_VERSION};
pub use synergy::{OrderTracker, SynergyChange};
pub use types::*;
