//! Versioned match snapshots
//!
//! The payload is the borsh encoding of `MatchSnapshot`, so field order is
//! the declaration order below. Any change to these structs must bump
//! `SNAPSHOT_VERSION`.

use crate::error::SnapshotError;
use crate::types::{MatchOutcome, Phase, RoundInfo, Unit};
use borsh::{BorshDeserialize, BorshSerialize};

pub const SNAPSHOT_VERSION: u16 = 1;

/// Per-team replicated values
#[derive(Debug, Clone, Copy, PartialEq, Default, BorshSerialize, BorshDeserialize)]
pub struct TeamSnapshot {
    pub balance: u32,
    pub cap: u32,
    pub hp: f32,
    pub win_streak: u32,
    pub ready: bool,
}

/// Complete host state as seen by peers
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MatchSnapshot {
    pub phase: Phase,
    pub round: RoundInfo,
    pub transition_seq: u64,
    /// Indexed by `Team::index()`
    pub teams: [TeamSnapshot; 2],
    pub units: Vec<Unit>,
    pub outcome: Option<MatchOutcome>,
}

/// Wire envelope: version, blake3 checksum of the payload, payload
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SnapshotFrame {
    pub version: u16,
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
}

impl SnapshotFrame {
    pub fn seal(snapshot: &MatchSnapshot) -> Result<Self, SnapshotError> {
        let payload = borsh::to_vec(snapshot).map_err(SnapshotError::Encode)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            checksum: checksum(&payload),
            payload,
        })
    }

    pub fn open(&self) -> Result<MatchSnapshot, SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if checksum(&self.payload) != self.checksum {
            return Err(SnapshotError::Checksum);
        }
        borsh::from_slice(&self.payload).map_err(SnapshotError::Decode)
    }
}

fn checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&SNAPSHOT_VERSION.to_le_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Team;

    fn snapshot() -> MatchSnapshot {
        MatchSnapshot {
            phase: Phase::PlacementB,
            round: RoundInfo {
                number: 3,
                active: false,
                winner: Some(Team::B),
            },
            transition_seq: 9,
            teams: [
                TeamSnapshot {
                    balance: 17,
                    cap: 24,
                    hp: 71.0,
                    win_streak: 0,
                    ready: true,
                },
                TeamSnapshot {
                    balance: 24,
                    cap: 24,
                    hp: 88.0,
                    win_streak: 2,
                    ready: false,
                },
            ],
            units: vec![],
            outcome: None,
        }
    }

    #[test]
    fn test_seal_and_open() {
        let frame = SnapshotFrame::seal(&snapshot()).unwrap();
        assert_eq!(frame.version, SNAPSHOT_VERSION);
        assert_eq!(frame.open().unwrap(), snapshot());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut frame = SnapshotFrame::seal(&snapshot()).unwrap();
        frame.version = SNAPSHOT_VERSION + 1;
        assert!(matches!(
            frame.open(),
            Err(SnapshotError::Version { found, .. }) if found == SNAPSHOT_VERSION + 1
        ));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut frame = SnapshotFrame::seal(&snapshot()).unwrap();
        frame.payload[0] ^= 0xff;
        assert!(matches!(frame.open(), Err(SnapshotError::Checksum)));
    }
}
