//! Peer-side mirror of the host's match
//!
//! A non-host peer never decides anything. It applies the host's sequenced
//! stream strictly in order, buffering gaps, and keeps an optimistic view of
//! its own placements so the local player sees points leave immediately.

use crate::config::MatchConfig;
use crate::economy::CommandLedger;
use crate::error::{MatchError, MatchResult};
use crate::events::{EventBus, MatchEvent};
use crate::hp::HpLedger;
use crate::placement::PlacementCoordinator;
use crate::protocol::{ClientCommand, Replicated, Sequenced};
use crate::registry::UnitRegistry;
use crate::scheduler::{Scheduler, TimerTask};
use crate::snapshot::MatchSnapshot;
use crate::types::{
    Cell, MatchOutcome, Millis, Phase, PlacementRequest, RoundInfo, Team, UnitArchetype,
};
use std::collections::BTreeMap;

/// Out-of-order messages kept before asking for a resync
pub const DEFAULT_REORDER_LIMIT: usize = 64;

/// What happened to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied along with this many messages in total (buffered ones included)
    Applied(usize),
    /// Ahead of the stream; held until the gap fills
    Buffered,
    /// Already applied or superseded
    Stale,
    /// Reorder buffer full; the peer should request a resync
    Overflow,
}

pub struct MirrorState {
    local_team: Team,
    config: MatchConfig,
    phase: Phase,
    round: RoundInfo,
    transition_seq: u64,
    ready: [bool; 2],
    ledger: CommandLedger,
    hp: HpLedger,
    registry: UnitRegistry,
    placement: PlacementCoordinator,
    scheduler: Scheduler,
    events: EventBus,
    outcome: Option<MatchOutcome>,
    last_applied: u64,
    reorder: BTreeMap<u64, Replicated>,
    reorder_limit: usize,
}

impl MirrorState {
    pub fn new(config: MatchConfig, local_team: Team, events: EventBus) -> Self {
        Self {
            local_team,
            phase: Phase::Setup,
            round: RoundInfo::default(),
            transition_seq: 0,
            ready: [false; 2],
            ledger: CommandLedger::new(config.economy.clone(), events.clone()),
            hp: HpLedger::new(config.damage.clone()),
            registry: UnitRegistry::new(),
            placement: PlacementCoordinator::new(config.timing.lock_timeout_ms),
            scheduler: Scheduler::new(),
            outcome: None,
            last_applied: 0,
            reorder: BTreeMap::new(),
            reorder_limit: DEFAULT_REORDER_LIMIT,
            config,
            events,
        }
    }

    pub fn with_reorder_limit(mut self, limit: usize) -> Self {
        self.reorder_limit = limit.max(1);
        self
    }

    pub fn local_team(&self) -> Team {
        self.local_team
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> RoundInfo {
        self.round
    }

    pub fn transition_seq(&self) -> u64 {
        self.transition_seq
    }

    pub fn is_ready(&self, team: Team) -> bool {
        self.ready[team.index()]
    }

    pub fn ledger(&self) -> &CommandLedger {
        &self.ledger
    }

    pub fn hp(&self) -> &HpLedger {
        &self.hp
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn placement(&self) -> &PlacementCoordinator {
        &self.placement
    }

    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.outcome
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    // ========================================================================
    // Local commands
    // ========================================================================

    /// Validate and optimistically debit a placement; returns the command to
    /// send to the host
    pub fn submit_placement(
        &mut self,
        archetype: UnitArchetype,
        cell: Cell,
        timestamp: Millis,
        now: Millis,
    ) -> MatchResult<ClientCommand> {
        if self.outcome.is_some() {
            return Err(MatchError::MatchOver);
        }
        if !self.phase.accepts_placement(self.local_team) {
            return Err(MatchError::WrongPhase(self.phase));
        }
        let cost = self
            .config
            .catalog
            .cost(archetype)
            .ok_or(MatchError::UnknownArchetype(archetype))?;
        let request = PlacementRequest {
            team: self.local_team,
            archetype,
            cell,
            timestamp,
        };
        self.placement
            .submit(&request, cost, &mut self.ledger, &mut self.scheduler, now)?;
        Ok(ClientCommand::Place(request))
    }

    pub fn set_ready(&self) -> MatchResult<ClientCommand> {
        if !self.phase.accepts_placement(self.local_team) {
            return Err(MatchError::WrongPhase(self.phase));
        }
        Ok(ClientCommand::SetReady(self.local_team))
    }

    /// Expire placement locks whose confirmation never arrived
    pub fn tick(&mut self, now: Millis) {
        while let Some((_, task)) = self.scheduler.pop_due(now) {
            if let TimerTask::PlacementLockTimeout { team, timestamp } = task {
                self.placement.on_timeout(team, timestamp, &mut self.ledger);
            }
        }
    }

    // ========================================================================
    // Replicated stream
    // ========================================================================

    /// Apply one message from the host, in sequence order.
    ///
    /// Snapshots are resync points and are applied even across a gap.
    pub fn receive(&mut self, message: Sequenced) -> ApplyOutcome {
        if message.seq <= self.last_applied {
            tracing::debug!("Stale replicated message {} (at {})", message.seq, self.last_applied);
            return ApplyOutcome::Stale;
        }

        if message.seq != self.last_applied + 1 && !message.body.is_snapshot() {
            if self.reorder.contains_key(&message.seq) {
                return ApplyOutcome::Stale;
            }
            if self.reorder.len() >= self.reorder_limit {
                tracing::warn!(
                    "Reorder buffer full at {} (waiting for {}); resync needed",
                    message.seq,
                    self.last_applied + 1
                );
                return ApplyOutcome::Overflow;
            }
            self.reorder.insert(message.seq, message.body);
            return ApplyOutcome::Buffered;
        }

        self.apply(message.seq, message.body);
        let mut applied = 1;

        // Anything the snapshot jumped over is obsolete
        let last = self.last_applied;
        self.reorder.retain(|seq, _| *seq > last);
        while let Some(body) = self.reorder.remove(&(self.last_applied + 1)) {
            self.apply(self.last_applied + 1, body);
            applied += 1;
        }
        ApplyOutcome::Applied(applied)
    }

    fn apply(&mut self, seq: u64, body: Replicated) {
        self.last_applied = seq;
        match body {
            Replicated::Phase {
                phase,
                round,
                transition_seq,
            } => {
                if transition_seq > self.transition_seq {
                    self.transition_seq = transition_seq;
                    self.round.number = round;
                    self.set_phase(phase);
                }
            }
            Replicated::Snapshot(frame) => match frame.open() {
                Ok(snapshot) => self.adopt(snapshot),
                Err(e) => tracing::warn!("Dropping replicated snapshot {}: {}", seq, e),
            },
            Replicated::PlacementConfirmed {
                team,
                timestamp,
                unit,
            } => {
                if self.placement.on_confirmed(team, timestamp, &mut self.scheduler) {
                    tracing::debug!("Placement {} confirmed as {}", timestamp, unit);
                } else if team == self.local_team {
                    tracing::warn!("Stale confirmation for placement {}", timestamp);
                }
            }
            Replicated::PlacementRejected {
                team,
                timestamp,
                reason,
            } => {
                if self
                    .placement
                    .on_rejected(team, timestamp, &mut self.ledger, &mut self.scheduler)
                {
                    tracing::warn!("Placement {} rejected by host: {}", timestamp, reason);
                }
            }
            Replicated::RoundEnded {
                winner,
                survivors,
                damage,
            } => {
                self.round.winner = Some(winner);
                self.events.publish(MatchEvent::RoundEnded {
                    winner,
                    survivors,
                    damage,
                });
            }
            Replicated::MatchEnded { winner } => {
                if self.outcome.is_none() {
                    self.outcome = Some(MatchOutcome {
                        winner,
                        triggered: true,
                    });
                    self.events.publish(MatchEvent::MatchEnded { winner });
                }
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase == self.phase {
            return;
        }
        self.phase = phase;
        self.events.publish(MatchEvent::PhaseChanged {
            phase,
            round: self.round.number,
        });
    }

    /// Adopt host state; local points still in flight stay deducted
    fn adopt(&mut self, snapshot: MatchSnapshot) {
        self.round = snapshot.round;
        if snapshot.transition_seq >= self.transition_seq {
            self.transition_seq = snapshot.transition_seq;
            self.set_phase(snapshot.phase);
        }
        for team in Team::ALL {
            let view = &snapshot.teams[team.index()];
            let in_flight = self.placement.pending_debit(team);
            self.ledger
                .set_view(team, view.balance.saturating_sub(in_flight), view.cap);
            self.hp.set_view(team, view.hp, view.win_streak);
            self.ready[team.index()] = view.ready;
        }
        self.registry.replace_all(snapshot.units);
        for team in Team::ALL {
            self.events.publish(MatchEvent::UnitRegistryChanged {
                team,
                alive: self.registry.count_alive(team),
            });
        }
        if self.outcome.is_none() {
            if let Some(outcome) = snapshot.outcome {
                self.outcome = Some(outcome);
                self.events.publish(MatchEvent::MatchEnded {
                    winner: outcome.winner,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SnapshotFrame, TeamSnapshot};
    use crate::types::UnitId;

    fn mirror() -> MirrorState {
        MirrorState::new(MatchConfig::default(), Team::B, EventBus::new())
    }

    fn phase(seq: u64, phase: Phase, transition_seq: u64) -> Sequenced {
        Sequenced {
            seq,
            body: Replicated::Phase {
                phase,
                round: 1,
                transition_seq,
            },
        }
    }

    fn snapshot(phase: Phase, transition_seq: u64, balance_b: u32) -> MatchSnapshot {
        let team = |balance| TeamSnapshot {
            balance,
            cap: 20,
            hp: 100.0,
            win_streak: 0,
            ready: false,
        };
        MatchSnapshot {
            phase,
            round: RoundInfo::default(),
            transition_seq,
            teams: [team(20), team(balance_b)],
            units: vec![],
            outcome: None,
        }
    }

    #[test]
    fn test_in_order_messages_apply() {
        let mut mirror = mirror();
        assert_eq!(mirror.receive(phase(1, Phase::PlacementA, 1)), ApplyOutcome::Applied(1));
        assert_eq!(mirror.receive(phase(2, Phase::PlacementB, 2)), ApplyOutcome::Applied(1));
        assert_eq!(mirror.phase(), Phase::PlacementB);
    }

    #[test]
    fn test_gap_is_buffered_until_filled() {
        let mut mirror = mirror();
        assert_eq!(mirror.receive(phase(2, Phase::PlacementB, 2)), ApplyOutcome::Buffered);
        assert_eq!(mirror.phase(), Phase::Setup);

        assert_eq!(mirror.receive(phase(1, Phase::PlacementA, 1)), ApplyOutcome::Applied(2));
        assert_eq!(mirror.phase(), Phase::PlacementB);
        assert_eq!(mirror.buffered(), 0);
    }

    #[test]
    fn test_stale_and_duplicate_rejected() {
        let mut mirror = mirror();
        mirror.receive(phase(1, Phase::PlacementA, 1));
        assert_eq!(mirror.receive(phase(1, Phase::PlacementA, 1)), ApplyOutcome::Stale);

        mirror.receive(phase(3, Phase::BattleStart, 3));
        assert_eq!(mirror.receive(phase(3, Phase::BattleStart, 3)), ApplyOutcome::Stale);
    }

    #[test]
    fn test_buffer_overflow_requests_resync() {
        let mut mirror = mirror().with_reorder_limit(2);
        assert_eq!(mirror.receive(phase(3, Phase::PlacementA, 1)), ApplyOutcome::Buffered);
        assert_eq!(mirror.receive(phase(4, Phase::PlacementA, 1)), ApplyOutcome::Buffered);
        assert_eq!(mirror.receive(phase(5, Phase::PlacementA, 1)), ApplyOutcome::Overflow);
    }

    #[test]
    fn test_snapshot_applies_across_gap() {
        let mut mirror = mirror();
        mirror.receive(phase(4, Phase::PlacementA, 1));
        let frame = SnapshotFrame::seal(&snapshot(Phase::PlacementB, 2, 20)).unwrap();
        let outcome = mirror.receive(Sequenced {
            seq: 3,
            body: Replicated::Snapshot(frame),
        });

        // seq 4 was buffered behind the snapshot and carries an older transition
        assert_eq!(outcome, ApplyOutcome::Applied(2));
        assert_eq!(mirror.phase(), Phase::PlacementB);
        assert_eq!(mirror.last_applied(), 4);
    }

    #[test]
    fn test_optimistic_debit_survives_snapshot_until_confirmed() {
        let mut mirror = mirror();
        mirror.receive(phase(1, Phase::PlacementB, 2));

        let command = mirror
            .submit_placement(UnitArchetype::Mage, Cell::new(5, 1), 50, 50)
            .unwrap();
        assert!(matches!(command, ClientCommand::Place(_)));
        assert_eq!(mirror.ledger().balance(Team::B), 14);

        // Host has not seen the request yet
        let frame = SnapshotFrame::seal(&snapshot(Phase::PlacementB, 2, 20)).unwrap();
        mirror.receive(Sequenced {
            seq: 2,
            body: Replicated::Snapshot(frame),
        });
        assert_eq!(mirror.ledger().balance(Team::B), 14);

        mirror.receive(Sequenced {
            seq: 3,
            body: Replicated::PlacementConfirmed {
                team: Team::B,
                timestamp: 50,
                unit: UnitId(1),
            },
        });
        let frame = SnapshotFrame::seal(&snapshot(Phase::PlacementB, 2, 14)).unwrap();
        mirror.receive(Sequenced {
            seq: 4,
            body: Replicated::Snapshot(frame),
        });
        assert_eq!(mirror.ledger().balance(Team::B), 14);
        assert!(!mirror.placement().is_locked(Team::B));
    }

    #[test]
    fn test_rejection_and_timeout_refund() {
        let mut mirror = mirror();
        mirror.receive(phase(1, Phase::PlacementB, 2));

        mirror
            .submit_placement(UnitArchetype::Mage, Cell::new(5, 1), 50, 50)
            .unwrap();
        mirror.receive(Sequenced {
            seq: 2,
            body: Replicated::PlacementRejected {
                team: Team::B,
                timestamp: 50,
                reason: "occupied".into(),
            },
        });
        assert_eq!(mirror.ledger().balance(Team::B), 20);

        mirror
            .submit_placement(UnitArchetype::Mage, Cell::new(5, 1), 60, 60)
            .unwrap();
        mirror.tick(3059);
        assert!(mirror.placement().is_locked(Team::B));
        mirror.tick(3060);
        assert!(!mirror.placement().is_locked(Team::B));
        assert_eq!(mirror.ledger().balance(Team::B), 20);
    }

    #[test]
    fn test_cannot_place_out_of_turn() {
        let mut mirror = mirror();
        mirror.receive(phase(1, Phase::PlacementA, 1));
        assert_eq!(
            mirror.submit_placement(UnitArchetype::Mage, Cell::new(5, 1), 1, 1),
            Err(MatchError::WrongPhase(Phase::PlacementA))
        );
        assert!(mirror.set_ready().is_err());
    }
}
