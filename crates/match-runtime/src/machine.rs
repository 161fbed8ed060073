//! Round / battle state machine
//!
//! `MatchState` is the host's authoritative match. It owns every ledger and
//! is driven two ways: commands (placements, ready, start) and `tick(now)`,
//! which runs due timers and polls for the end of a battle. Everything the
//! peers must see is appended to an outbox of sequenced messages.
//!
//! Phase flow:
//! `Setup -> PlacementA -> PlacementB -> BattleStart -> BattleActive ->
//! BattleEnd -> PlacementA | GameOver`

use crate::config::{CatalogEntry, MatchConfig};
use crate::economy::CommandLedger;
use crate::error::{MatchError, MatchResult, SpawnError};
use crate::events::{EventBus, MatchEvent};
use crate::hp::HpLedger;
use crate::placement::{Admission, PlacementCoordinator};
use crate::protocol::{ClientCommand, Replicated, Sequenced};
use crate::registry::{DeathMark, UnitRegistry};
use crate::scheduler::{Scheduler, TimerTask};
use crate::snapshot::{MatchSnapshot, SnapshotFrame, TeamSnapshot};
use crate::synergy::OrderTracker;
use crate::types::{
    Cell, MatchOutcome, Millis, PeerId, Phase, PlacementRequest, RoundInfo, Team, Unit,
    UnitArchetype, UnitId, UnitState,
};

/// Combat/movement subsystem hook
pub trait CombatDriver: Send {
    fn start_targeting(&mut self, unit: &Unit);
    fn stop_targeting(&mut self, unit: &Unit);
}

/// Driver that does nothing (headless hosts, tests)
#[derive(Debug, Default)]
pub struct IdleCombat;

impl CombatDriver for IdleCombat {
    fn start_targeting(&mut self, _unit: &Unit) {}
    fn stop_targeting(&mut self, _unit: &Unit) {}
}

/// The authoritative match
pub struct MatchState {
    config: MatchConfig,
    local_peer: PeerId,
    /// Team driven from the host's own console
    host_team: Team,
    phase: Phase,
    round: RoundInfo,
    transition_seq: u64,
    ready: [bool; 2],
    ledger: CommandLedger,
    hp: HpLedger,
    registry: UnitRegistry,
    synergy: OrderTracker,
    placement: PlacementCoordinator,
    scheduler: Scheduler,
    events: EventBus,
    combat: Box<dyn CombatDriver>,
    outcome: Option<MatchOutcome>,
    transport_running: bool,
    outbox: Vec<Sequenced>,
    replication_seq: u64,
    /// A snapshot must follow the pending outbox
    dirty: bool,
}

impl MatchState {
    pub fn new(config: MatchConfig, local_peer: PeerId, host_team: Team, events: EventBus) -> Self {
        Self {
            ledger: CommandLedger::new(config.economy.clone(), events.clone()),
            hp: HpLedger::new(config.damage.clone()),
            registry: UnitRegistry::new(),
            synergy: OrderTracker::new(config.synergy_threshold, events.clone()),
            placement: PlacementCoordinator::new(config.timing.lock_timeout_ms),
            scheduler: Scheduler::new(),
            combat: Box::new(IdleCombat),
            phase: Phase::Setup,
            round: RoundInfo::default(),
            transition_seq: 0,
            ready: [false; 2],
            outcome: None,
            transport_running: true,
            outbox: Vec::new(),
            replication_seq: 0,
            dirty: false,
            config,
            local_peer,
            host_team,
            events,
        }
    }

    pub fn with_combat(mut self, combat: Box<dyn CombatDriver>) -> Self {
        self.combat = combat;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn host_team(&self) -> Team {
        self.host_team
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

    pub fn synergy(&self) -> &OrderTracker {
        &self.synergy
    }

    pub fn placement(&self) -> &PlacementCoordinator {
        &self.placement
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.outcome
    }

    pub fn is_transport_running(&self) -> bool {
        self.transport_running
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Update transport liveness. Coming back up catches up on timers that
    /// fell due meanwhile; no transition runs while it is down.
    pub fn set_transport_running(&mut self, running: bool, now: Millis) {
        if running == self.transport_running {
            return;
        }
        self.transport_running = running;
        if !running {
            tracing::warn!("Transport down in {:?}; holding host mutations", self.phase);
            return;
        }
        tracing::info!("Transport back up in {:?}", self.phase);
        self.tick(now);
    }

    fn ensure_live(&self) -> MatchResult<()> {
        if self.outcome.is_some() {
            return Err(MatchError::MatchOver);
        }
        if !self.transport_running {
            return Err(MatchError::TransportDown);
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Setup -> PlacementA
    pub fn start_match(&mut self, now: Millis) -> MatchResult<()> {
        self.ensure_live()?;
        if self.phase != Phase::Setup {
            return Err(MatchError::WrongPhase(self.phase));
        }
        tracing::info!("Match starting (host team {})", self.host_team);
        self.enter_phase(Phase::PlacementA, now);
        Ok(())
    }

    /// True if `team` can afford `archetype`
    pub fn can_place(&self, team: Team, archetype: UnitArchetype) -> bool {
        self.config
            .catalog
            .cost(archetype)
            .map(|cost| self.ledger.balance(team) >= cost)
            .unwrap_or(false)
    }

    /// Place a unit for the host's own team
    pub fn place_unit(
        &mut self,
        archetype: UnitArchetype,
        cell: Cell,
        timestamp: Millis,
        now: Millis,
    ) -> MatchResult<UnitId> {
        self.ensure_live()?;
        let team = self.host_team;
        if !self.phase.accepts_placement(team) {
            return Err(MatchError::WrongPhase(self.phase));
        }
        let cost = self
            .config
            .catalog
            .cost(archetype)
            .ok_or(MatchError::UnknownArchetype(archetype))?;
        let request = PlacementRequest {
            team,
            archetype,
            cell,
            timestamp,
        };
        self.placement.submit(
            &request,
            cost,
            &mut self.ledger,
            &mut self.scheduler,
            now,
        )?;
        self.apply_on_host(request, now)
    }

    /// Apply a placement on the authority, exactly once per (team, timestamp)
    pub fn apply_on_host(&mut self, request: PlacementRequest, _now: Millis) -> MatchResult<UnitId> {
        self.ensure_live()?;
        if !self.phase.accepts_placement(request.team) {
            let err = MatchError::WrongPhase(self.phase);
            self.reject(&request, &err);
            return Err(err);
        }
        let Some(entry) = self.config.catalog.entry(request.archetype).cloned() else {
            let err = MatchError::UnknownArchetype(request.archetype);
            self.reject(&request, &err);
            return Err(err);
        };

        match self.placement.admit_on_host(&request, entry.cost, &mut self.ledger) {
            Admission::Duplicate => {
                tracing::debug!(
                    "Duplicate placement {} from team {} ignored",
                    request.timestamp,
                    request.team
                );
                return Err(MatchError::DuplicateRequest {
                    team: request.team,
                    timestamp: request.timestamp,
                });
            }
            Admission::Rejected(err) => {
                self.reject(&request, &err);
                return Err(err);
            }
            Admission::Admitted => {}
        }

        let spawned = self.spawn_unit(&request, &entry);
        let result = self.placement.complete_on_host(
            &request,
            entry.cost,
            &mut self.ledger,
            &mut self.scheduler,
            spawned,
        );
        match &result {
            Ok(unit) => self.push(Replicated::PlacementConfirmed {
                team: request.team,
                timestamp: request.timestamp,
                unit: *unit,
            }),
            Err(err) => self.reject(&request, err),
        }
        self.dirty = true;
        result
    }

    fn reject(&mut self, request: &PlacementRequest, err: &MatchError) {
        tracing::warn!(
            "Placement {} from team {} rejected: {}",
            request.timestamp,
            request.team,
            err
        );
        self.push(Replicated::PlacementRejected {
            team: request.team,
            timestamp: request.timestamp,
            reason: err.to_string(),
        });
    }

    fn spawn_unit(
        &mut self,
        request: &PlacementRequest,
        entry: &CatalogEntry,
    ) -> Result<UnitId, SpawnError> {
        let team = request.team;
        let cell = request.cell;
        if !self.in_zone(team, cell) {
            return Err(SpawnError::OutsideZone { cell, team });
        }
        if self.registry.occupied(cell) {
            return Err(SpawnError::CellOccupied(cell));
        }
        if self.registry.count_registered(team) >= self.config.grid.max_units_per_team {
            return Err(SpawnError::RosterFull(team));
        }

        let id = self.registry.next_unit_id();
        let unit = Unit::new(
            id,
            team,
            self.local_peer,
            request.archetype,
            entry.order,
            cell,
            entry.stats,
        );
        self.registry.register(unit);
        self.synergy
            .on_unit_registered(id, &mut self.registry, self.local_peer);
        self.events.publish(MatchEvent::UnitRegistryChanged {
            team,
            alive: self.registry.count_alive(team),
        });
        tracing::debug!("Spawned {} {:?} for team {} at {}", id, request.archetype, team, cell);
        Ok(id)
    }

    /// Team A deploys on the left half of the grid, team B on the right
    fn in_zone(&self, team: Team, cell: Cell) -> bool {
        let grid = &self.config.grid;
        if cell.x >= grid.width || cell.y >= grid.height {
            return false;
        }
        let half = grid.width / 2;
        match team {
            Team::A => cell.x < half,
            Team::B => cell.x >= half,
        }
    }

    /// Handle a command relayed from the peer controlling `origin`.
    /// The host's own team is driven locally and never by a peer.
    pub fn handle_command(&mut self, origin: Team, command: ClientCommand, now: Millis) -> MatchResult<()> {
        if origin == self.host_team {
            return Err(MatchError::NotAuthority);
        }
        match command {
            ClientCommand::Place(request) => {
                if request.team != origin {
                    return Err(MatchError::NotAuthority);
                }
                self.apply_on_host(request, now).map(|_| ())
            }
            ClientCommand::SetReady(team) => {
                if team != origin {
                    return Err(MatchError::NotAuthority);
                }
                self.set_ready(team, now)
            }
            ClientCommand::StartBattle => Err(MatchError::NotAuthority),
            ClientCommand::RequestSync => {
                tracing::debug!("Team {} requested a resync", origin);
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Mark `team` ready, advancing the placement phase it owns
    pub fn set_ready(&mut self, team: Team, now: Millis) -> MatchResult<()> {
        self.ensure_live()?;
        let next = match (self.phase, team) {
            (Phase::PlacementA, Team::A) => Phase::PlacementB,
            (Phase::PlacementB, Team::B) => Phase::BattleStart,
            _ => return Err(MatchError::WrongPhase(self.phase)),
        };
        self.ready[team.index()] = true;
        tracing::info!("Team {} ready", team);
        self.enter_phase(next, now);
        Ok(())
    }

    /// Host override: skip the remaining placement and start the battle
    pub fn start_battle(&mut self, now: Millis) -> MatchResult<()> {
        self.ensure_live()?;
        if !matches!(self.phase, Phase::PlacementA | Phase::PlacementB) {
            return Err(MatchError::WrongPhase(self.phase));
        }
        self.ready = [true; 2];
        tracing::info!("Battle forced by host in {:?}", self.phase);
        self.enter_phase(Phase::BattleStart, now);
        Ok(())
    }

    // ========================================================================
    // Combat reports
    // ========================================================================

    /// A unit was killed. Only counted while the battle is active; removal
    /// happens after the grace period.
    pub fn on_unit_death(&mut self, id: UnitId, now: Millis) -> DeathMark {
        if self.phase != Phase::BattleActive {
            tracing::debug!("Death of {} ignored in {:?}", id, self.phase);
            return DeathMark::Ignored;
        }
        if let Some(unit) = self.registry.get_mut(id) {
            if unit.targeting {
                unit.targeting = false;
                self.combat.stop_targeting(unit);
            }
        }
        let mark = self.registry.mark_pending_death(id, now);
        if mark == DeathMark::Scheduled {
            self.scheduler.schedule_after(
                now,
                self.config.timing.death_grace_ms,
                TimerTask::RemoveUnit(id),
            );
            if let Some(team) = self.registry.get(id).map(|u| u.team) {
                self.events.publish(MatchEvent::UnitRegistryChanged {
                    team,
                    alive: self.registry.count_alive(team),
                });
            }
            self.dirty = true;
            tracing::debug!("{} died at {}ms; removal pending", id, now);
        }
        mark
    }

    /// Apply combat damage; returns true if the hit killed the unit
    pub fn apply_unit_damage(&mut self, id: UnitId, amount: f32, now: Millis) -> MatchResult<bool> {
        if self.phase != Phase::BattleActive {
            return Err(MatchError::WrongPhase(self.phase));
        }
        let unit = self.registry.get_mut(id).ok_or(MatchError::UnknownUnit(id))?;
        if !unit.is_alive() {
            return Ok(false);
        }
        unit.current_hp = (unit.current_hp - amount).max(0.0);
        if unit.current_hp > 0.0 {
            return Ok(false);
        }
        Ok(self.on_unit_death(id, now) == DeathMark::Scheduled)
    }

    /// Lifecycle report from the combat subsystem
    pub fn report_unit_state(&mut self, id: UnitId, state: UnitState, now: Millis) -> MatchResult<()> {
        if state == UnitState::Dead {
            return match self.on_unit_death(id, now) {
                DeathMark::Unknown => Err(MatchError::UnknownUnit(id)),
                _ => Ok(()),
            };
        }
        let unit = self.registry.get_mut(id).ok_or(MatchError::UnknownUnit(id))?;
        if unit.is_alive() {
            unit.state = state;
        }
        Ok(())
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run due timers and poll for battle end. Nothing happens while the
    /// transport is down; due timers wait for it to come back.
    pub fn tick(&mut self, now: Millis) {
        if !self.transport_running {
            return;
        }
        while let Some((_, task)) = self.scheduler.pop_due(now) {
            self.run_task(task, now);
        }
        self.poll_battle_end(now);
    }

    fn run_task(&mut self, task: TimerTask, now: Millis) {
        match task {
            TimerTask::RemoveUnit(id) => {
                if let Some(unit) = self.registry.finish_removal(id) {
                    self.synergy.on_unit_removed(&unit);
                    self.events.publish(MatchEvent::UnitRegistryChanged {
                        team: unit.team,
                        alive: self.registry.count_alive(unit.team),
                    });
                    self.dirty = true;
                }
                if !self.registry.any_pending() {
                    self.poll_battle_end(now);
                }
            }
            TimerTask::ActivateUnit(id) => {
                if !self.phase.is_battle() {
                    return;
                }
                if let Some(unit) = self.registry.get_mut(id) {
                    if unit.is_alive() && !unit.targeting {
                        unit.targeting = true;
                        self.combat.start_targeting(unit);
                    }
                }
            }
            TimerTask::BeginBattleActive => {
                if self.phase == Phase::BattleStart {
                    self.round.active = true;
                    self.enter_phase(Phase::BattleActive, now);
                }
            }
            TimerTask::PlacementLockTimeout { team, timestamp } => {
                self.placement.on_timeout(team, timestamp, &mut self.ledger);
            }
            TimerTask::NextRound => {
                if self.phase == Phase::BattleEnd {
                    self.begin_next_round(now);
                }
            }
        }
    }

    fn poll_battle_end(&mut self, now: Millis) {
        if self.phase != Phase::BattleActive || self.registry.any_pending() {
            return;
        }
        if let Some(winner) = self.registry.decide_winner(self.config.tie_break_team) {
            self.resolve_round(winner, now);
        }
    }

    fn resolve_round(&mut self, winner: Team, now: Millis) {
        let survivors = self.registry.count_alive(winner) as u32;
        let damage = self.hp.apply_round(winner, survivors);
        self.round.winner = Some(winner);
        self.round.active = false;
        self.round.number += 1;
        self.stop_all_targeting();

        self.events.publish(MatchEvent::RoundEnded {
            winner,
            survivors,
            damage,
        });
        self.push(Replicated::RoundEnded {
            winner,
            survivors,
            damage,
        });
        self.enter_phase(Phase::BattleEnd, now);
        self.after_battle_end(now);
    }

    fn after_battle_end(&mut self, now: Millis) {
        if self.check_match_end(now) {
            return;
        }
        self.scheduler.schedule_after(
            now,
            self.config.timing.round_end_delay_ms,
            TimerTask::NextRound,
        );
    }

    /// End the match if a team is out of HP. Runs its side effects once.
    fn check_match_end(&mut self, now: Millis) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let Some(loser) = self.hp.defeated() else {
            return false;
        };
        let winner = loser.opponent();
        self.outcome = Some(MatchOutcome {
            winner,
            triggered: true,
        });

        self.scheduler.cancel_all();
        self.placement.clear_pending();
        tracing::info!(
            "Match over: team {} wins ({:.1} HP vs {:.1} HP)",
            winner,
            self.hp.hp(winner),
            self.hp.hp(loser)
        );
        self.events.publish(MatchEvent::MatchEnded { winner });
        self.push(Replicated::MatchEnded { winner });
        self.enter_phase(Phase::GameOver, now);
        true
    }

    fn begin_next_round(&mut self, now: Millis) {
        self.stop_all_targeting();
        self.scheduler.cancel_where(|task| task.is_unit_task());
        let removed = self.registry.clear();
        self.synergy.reset();
        self.ledger.advance_round();
        self.ready = [false; 2];
        for team in Team::ALL {
            self.events.publish(MatchEvent::UnitRegistryChanged { team, alive: 0 });
        }
        tracing::info!(
            "Round {} begins ({} units cleared)",
            self.round.number,
            removed.len()
        );
        self.enter_phase(Phase::PlacementA, now);
    }

    fn stop_all_targeting(&mut self) {
        let ids: Vec<UnitId> = Team::ALL
            .into_iter()
            .flat_map(|team| self.registry.live_ids(team))
            .collect();
        for id in ids {
            if let Some(unit) = self.registry.get_mut(id) {
                if unit.targeting {
                    unit.targeting = false;
                    self.combat.stop_targeting(unit);
                }
            }
        }
    }

    fn enter_phase(&mut self, phase: Phase, now: Millis) {
        let previous = self.phase;
        self.phase = phase;
        self.transition_seq += 1;
        tracing::info!(
            "Phase {:?} -> {:?} (round {}, seq {})",
            previous,
            phase,
            self.round.number,
            self.transition_seq
        );
        self.events.publish(MatchEvent::PhaseChanged {
            phase,
            round: self.round.number,
        });
        self.push(Replicated::Phase {
            phase,
            round: self.round.number,
            transition_seq: self.transition_seq,
        });
        self.dirty = true;

        if phase == Phase::BattleStart {
            self.queue_activations(now);
        }
    }

    /// BattleActive at +0, then one activation per live unit every `stagger_ms`
    fn queue_activations(&mut self, now: Millis) {
        self.scheduler.schedule_after(now, 0, TimerTask::BeginBattleActive);
        let stagger = self.config.timing.stagger_ms;
        let ids: Vec<UnitId> = Team::ALL
            .into_iter()
            .flat_map(|team| self.registry.live_ids(team))
            .collect();
        for (i, id) in ids.into_iter().enumerate() {
            self.scheduler
                .schedule_after(now, stagger * i as u64, TimerTask::ActivateUnit(id));
        }
    }

    // ========================================================================
    // Teardown & replication
    // ========================================================================

    /// Tear the match down: timers cancelled, combat stopped, subscribers dropped
    pub fn abort(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        self.stop_all_targeting();
        self.placement.clear_pending();
        self.events.clear();
        tracing::info!("Match aborted in {:?} ({} timers cancelled)", self.phase, cancelled);
    }

    fn push(&mut self, body: Replicated) {
        self.replication_seq += 1;
        self.outbox.push(Sequenced {
            seq: self.replication_seq,
            body,
        });
    }

    /// Take everything queued for peers, closing with a snapshot if state changed
    pub fn drain_outbox(&mut self) -> Vec<Sequenced> {
        if self.dirty {
            self.dirty = false;
            match SnapshotFrame::seal(&self.snapshot()) {
                Ok(frame) => self.push(Replicated::Snapshot(frame)),
                Err(e) => tracing::error!("Failed to seal snapshot: {}", e),
            }
        }
        std::mem::take(&mut self.outbox)
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        let team = |t: Team| TeamSnapshot {
            balance: self.ledger.balance(t),
            cap: self.ledger.cap(t),
            hp: self.hp.hp(t),
            win_streak: self.hp.win_streak(t),
            ready: self.ready[t.index()],
        };
        let mut units: Vec<Unit> = self.registry.units().cloned().collect();
        units.sort_by_key(|u| u.id);
        MatchSnapshot {
            phase: self.phase,
            round: self.round,
            transition_seq: self.transition_seq,
            teams: [team(Team::A), team(Team::B)],
            units,
            outcome: self.outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::{Arc, Mutex};

    const HOST: PeerId = 7;

    #[derive(Clone, Default)]
    struct RecordingCombat {
        started: Arc<Mutex<Vec<UnitId>>>,
        stopped: Arc<Mutex<Vec<UnitId>>>,
    }

    impl CombatDriver for RecordingCombat {
        fn start_targeting(&mut self, unit: &Unit) {
            self.started.lock().unwrap().push(unit.id);
        }
        fn stop_targeting(&mut self, unit: &Unit) {
            self.stopped.lock().unwrap().push(unit.id);
        }
    }

    fn state() -> MatchState {
        MatchState::new(MatchConfig::default(), HOST, Team::A, EventBus::new())
    }

    fn place_b(state: &mut MatchState, archetype: UnitArchetype, x: u16, y: u16, ts: Millis) -> MatchResult<()> {
        state.handle_command(
            Team::B,
            ClientCommand::Place(PlacementRequest {
                team: Team::B,
                archetype,
                cell: Cell::new(x, y),
                timestamp: ts,
            }),
            ts,
        )
    }

    #[test]
    fn test_phase_progression_and_sequence_numbers() {
        let mut state = state();
        state.start_match(0).unwrap();
        assert_eq!(state.phase(), Phase::PlacementA);
        assert_eq!(state.transition_seq(), 1);

        assert_eq!(state.set_ready(Team::B, 1), Err(MatchError::WrongPhase(Phase::PlacementA)));
        state.place_unit(UnitArchetype::Knight, Cell::new(0, 0), 1, 1).unwrap();
        state.set_ready(Team::A, 1).unwrap();
        assert_eq!(state.phase(), Phase::PlacementB);
        place_b(&mut state, UnitArchetype::Archer, 6, 0, 2).unwrap();
        state.set_ready(Team::B, 2).unwrap();
        assert_eq!(state.phase(), Phase::BattleStart);

        state.tick(2);
        assert_eq!(state.phase(), Phase::BattleActive);
        assert_eq!(state.transition_seq(), 4);
    }

    #[test]
    fn test_empty_board_resolves_to_tie_break_team() {
        let mut config = MatchConfig::default();
        config.tie_break_team = Team::B;
        let mut state = MatchState::new(config, HOST, Team::A, EventBus::new());
        state.start_match(0).unwrap();
        state.start_battle(1).unwrap();

        // BattleActive and BattleEnd in the same tick: nobody is left standing
        state.tick(1);
        assert_eq!(state.phase(), Phase::BattleEnd);
        assert_eq!(state.transition_seq(), 4);
        assert_eq!(state.round().winner, Some(Team::B));
        assert!((state.hp().hp(Team::A) - 88.0).abs() < 1e-4);
    }

    #[test]
    fn test_start_match_twice_is_wrong_phase() {
        let mut state = state();
        state.start_match(0).unwrap();
        assert_eq!(state.start_match(1), Err(MatchError::WrongPhase(Phase::PlacementA)));
    }

    #[test]
    fn test_host_placement_debits_once_and_spawns() {
        let mut state = state();
        state.start_match(0).unwrap();

        let id = state
            .place_unit(UnitArchetype::Knight, Cell::new(1, 1), 100, 100)
            .unwrap();
        assert_eq!(state.ledger().balance(Team::A), 15);
        assert_eq!(state.registry().get(id).unwrap().owner, HOST);
        assert!(!state.placement().is_locked(Team::A));

        let out = state.drain_outbox();
        assert!(out.iter().any(|m| matches!(
            m.body,
            Replicated::PlacementConfirmed { team: Team::A, timestamp: 100, .. }
        )));
        assert!(out.last().unwrap().body.is_snapshot());
    }

    #[test]
    fn test_placement_outside_zone_refunds() {
        let mut state = state();
        state.start_match(0).unwrap();

        let err = state
            .place_unit(UnitArchetype::Knight, Cell::new(6, 1), 100, 100)
            .unwrap_err();
        assert!(matches!(err, MatchError::SpawnFailed(SpawnError::OutsideZone { .. })));
        assert_eq!(state.ledger().balance(Team::A), 20);
        assert_eq!(state.registry().count_registered(Team::A), 0);
    }

    #[test]
    fn test_relayed_placement_is_applied_exactly_once() {
        let mut state = state();
        state.start_match(0).unwrap();
        state.set_ready(Team::A, 1).unwrap();

        place_b(&mut state, UnitArchetype::Mage, 5, 2, 10).unwrap();
        let again = place_b(&mut state, UnitArchetype::Mage, 5, 2, 10);
        assert_eq!(
            again,
            Err(MatchError::DuplicateRequest {
                team: Team::B,
                timestamp: 10
            })
        );
        assert_eq!(state.ledger().balance(Team::B), 14);
        assert_eq!(state.registry().count_registered(Team::B), 1);
    }

    #[test]
    fn test_relayed_placement_out_of_turn_rejected() {
        let mut state = state();
        state.start_match(0).unwrap();

        let err = place_b(&mut state, UnitArchetype::Mage, 5, 2, 10).unwrap_err();
        assert_eq!(err, MatchError::WrongPhase(Phase::PlacementA));
        assert!(state.drain_outbox().iter().any(|m| matches!(
            m.body,
            Replicated::PlacementRejected { team: Team::B, timestamp: 10, .. }
        )));
    }

    #[test]
    fn test_peer_cannot_act_as_host_team() {
        let mut state = state();
        state.start_match(0).unwrap();
        assert_eq!(
            state.handle_command(Team::A, ClientCommand::SetReady(Team::A), 0),
            Err(MatchError::NotAuthority)
        );
        let request = PlacementRequest {
            team: Team::A,
            archetype: UnitArchetype::Knight,
            cell: Cell::new(0, 0),
            timestamp: 3,
        };
        assert_eq!(
            state.handle_command(Team::A, ClientCommand::Place(request), 3),
            Err(MatchError::NotAuthority)
        );
        assert_eq!(state.phase(), Phase::PlacementA);
        assert_eq!(state.ledger().balance(Team::A), 20);
        assert_eq!(state.registry().count_registered(Team::A), 0);
    }

    #[test]
    fn test_peer_cannot_act_for_other_team_or_force_battle() {
        let mut state = state();
        state.start_match(0).unwrap();
        assert_eq!(
            state.handle_command(Team::B, ClientCommand::SetReady(Team::A), 0),
            Err(MatchError::NotAuthority)
        );
        assert_eq!(
            state.handle_command(Team::B, ClientCommand::StartBattle, 0),
            Err(MatchError::NotAuthority)
        );
    }

    #[test]
    fn test_battle_start_staggers_activation() {
        let combat = RecordingCombat::default();
        let mut state = state().with_combat(Box::new(combat.clone()));
        state.start_match(0).unwrap();
        state.place_unit(UnitArchetype::Knight, Cell::new(0, 0), 1, 1).unwrap();
        state.set_ready(Team::A, 3).unwrap();
        place_b(&mut state, UnitArchetype::Archer, 6, 0, 4).unwrap();
        state.start_battle(1000).unwrap();
        assert_eq!(state.phase(), Phase::BattleStart);
        assert!(state.is_ready(Team::B));

        state.tick(1000);
        assert_eq!(state.phase(), Phase::BattleActive);
        assert_eq!(combat.started.lock().unwrap().len(), 1);

        state.tick(1049);
        assert_eq!(combat.started.lock().unwrap().len(), 1);
        state.tick(1050);
        assert_eq!(combat.started.lock().unwrap().len(), 2);
        assert_eq!(state.phase(), Phase::BattleActive);
    }

    #[test]
    fn test_death_outside_battle_is_ignored() {
        let mut state = state();
        state.start_match(0).unwrap();
        let id = state.place_unit(UnitArchetype::Knight, Cell::new(0, 0), 1, 1).unwrap();
        assert_eq!(state.on_unit_death(id, 5), DeathMark::Ignored);
        assert_eq!(state.registry().count_alive(Team::A), 1);
    }

    #[test]
    fn test_round_resolves_after_grace_period() {
        let mut state = state();
        state.start_match(0).unwrap();
        let a = state.place_unit(UnitArchetype::Knight, Cell::new(0, 0), 1, 1).unwrap();
        state.set_ready(Team::A, 2).unwrap();
        place_b(&mut state, UnitArchetype::Archer, 5, 0, 3).unwrap();
        state.set_ready(Team::B, 4).unwrap();
        state.tick(10);
        assert_eq!(state.phase(), Phase::BattleActive);

        assert!(state.apply_unit_damage(a, 500.0, 100).unwrap());
        assert_eq!(state.on_unit_death(a, 101), DeathMark::AlreadyPending);
        state.tick(1299);
        assert_eq!(state.phase(), Phase::BattleActive);

        state.tick(1300);
        assert_eq!(state.phase(), Phase::BattleEnd);
        assert_eq!(state.round().winner, Some(Team::B));
        assert_eq!(state.round().number, 2);
        assert!((state.hp().hp(Team::A) - 88.0).abs() < 1e-4);

        state.tick(3299);
        assert_eq!(state.phase(), Phase::BattleEnd);
        state.tick(3300);
        assert_eq!(state.phase(), Phase::PlacementA);
        assert_eq!(state.registry().count_registered(Team::B), 0);
        assert_eq!(state.ledger().balance(Team::A), 22);
        assert!(!state.is_ready(Team::A));
    }

    #[test]
    fn test_transport_down_refuses_commands_and_defers_timers() {
        let mut state = state();
        state.start_match(0).unwrap();
        state.start_battle(10).unwrap();

        state.set_transport_running(false, 10);
        assert_eq!(state.set_ready(Team::A, 10), Err(MatchError::TransportDown));
        state.tick(50);
        assert_eq!(state.phase(), Phase::BattleStart);

        state.set_transport_running(true, 60);
        // Empty board: battle active, then resolved to the default team
        assert_eq!(state.phase(), Phase::BattleEnd);
        assert_eq!(state.round().winner, Some(Team::A));
    }

    #[test]
    fn test_due_removal_waits_for_transport() {
        let mut state = state();
        state.start_match(0).unwrap();
        let a = state.place_unit(UnitArchetype::Knight, Cell::new(0, 0), 1, 1).unwrap();
        state.set_ready(Team::A, 2).unwrap();
        place_b(&mut state, UnitArchetype::Archer, 5, 0, 3).unwrap();
        state.set_ready(Team::B, 4).unwrap();
        state.tick(10);
        assert_eq!(state.on_unit_death(a, 100), DeathMark::Scheduled);

        state.set_transport_running(false, 200);
        state.tick(5000);
        assert_eq!(state.phase(), Phase::BattleActive);
        assert_eq!(state.transition_seq(), 4);

        state.set_transport_running(true, 5000);
        assert_eq!(state.phase(), Phase::BattleEnd);
        assert_eq!(state.round().winner, Some(Team::B));
        assert_eq!(state.transition_seq(), 5);
    }

    #[test]
    fn test_abort_cancels_timers_and_subscribers() {
        let mut state = state();
        let (_, _rx) = state.events().subscribe(&[EventKind::Phase]);
        state.start_match(0).unwrap();
        state.start_battle(1).unwrap();
        assert!(!state.scheduler().is_empty());

        state.abort();
        assert!(state.scheduler().is_empty());
        assert_eq!(state.events().subscription_count(), 0);
    }
}
