//! Placement coordination
//!
//! The originating peer debits its own ledger view as soon as a request is
//! accepted so rapid clicks cannot overspend during the round trip. The host
//! applies each (team, timestamp) exactly once: if it already debited the
//! request locally it does not debit again, otherwise it debits the
//! authoritative ledger. Spawn failures refund the debit.

use crate::economy::CommandLedger;
use crate::error::{MatchError, MatchResult, SpawnError};
use crate::scheduler::{Scheduler, TimerId, TimerTask};
use crate::types::{Millis, PlacementRequest, Team, UnitId};
use std::collections::{HashMap, HashSet};

/// A locally debited request awaiting confirmation
#[derive(Debug, Clone, Copy)]
struct PendingPlacement {
    request: PlacementRequest,
    debited: u32,
    timer: TimerId,
}

/// Host-side admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Debit is in place; spawn may proceed
    Admitted,
    /// This request was already applied
    Duplicate,
    Rejected(MatchError),
}

/// Single-flight placement per team. Each connection drives one team, so
/// this is also single-flight per originating client.
pub struct PlacementCoordinator {
    lock_timeout_ms: Millis,
    pending: HashMap<(Team, Millis), PendingPlacement>,
    /// Requests the host has already applied
    applied: HashSet<(Team, Millis)>,
}

impl PlacementCoordinator {
    pub fn new(lock_timeout_ms: Millis) -> Self {
        Self {
            lock_timeout_ms,
            pending: HashMap::new(),
            applied: HashSet::new(),
        }
    }

    /// True if a new placement from `team` must wait
    pub fn is_locked(&self, team: Team) -> bool {
        self.pending.keys().any(|(t, _)| *t == team)
    }

    /// Points debited locally for `team` and not yet confirmed
    pub fn pending_debit(&self, team: Team) -> u32 {
        self.pending
            .values()
            .filter(|p| p.request.team == team)
            .map(|p| p.debited)
            .sum()
    }

    /// Accept a request on its originating peer: lock, debit, arm the timeout
    pub fn submit(
        &mut self,
        request: &PlacementRequest,
        cost: u32,
        ledger: &mut CommandLedger,
        scheduler: &mut Scheduler,
        now: Millis,
    ) -> MatchResult<()> {
        let key = request.key();
        if self.pending.contains_key(&key) || self.applied.contains(&key) {
            return Err(MatchError::DuplicateRequest {
                team: request.team,
                timestamp: request.timestamp,
            });
        }
        if self.is_locked(request.team) {
            return Err(MatchError::PlacementInFlight(request.team));
        }
        if !ledger.try_debit(request.team, cost) {
            return Err(MatchError::InsufficientPoints {
                team: request.team,
                have: ledger.balance(request.team),
                need: cost,
            });
        }

        let timer = scheduler.schedule_after(
            now,
            self.lock_timeout_ms,
            TimerTask::PlacementLockTimeout {
                team: request.team,
                timestamp: request.timestamp,
            },
        );
        self.pending.insert(
            key,
            PendingPlacement {
                request: *request,
                debited: cost,
                timer,
            },
        );
        tracing::debug!(
            "Placement {} for team {} submitted ({:?} at {}), {} points held",
            request.timestamp,
            request.team,
            request.archetype,
            request.cell,
            cost
        );
        Ok(())
    }

    /// Host: decide whether a request may spawn, debiting if it was not
    /// already debited on this peer
    pub fn admit_on_host(
        &mut self,
        request: &PlacementRequest,
        cost: u32,
        ledger: &mut CommandLedger,
    ) -> Admission {
        let key = request.key();
        if !self.applied.insert(key) {
            return Admission::Duplicate;
        }
        if self.pending.contains_key(&key) {
            // Debited on submit; the same ledger is authoritative here
            return Admission::Admitted;
        }
        if !ledger.try_debit(request.team, cost) {
            return Admission::Rejected(MatchError::InsufficientPoints {
                team: request.team,
                have: ledger.balance(request.team),
                need: cost,
            });
        }
        Admission::Admitted
    }

    /// Host: settle an admitted request with the spawn outcome.
    /// A failed spawn refunds the debit exactly once.
    pub fn complete_on_host(
        &mut self,
        request: &PlacementRequest,
        cost: u32,
        ledger: &mut CommandLedger,
        scheduler: &mut Scheduler,
        spawned: Result<UnitId, SpawnError>,
    ) -> MatchResult<UnitId> {
        if let Some(pending) = self.pending.remove(&request.key()) {
            scheduler.cancel(pending.timer);
        }
        match spawned {
            Ok(unit) => Ok(unit),
            Err(e) => {
                ledger.credit(request.team, cost);
                tracing::warn!(
                    "Placement {} for team {} failed to spawn: {}; refunded {}",
                    request.timestamp,
                    request.team,
                    e,
                    cost
                );
                Err(MatchError::SpawnFailed(e))
            }
        }
    }

    /// Originator: the host confirmed. False if nothing was pending (stale).
    pub fn on_confirmed(&mut self, team: Team, timestamp: Millis, scheduler: &mut Scheduler) -> bool {
        match self.pending.remove(&(team, timestamp)) {
            Some(pending) => {
                scheduler.cancel(pending.timer);
                self.applied.insert((team, timestamp));
                true
            }
            None => false,
        }
    }

    /// Originator: the host refused. Refunds the optimistic debit.
    pub fn on_rejected(
        &mut self,
        team: Team,
        timestamp: Millis,
        ledger: &mut CommandLedger,
        scheduler: &mut Scheduler,
    ) -> bool {
        match self.pending.remove(&(team, timestamp)) {
            Some(pending) => {
                scheduler.cancel(pending.timer);
                self.applied.insert((team, timestamp));
                ledger.credit(team, pending.debited);
                true
            }
            None => false,
        }
    }

    /// The lock timer fired: release the lock and refund
    pub fn on_timeout(&mut self, team: Team, timestamp: Millis, ledger: &mut CommandLedger) -> bool {
        match self.pending.remove(&(team, timestamp)) {
            Some(pending) => {
                ledger.credit(team, pending.debited);
                tracing::warn!(
                    "Placement {} for team {} timed out; lock released, {} refunded",
                    timestamp,
                    team,
                    pending.debited
                );
                true
            }
            None => false,
        }
    }

    /// Drop all pending requests without refunding (match teardown)
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EconomyConfig;
    use crate::events::EventBus;
    use crate::types::{Cell, UnitArchetype};

    fn ledger() -> CommandLedger {
        CommandLedger::new(EconomyConfig::default(), EventBus::new())
    }

    fn request(team: Team, timestamp: Millis) -> PlacementRequest {
        PlacementRequest {
            team,
            archetype: UnitArchetype::Knight,
            cell: Cell::new(0, 0),
            timestamp,
        }
    }

    #[test]
    fn test_submit_debits_and_locks() {
        let mut coordinator = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();

        coordinator
            .submit(&request(Team::A, 1), 5, &mut ledger, &mut scheduler, 0)
            .unwrap();
        assert_eq!(ledger.balance(Team::A), 15);
        assert!(coordinator.is_locked(Team::A));
        assert!(!coordinator.is_locked(Team::B));

        let err = coordinator
            .submit(&request(Team::A, 2), 5, &mut ledger, &mut scheduler, 1)
            .unwrap_err();
        assert_eq!(err, MatchError::PlacementInFlight(Team::A));
        assert_eq!(ledger.balance(Team::A), 15);
    }

    #[test]
    fn test_in_flight_lock_does_not_block_other_team() {
        let mut coordinator = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();

        coordinator
            .submit(&request(Team::A, 1), 5, &mut ledger, &mut scheduler, 0)
            .unwrap();
        coordinator
            .submit(&request(Team::B, 1), 5, &mut ledger, &mut scheduler, 0)
            .unwrap();
        assert!(coordinator.is_locked(Team::A));
        assert!(coordinator.is_locked(Team::B));
        assert_eq!(coordinator.pending_debit(Team::B), 5);
    }

    #[test]
    fn test_insufficient_points_rejected_without_mutation() {
        let mut coordinator = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();

        let err = coordinator
            .submit(&request(Team::B, 1), 25, &mut ledger, &mut scheduler, 0)
            .unwrap_err();
        assert!(matches!(err, MatchError::InsufficientPoints { have: 20, need: 25, .. }));
        assert_eq!(ledger.balance(Team::B), 20);
        assert!(!coordinator.is_locked(Team::B));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_host_applies_relayed_request_exactly_once() {
        let mut host = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let req = request(Team::B, 42);

        assert_eq!(host.admit_on_host(&req, 5, &mut ledger), Admission::Admitted);
        assert_eq!(host.admit_on_host(&req, 5, &mut ledger), Admission::Duplicate);
        assert_eq!(ledger.balance(Team::B), 15);
    }

    #[test]
    fn test_host_does_not_double_debit_own_request() {
        let mut host = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();
        let req = request(Team::A, 7);

        host.submit(&req, 5, &mut ledger, &mut scheduler, 0).unwrap();
        assert_eq!(host.admit_on_host(&req, 5, &mut ledger), Admission::Admitted);
        let unit = host
            .complete_on_host(&req, 5, &mut ledger, &mut scheduler, Ok(UnitId(1)))
            .unwrap();

        assert_eq!(unit, UnitId(1));
        assert_eq!(ledger.balance(Team::A), 15);
        assert!(!host.is_locked(Team::A));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_spawn_failure_refunds_once() {
        let mut host = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();
        let req = request(Team::A, 9);

        host.submit(&req, 5, &mut ledger, &mut scheduler, 0).unwrap();
        host.admit_on_host(&req, 5, &mut ledger);
        let err = host
            .complete_on_host(
                &req,
                5,
                &mut ledger,
                &mut scheduler,
                Err(SpawnError::CellOccupied(req.cell)),
            )
            .unwrap_err();

        assert!(matches!(err, MatchError::SpawnFailed(_)));
        assert_eq!(ledger.balance(Team::A), 20);
        assert!(!host.is_locked(Team::A));
    }

    #[test]
    fn test_originator_confirmation_and_stale_confirmation() {
        let mut peer = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();
        let req = request(Team::B, 5);

        peer.submit(&req, 4, &mut ledger, &mut scheduler, 0).unwrap();
        assert!(peer.on_confirmed(Team::B, 5, &mut scheduler));
        assert!(!peer.on_confirmed(Team::B, 5, &mut scheduler));
        assert_eq!(ledger.balance(Team::B), 16);
        assert!(scheduler.is_empty());

        // A retransmitted submit of the same timestamp is refused
        assert!(peer.submit(&req, 4, &mut ledger, &mut scheduler, 1).is_err());
        assert_eq!(ledger.balance(Team::B), 16);
    }

    #[test]
    fn test_rejection_refunds_and_releases_lock() {
        let mut peer = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();

        peer.submit(&request(Team::B, 5), 4, &mut ledger, &mut scheduler, 0)
            .unwrap();
        assert!(peer.on_rejected(Team::B, 5, &mut ledger, &mut scheduler));
        assert_eq!(ledger.balance(Team::B), 20);
        assert!(!peer.is_locked(Team::B));
    }

    #[test]
    fn test_timeout_releases_lock() {
        let mut peer = PlacementCoordinator::new(3000);
        let mut ledger = ledger();
        let mut scheduler = Scheduler::new();

        peer.submit(&request(Team::B, 5), 4, &mut ledger, &mut scheduler, 100)
            .unwrap();
        assert_eq!(scheduler.pop_due(3099), None);
        let (_, task) = scheduler.pop_due(3100).unwrap();
        assert_eq!(
            task,
            TimerTask::PlacementLockTimeout {
                team: Team::B,
                timestamp: 5
            }
        );

        assert!(peer.on_timeout(Team::B, 5, &mut ledger));
        assert!(!peer.is_locked(Team::B));
        assert_eq!(ledger.balance(Team::B), 20);
        assert_eq!(peer.pending_debit(Team::B), 0);
    }
}
