//! Unit registry and death bookkeeping
//!
//! A killed unit is not removed immediately: it sits in the pending-death set
//! until its grace period elapses. Pending units never count as alive.

use crate::types::{Cell, Millis, Team, Unit, UnitId, UnitState};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of reporting a death
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathMark {
    /// First report: removal must be scheduled
    Scheduled,
    /// Already pending removal
    AlreadyPending,
    /// Not in the registry
    Unknown,
    /// Dropped because the battle is not active
    Ignored,
}

#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: HashMap<UnitId, Unit>,
    rosters: [BTreeSet<UnitId>; 2],
    pending: HashSet<UnitId>,
    last_death_ms: [Option<Millis>; 2],
    next_id: u64,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next unit ID (never reused within a match)
    pub fn next_unit_id(&mut self) -> UnitId {
        self.next_id += 1;
        UnitId(self.next_id)
    }

    /// Add a unit; returns false if the ID is already registered
    pub fn register(&mut self, unit: Unit) -> bool {
        if self.units.contains_key(&unit.id) {
            return false;
        }
        self.next_id = self.next_id.max(unit.id.0);
        self.rosters[unit.team.index()].insert(unit.id);
        self.units.insert(unit.id, unit);
        true
    }

    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        self.units.get_mut(&id)
    }

    /// Mark a unit dead and pending removal (debounced)
    pub fn mark_pending_death(&mut self, id: UnitId, now: Millis) -> DeathMark {
        if self.pending.contains(&id) {
            return DeathMark::AlreadyPending;
        }
        let Some(unit) = self.units.get_mut(&id) else {
            return DeathMark::Unknown;
        };
        unit.state = UnitState::Dead;
        unit.current_hp = 0.0;
        unit.targeting = false;
        let team = unit.team;
        self.pending.insert(id);
        self.last_death_ms[team.index()] = Some(now);
        DeathMark::Scheduled
    }

    /// Drop a unit from its roster and the pending set
    pub fn finish_removal(&mut self, id: UnitId) -> Option<Unit> {
        self.pending.remove(&id);
        let unit = self.units.remove(&id)?;
        self.rosters[unit.team.index()].remove(&id);
        Some(unit)
    }

    /// Registered units minus pending deaths
    pub fn count_alive(&self, team: Team) -> usize {
        self.rosters[team.index()]
            .iter()
            .filter(|id| !self.pending.contains(*id))
            .filter(|id| self.units.get(*id).map(|u| u.is_alive()).unwrap_or(false))
            .count()
    }

    pub fn count_registered(&self, team: Team) -> usize {
        self.rosters[team.index()].len()
    }

    pub fn pending_count(&self, team: Team) -> usize {
        self.pending
            .iter()
            .filter(|id| self.units.get(*id).map(|u| u.team == team).unwrap_or(false))
            .count()
    }

    /// True while any unit on either side is still pending removal
    pub fn any_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn last_death_ms(&self, team: Team) -> Option<Millis> {
        self.last_death_ms[team.index()]
    }

    /// IDs of a team's live units, in ID order
    pub fn live_ids(&self, team: Team) -> Vec<UnitId> {
        self.rosters[team.index()]
            .iter()
            .copied()
            .filter(|id| !self.pending.contains(id))
            .filter(|id| self.units.get(id).map(|u| u.is_alive()).unwrap_or(false))
            .collect()
    }

    /// A live unit already stands on this cell
    pub fn occupied(&self, cell: Cell) -> bool {
        self.units
            .values()
            .any(|u| u.cell == cell && !self.pending.contains(&u.id))
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// Remove every unit and reset death bookkeeping; returns what was removed
    pub fn clear(&mut self) -> Vec<Unit> {
        let removed: Vec<Unit> = self.units.drain().map(|(_, u)| u).collect();
        self.rosters = Default::default();
        self.pending.clear();
        self.last_death_ms = [None; 2];
        removed
    }

    /// Replace the contents with a replicated unit list
    pub fn replace_all(&mut self, units: Vec<Unit>) {
        self.clear();
        for unit in units {
            let dead = unit.state == UnitState::Dead;
            let id = unit.id;
            self.register(unit);
            if dead {
                self.pending.insert(id);
            }
        }
    }

    /// Decide the battle winner, if any.
    ///
    /// When both sides are wiped, the side whose last death came later
    /// outlasted the other; identical timestamps go to `tie_break`.
    pub fn decide_winner(&self, tie_break: Team) -> Option<Team> {
        let alive_a = self.count_alive(Team::A);
        let alive_b = self.count_alive(Team::B);
        match (alive_a, alive_b) {
            (0, 0) => {
                let a = self.last_death_ms(Team::A).unwrap_or(0);
                let b = self.last_death_ms(Team::B).unwrap_or(0);
                Some(match a.cmp(&b) {
                    Ordering::Greater => Team::A,
                    Ordering::Less => Team::B,
                    Ordering::Equal => tie_break,
                })
            }
            (0, _) => Some(Team::B),
            (_, 0) => Some(Team::A),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UnitArchetype, UnitStats};

    fn unit(registry: &mut UnitRegistry, team: Team, x: u16) -> UnitId {
        let id = registry.next_unit_id();
        let stats = UnitStats {
            max_hp: 50.0,
            damage: 5.0,
            speed: 1.0,
            attack_range: 1.0,
            attack_interval: 1.0,
            ability_chance: 0.0,
        };
        registry.register(Unit::new(
            id,
            team,
            1,
            UnitArchetype::Footman,
            None,
            Cell::new(x, 0),
            stats,
        ));
        id
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = UnitRegistry::new();
        let id = unit(&mut registry, Team::A, 0);
        let copy = registry.get(id).cloned().unwrap();
        assert!(!registry.register(copy));
        assert_eq!(registry.count_registered(Team::A), 1);
    }

    #[test]
    fn test_pending_death_is_not_alive_and_debounced() {
        let mut registry = UnitRegistry::new();
        let id = unit(&mut registry, Team::A, 0);
        unit(&mut registry, Team::A, 1);

        assert_eq!(registry.mark_pending_death(id, 10), DeathMark::Scheduled);
        assert_eq!(registry.mark_pending_death(id, 11), DeathMark::AlreadyPending);
        assert_eq!(registry.count_alive(Team::A), 1);
        assert_eq!(registry.count_registered(Team::A), 2);
        assert_eq!(registry.last_death_ms(Team::A), Some(10));
        assert!(registry.any_pending());

        registry.finish_removal(id);
        assert!(!registry.any_pending());
        assert_eq!(registry.count_registered(Team::A), 1);
    }

    #[test]
    fn test_unknown_unit_death() {
        let mut registry = UnitRegistry::new();
        assert_eq!(registry.mark_pending_death(UnitId(99), 0), DeathMark::Unknown);
    }

    #[test]
    fn test_decide_winner_one_side_wiped() {
        let mut registry = UnitRegistry::new();
        let a = unit(&mut registry, Team::A, 0);
        unit(&mut registry, Team::B, 5);
        assert_eq!(registry.decide_winner(Team::A), None);

        registry.mark_pending_death(a, 100);
        assert_eq!(registry.decide_winner(Team::A), Some(Team::B));
    }

    #[test]
    fn test_tie_break_later_death_wins() {
        let mut registry = UnitRegistry::new();
        let a = unit(&mut registry, Team::A, 0);
        let b = unit(&mut registry, Team::B, 5);
        registry.mark_pending_death(a, 100);
        registry.mark_pending_death(b, 140);
        assert_eq!(registry.decide_winner(Team::A), Some(Team::B));
    }

    #[test]
    fn test_tie_break_equal_timestamps_use_default_team() {
        for _ in 0..5 {
            let mut registry = UnitRegistry::new();
            let a = unit(&mut registry, Team::A, 0);
            let b = unit(&mut registry, Team::B, 5);
            registry.mark_pending_death(b, 100);
            registry.mark_pending_death(a, 100);
            assert_eq!(registry.decide_winner(Team::A), Some(Team::A));
        }
    }

    #[test]
    fn test_occupied_ignores_pending_units() {
        let mut registry = UnitRegistry::new();
        let id = unit(&mut registry, Team::A, 3);
        assert!(registry.occupied(Cell::new(3, 0)));
        registry.mark_pending_death(id, 1);
        assert!(!registry.occupied(Cell::new(3, 0)));
    }
}
