//! Order synergy tracking
//!
//! Counts units per (team, order). When a count reaches the threshold the
//! order's effect is applied once to every live unit of that order the local
//! peer owns. Falling back below the threshold only marks the synergy
//! inactive: bonuses already granted are kept.

use crate::events::{EventBus, MatchEvent};
use crate::registry::UnitRegistry;
use crate::types::{Order, PeerId, Team, Unit, UnitId};
use std::collections::{HashMap, HashSet};

pub const SHIELD_HP_BONUS: f32 = 0.15;
pub const SHIELD_ABILITY_BONUS: f32 = 0.15;
pub const WILD_ATTACK_SPEED_BONUS: f32 = 0.2;
pub const WILD_LOW_HP_DAMAGE_BONUS: f32 = 0.15;
pub const ARCANE_TARGET_DAMAGE_BONUS: f32 = 0.15;
pub const REALM_BONUS_PER_UNIT: f32 = 0.10;
pub const REALM_BONUS_CAP: f32 = 0.30;

/// Threshold crossing caused by a count change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynergyChange {
    Activated,
    Deactivated,
    Unchanged,
}

pub struct OrderTracker {
    counts: HashMap<(Team, Order), u32>,
    active: HashSet<(Team, Order)>,
    threshold: u32,
    events: EventBus,
}

impl OrderTracker {
    pub fn new(threshold: u32, events: EventBus) -> Self {
        Self {
            counts: HashMap::new(),
            active: HashSet::new(),
            threshold: threshold.max(1),
            events,
        }
    }

    pub fn count(&self, team: Team, order: Order) -> u32 {
        self.counts.get(&(team, order)).copied().unwrap_or(0)
    }

    pub fn is_active(&self, team: Team, order: Order) -> bool {
        self.active.contains(&(team, order))
    }

    /// Count one more unit of `order`
    pub fn register(&mut self, team: Team, order: Order) -> SynergyChange {
        let count = {
            let entry = self.counts.entry((team, order)).or_insert(0);
            *entry += 1;
            *entry
        };
        self.events.publish(MatchEvent::UnitCountChanged { team, order, count });

        if count >= self.threshold && self.active.insert((team, order)) {
            tracing::debug!("Synergy {:?} activated for team {} ({} units)", order, team, count);
            self.events.publish(MatchEvent::SynergyToggled {
                team,
                order,
                count,
                active: true,
            });
            return SynergyChange::Activated;
        }
        SynergyChange::Unchanged
    }

    /// Count one fewer unit of `order`
    pub fn unregister(&mut self, team: Team, order: Order) -> SynergyChange {
        let count = match self.counts.get_mut(&(team, order)) {
            Some(entry) if *entry > 0 => {
                *entry -= 1;
                *entry
            }
            _ => return SynergyChange::Unchanged,
        };
        self.events.publish(MatchEvent::UnitCountChanged { team, order, count });

        if count < self.threshold && self.active.remove(&(team, order)) {
            tracing::debug!("Synergy {:?} deactivated for team {} ({} units)", order, team, count);
            self.events.publish(MatchEvent::SynergyToggled {
                team,
                order,
                count,
                active: false,
            });
            return SynergyChange::Deactivated;
        }
        SynergyChange::Unchanged
    }

    /// Track a freshly registered unit and grant any effect it is due.
    ///
    /// On activation every live unit of the order is boosted; a unit joining
    /// an already-active synergy is boosted on its own, and Realm units are
    /// topped up to the bonus for the new count.
    pub fn on_unit_registered(
        &mut self,
        unit_id: UnitId,
        registry: &mut UnitRegistry,
        local_peer: PeerId,
    ) -> SynergyChange {
        let Some((team, order)) = registry.get(unit_id).and_then(|u| u.order.map(|o| (u.team, o)))
        else {
            return SynergyChange::Unchanged;
        };

        let change = self.register(team, order);
        if !self.is_active(team, order) {
            return change;
        }

        let count = self.count(team, order);
        let targets: Vec<UnitId> = match (change, order) {
            (SynergyChange::Activated, _) | (_, Order::Realm) => registry.live_ids(team),
            _ => vec![unit_id],
        };
        for id in targets {
            if let Some(unit) = registry.get_mut(id) {
                if unit.order == Some(order) && unit.owner == local_peer && unit.is_alive() {
                    apply_order_effect(unit, order, count);
                }
            }
        }
        change
    }

    /// Stop counting a removed unit; its bonuses are not retracted
    pub fn on_unit_removed(&mut self, unit: &Unit) -> SynergyChange {
        match unit.order {
            Some(order) => self.unregister(unit.team, order),
            None => SynergyChange::Unchanged,
        }
    }

    /// Forget all counts (round teardown)
    pub fn reset(&mut self) {
        let active: Vec<(Team, Order)> = self.active.drain().collect();
        for (team, order) in active {
            self.events.publish(MatchEvent::SynergyToggled {
                team,
                order,
                count: 0,
                active: false,
            });
        }
        self.counts.clear();
    }
}

/// Apply an order's effect to one unit. Returns true if the unit changed.
///
/// Shield, Wild and Arcane apply once per unit. Realm scales with the count
/// and is raised (never lowered) towards the capped bonus.
pub fn apply_order_effect(unit: &mut Unit, order: Order, count: u32) -> bool {
    let first_time = !unit.modifiers.has_applied(order);
    let changed = match order {
        Order::Shield if first_time => {
            unit.modifiers.hp_bonus += SHIELD_HP_BONUS;
            unit.current_hp += unit.base.max_hp * SHIELD_HP_BONUS;
            unit.modifiers.ability_chance_bonus += SHIELD_ABILITY_BONUS;
            true
        }
        Order::Wild if first_time => {
            unit.modifiers.attack_speed_bonus += WILD_ATTACK_SPEED_BONUS;
            unit.modifiers.low_hp_damage_bonus += WILD_LOW_HP_DAMAGE_BONUS;
            true
        }
        Order::Arcane if first_time => {
            unit.modifiers.ability_target_damage_bonus += ARCANE_TARGET_DAMAGE_BONUS;
            unit.modifiers.lingering_effects = true;
            true
        }
        Order::Realm => {
            let target = (REALM_BONUS_PER_UNIT * count.saturating_sub(1) as f32).min(REALM_BONUS_CAP);
            if target > unit.modifiers.realm_bonus {
                let delta = target - unit.modifiers.realm_bonus;
                unit.current_hp += unit.base.max_hp * delta;
                unit.modifiers.realm_bonus = target;
                true
            } else {
                false
            }
        }
        _ => false,
    };
    if changed && first_time {
        unit.modifiers.applied.push(order);
    }
    changed
}
