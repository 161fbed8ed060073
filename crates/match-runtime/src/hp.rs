//! Team HP ledger
//!
//! HP persists across rounds; the loser of each battle takes damage scaled by
//! how many of the winner's units survived.

use crate::config::DamageConfig;
use crate::types::Team;

/// `max(min_damage, base_damage + per_unit_damage * survivors)`
pub fn round_damage(config: &DamageConfig, survivors: u32) -> f32 {
    (config.base_damage + config.per_unit_damage * survivors as f32).max(config.min_damage)
}

pub struct HpLedger {
    hp: [f32; 2],
    win_streaks: [u32; 2],
    config: DamageConfig,
}

impl HpLedger {
    pub fn new(config: DamageConfig) -> Self {
        Self {
            hp: [config.starting_hp; 2],
            win_streaks: [0; 2],
            config,
        }
    }

    pub fn hp(&self, team: Team) -> f32 {
        self.hp[team.index()]
    }

    pub fn win_streak(&self, team: Team) -> u32 {
        self.win_streaks[team.index()]
    }

    /// Damage the loser, update streaks, return the damage dealt
    pub fn apply_round(&mut self, winner: Team, survivors: u32) -> f32 {
        let loser = winner.opponent();
        let damage = round_damage(&self.config, survivors);
        self.hp[loser.index()] -= damage;
        self.win_streaks[winner.index()] += 1;
        self.win_streaks[loser.index()] = 0;
        tracing::info!(
            "Team {} wins round with {} survivors; team {} takes {:.1} damage ({:.1} HP left)",
            winner,
            survivors,
            loser,
            damage,
            self.hp(loser)
        );
        damage
    }

    /// First team (A before B) whose HP is exhausted
    pub fn defeated(&self) -> Option<Team> {
        Team::ALL.into_iter().find(|t| self.hp(*t) <= 0.0)
    }

    /// Adopt replicated values (mirroring peers only)
    pub fn set_view(&mut self, team: Team, hp: f32, win_streak: u32) {
        self.hp[team.index()] = hp;
        self.win_streaks[team.index()] = win_streak;
    }
}
