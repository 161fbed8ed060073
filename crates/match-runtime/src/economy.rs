//! Command-point ledger
//!
//! Per-team spendable balance gating unit placement. The balance never goes
//! below zero and never exceeds the team's current cap.

use crate::config::EconomyConfig;
use crate::events::{EventBus, MatchEvent};
use crate::types::Team;

pub struct CommandLedger {
    balances: [u32; 2],
    caps: [u32; 2],
    config: EconomyConfig,
    events: EventBus,
}

impl CommandLedger {
    pub fn new(config: EconomyConfig, events: EventBus) -> Self {
        let start = config.starting_points.min(config.max_points);
        Self {
            balances: [start; 2],
            caps: [start; 2],
            config,
            events,
        }
    }

    pub fn balance(&self, team: Team) -> u32 {
        self.balances[team.index()]
    }

    pub fn cap(&self, team: Team) -> u32 {
        self.caps[team.index()]
    }

    /// Deduct `amount` if the balance covers it; no mutation otherwise
    pub fn try_debit(&mut self, team: Team, amount: u32) -> bool {
        let balance = &mut self.balances[team.index()];
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        self.notify(team);
        true
    }

    /// Refund `amount`, clamped to the cap
    pub fn credit(&mut self, team: Team, amount: u32) {
        let i = team.index();
        self.balances[i] = self.balances[i].saturating_add(amount).min(self.caps[i]);
        self.notify(team);
    }

    /// Raise every cap by the per-round increment and refill to the new cap
    pub fn advance_round(&mut self) {
        for team in Team::ALL {
            let i = team.index();
            self.caps[i] = self.caps[i]
                .saturating_add(self.config.points_per_round)
                .min(self.config.max_points);
            self.balances[i] = self.caps[i];
            self.notify(team);
        }
    }

    /// Adopt replicated values (mirroring peers only)
    pub fn set_view(&mut self, team: Team, balance: u32, cap: u32) {
        let i = team.index();
        if self.balances[i] == balance.min(cap) && self.caps[i] == cap {
            return;
        }
        self.caps[i] = cap;
        self.balances[i] = balance.min(cap);
        self.notify(team);
    }

    fn notify(&self, team: Team) {
        self.events.publish(MatchEvent::CommandPointsChanged {
            team,
            balance: self.balance(team),
            cap: self.cap(team),
        });
    }
}
