//! Core match types shared by the host and mirroring peers

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer identifier (one per connected process)
pub type PeerId = u64;

/// Unix-millis style timestamp, or match-relative millis on the host clock
pub type Millis = u64;

/// One of the two sides of a match
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum Team {
    /// The "player" side
    A,
    /// The opposing side
    B,
}

impl Team {
    pub const ALL: [Team; 2] = [Team::A, Team::B];

    /// Index into per-team arrays
    pub fn index(self) -> usize {
        match self {
            Team::A => 0,
            Team::B => 1,
        }
    }

    pub fn opponent(self) -> Team {
        match self {
            Team::A => Team::B,
            Team::B => Team::A,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Team::A => write!(f, "A"),
            Team::B => write!(f, "B"),
        }
    }
}

/// Stable unit identifier, unique for the lifetime of a match
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Grid cell
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Cell {
    pub x: u16,
    pub y: u16,
}

impl Cell {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Fixed set of unit archetypes a player can place
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UnitArchetype {
    Footman,
    Archer,
    Knight,
    Mage,
    Guardian,
    Berserker,
    Warlock,
    Paladin,
    Scout,
}

impl UnitArchetype {
    pub const ALL: [UnitArchetype; 9] = [
        UnitArchetype::Footman,
        UnitArchetype::Archer,
        UnitArchetype::Knight,
        UnitArchetype::Mage,
        UnitArchetype::Guardian,
        UnitArchetype::Berserker,
        UnitArchetype::Warlock,
        UnitArchetype::Paladin,
        UnitArchetype::Scout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitArchetype::Footman => "footman",
            UnitArchetype::Archer => "archer",
            UnitArchetype::Knight => "knight",
            UnitArchetype::Mage => "mage",
            UnitArchetype::Guardian => "guardian",
            UnitArchetype::Berserker => "berserker",
            UnitArchetype::Warlock => "warlock",
            UnitArchetype::Paladin => "paladin",
            UnitArchetype::Scout => "scout",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|a| a.as_str() == lowered)
    }
}

/// Synergy grouping ("order") a unit may belong to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Shield,
    Wild,
    Arcane,
    Realm,
}

impl Order {
    pub const ALL: [Order; 4] = [Order::Shield, Order::Wild, Order::Arcane, Order::Realm];
}

/// Unit lifecycle state as reported by the combat subsystem
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum UnitState {
    #[default]
    Idle,
    Moving,
    Attacking,
    Dead,
}

/// Base combat stats of an archetype
#[derive(Debug, Clone, Copy, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct UnitStats {
    pub max_hp: f32,
    pub damage: f32,
    pub speed: f32,
    pub attack_range: f32,
    /// Seconds between attacks
    pub attack_interval: f32,
    /// Chance (0..1) that an attack triggers the unit's ability
    pub ability_chance: f32,
}

/// Synergy bonuses layered on top of base stats.
///
/// Bonuses are sticky: once applied they stay for the rest of the round even
/// if the synergy deactivates.
#[derive(Debug, Clone, Default, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct SynergyModifiers {
    /// Fraction of base max HP
    pub hp_bonus: f32,
    /// Fraction of base damage
    pub damage_bonus: f32,
    pub ability_chance_bonus: f32,
    /// Attacks per second added on top of the base rate
    pub attack_speed_bonus: f32,
    /// Extra damage fraction while below half HP
    pub low_hp_damage_bonus: f32,
    /// Extra damage fraction against ability-affected targets
    pub ability_target_damage_bonus: f32,
    pub lingering_effects: bool,
    /// Realm bonus currently granted (fraction of HP and damage)
    pub realm_bonus: f32,
    /// Orders whose effect has been applied
    pub applied: Vec<Order>,
}

impl SynergyModifiers {
    pub fn has_applied(&self, order: Order) -> bool {
        self.applied.contains(&order)
    }
}

/// A placed unit
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub team: Team,
    /// Peer holding write authority over this unit
    pub owner: PeerId,
    pub archetype: UnitArchetype,
    pub order: Option<Order>,
    pub cell: Cell,
    pub base: UnitStats,
    pub current_hp: f32,
    pub state: UnitState,
    pub modifiers: SynergyModifiers,
    /// Combat/targeting has been started for this unit
    pub targeting: bool,
}

impl Unit {
    pub fn new(
        id: UnitId,
        team: Team,
        owner: PeerId,
        archetype: UnitArchetype,
        order: Option<Order>,
        cell: Cell,
        base: UnitStats,
    ) -> Self {
        Self {
            id,
            team,
            owner,
            archetype,
            order,
            cell,
            base,
            current_hp: base.max_hp,
            state: UnitState::Idle,
            modifiers: SynergyModifiers::default(),
            targeting: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != UnitState::Dead && self.current_hp > 0.0
    }

    pub fn effective_max_hp(&self) -> f32 {
        self.base.max_hp * (1.0 + self.modifiers.hp_bonus + self.modifiers.realm_bonus)
    }

    /// Damage dealt by one attack, including conditional synergy bonuses
    pub fn effective_damage(&self, target_ability_affected: bool) -> f32 {
        let mut bonus = self.modifiers.damage_bonus + self.modifiers.realm_bonus;
        if self.current_hp < self.effective_max_hp() * 0.5 {
            bonus += self.modifiers.low_hp_damage_bonus;
        }
        if target_ability_affected {
            bonus += self.modifiers.ability_target_damage_bonus;
        }
        self.base.damage * (1.0 + bonus)
    }

    /// Attacks per second
    pub fn attack_speed(&self) -> f32 {
        let base_rate = if self.base.attack_interval > 0.0 {
            1.0 / self.base.attack_interval
        } else {
            0.0
        };
        base_rate + self.modifiers.attack_speed_bonus
    }

    pub fn ability_chance(&self) -> f32 {
        (self.base.ability_chance + self.modifiers.ability_chance_bonus).min(1.0)
    }
}

/// A request to place one unit, identified by (team, timestamp)
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub team: Team,
    pub archetype: UnitArchetype,
    pub cell: Cell,
    /// Monotonic per originating peer; doubles as the idempotency key
    pub timestamp: Millis,
}

impl PlacementRequest {
    pub fn key(&self) -> (Team, Millis) {
        (self.team, self.timestamp)
    }
}

/// Match phase
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum Phase {
    #[default]
    Setup,
    PlacementA,
    PlacementB,
    BattleStart,
    BattleActive,
    BattleEnd,
    GameOver,
}

impl Phase {
    /// Team allowed to place units in this phase
    pub fn placing_team(&self) -> Option<Team> {
        match self {
            Phase::PlacementA => Some(Team::A),
            Phase::PlacementB => Some(Team::B),
            _ => None,
        }
    }

    pub fn accepts_placement(&self, team: Team) -> bool {
        self.placing_team() == Some(team)
    }

    pub fn is_battle(&self) -> bool {
        matches!(self, Phase::BattleStart | Phase::BattleActive)
    }
}

/// Round bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Starts at 1, incremented when a battle resolves
    pub number: u32,
    pub active: bool,
    /// Winner of the most recently resolved battle
    pub winner: Option<Team>,
}

impl Default for RoundInfo {
    fn default() -> Self {
        Self {
            number: 1,
            active: false,
            winner: None,
        }
    }
}

/// Terminal match result
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub winner: Team,
    /// Set before any match-end side effect runs
    pub triggered: bool,
}
