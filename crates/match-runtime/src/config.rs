//! Match configuration
//!
//! All tunables live here so a host and its peers can agree on one file.
//! Missing fields fall back to the built-in defaults.

use crate::error::ConfigError;
use crate::types::{Order, Team, UnitArchetype, UnitStats};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Command-point economy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EconomyConfig {
    /// Balance and cap at the start of round 1
    pub starting_points: u32,
    /// Cap increase applied when a new round begins
    pub points_per_round: u32,
    /// Hard ceiling for the cap
    pub max_points: u32,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            starting_points: 20,
            points_per_round: 2,
            max_points: 30,
        }
    }
}

/// Round damage settings: `max(min, base + per_unit * survivors)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DamageConfig {
    pub starting_hp: f32,
    pub base_damage: f32,
    pub per_unit_damage: f32,
    pub min_damage: f32,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            starting_hp: 100.0,
            base_damage: 10.0,
            per_unit_damage: 1.5,
            min_damage: 12.0,
        }
    }
}

/// Timer settings, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between a unit's death and its removal (death animation)
    pub death_grace_ms: u64,
    /// Interval between unit activations at battle start
    pub stagger_ms: u64,
    /// Placement lock auto-release
    pub lock_timeout_ms: u64,
    /// Pause between battle end and the next placement phase
    pub round_end_delay_ms: u64,
    /// Host tick interval
    pub tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            death_grace_ms: 1200,
            stagger_ms: 50,
            lock_timeout_ms: 3000,
            round_end_delay_ms: 2000,
            tick_ms: 33,
        }
    }
}

/// Board settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    pub width: u16,
    pub height: u16,
    pub max_units_per_team: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 8,
            height: 6,
            max_units_per_team: 12,
        }
    }
}

/// Catalog entry for one archetype
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub archetype: UnitArchetype,
    pub cost: u32,
    pub order: Option<Order>,
    pub stats: UnitStats,
}

/// Placeable units and their prices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl UnitCatalog {
    pub fn entry(&self, archetype: UnitArchetype) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.archetype == archetype)
    }

    pub fn cost(&self, archetype: UnitArchetype) -> Option<u32> {
        self.entry(archetype).map(|e| e.cost)
    }
}

fn entry(
    archetype: UnitArchetype,
    cost: u32,
    order: Option<Order>,
    max_hp: f32,
    damage: f32,
    attack_range: f32,
    attack_interval: f32,
) -> CatalogEntry {
    CatalogEntry {
        archetype,
        cost,
        order,
        stats: UnitStats {
            max_hp,
            damage,
            speed: 2.0,
            attack_range,
            attack_interval,
            ability_chance: 0.1,
        },
    }
}

impl Default for UnitCatalog {
    fn default() -> Self {
        use UnitArchetype::*;
        Self {
            entries: vec![
                entry(Footman, 3, Some(Order::Realm), 120.0, 12.0, 1.0, 1.2),
                entry(Archer, 4, Some(Order::Wild), 80.0, 14.0, 4.0, 1.5),
                entry(Knight, 5, Some(Order::Shield), 180.0, 15.0, 1.0, 1.4),
                entry(Mage, 6, Some(Order::Arcane), 70.0, 22.0, 3.5, 2.0),
                entry(Guardian, 6, Some(Order::Shield), 240.0, 9.0, 1.0, 1.6),
                entry(Berserker, 5, Some(Order::Wild), 140.0, 18.0, 1.0, 1.0),
                entry(Warlock, 7, Some(Order::Arcane), 90.0, 20.0, 3.0, 1.8),
                entry(Paladin, 8, Some(Order::Realm), 200.0, 16.0, 1.0, 1.5),
                entry(Scout, 2, None, 60.0, 8.0, 1.5, 0.8),
            ],
        }
    }
}

/// Complete match configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchConfig {
    pub economy: EconomyConfig,
    pub damage: DamageConfig,
    pub timing: TimingConfig,
    pub grid: GridConfig,
    /// Units of one order needed on a team before its synergy activates
    pub synergy_threshold: u32,
    /// Winner when both sides are wiped with identical last-death times
    pub tie_break_team: Team,
    pub catalog: UnitCatalog,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            economy: EconomyConfig::default(),
            damage: DamageConfig::default(),
            timing: TimingConfig::default(),
            grid: GridConfig::default(),
            synergy_threshold: 2,
            tie_break_team: Team::A,
            catalog: UnitCatalog::default(),
        }
    }
}

impl MatchConfig {
    /// Load a JSON config file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: MatchConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::info!("Loaded match config from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.economy.starting_points > self.economy.max_points {
            return Err(ConfigError::Invalid(format!(
                "starting_points {} exceeds max_points {}",
                self.economy.starting_points, self.economy.max_points
            )));
        }
        if self.synergy_threshold == 0 {
            return Err(ConfigError::Invalid("synergy_threshold must be at least 1".into()));
        }
        if self.damage.starting_hp <= 0.0 {
            return Err(ConfigError::Invalid("starting_hp must be positive".into()));
        }
        if self.grid.width < 2 || self.grid.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "grid {}x{} is too small",
                self.grid.width, self.grid.height
            )));
        }
        if self.timing.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".into()));
        }
        for archetype in UnitArchetype::ALL {
            if self.catalog.entry(archetype).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "catalog has no entry for {}",
                    archetype.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.catalog.cost(UnitArchetype::Knight), Some(5));
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "economy": {{ "starting_points": 10 }} }}"#
        )
        .unwrap();

        let config = MatchConfig::load(file.path()).unwrap();
        assert_eq!(config.economy.starting_points, 10);
        assert_eq!(config.economy.points_per_round, 2);
        assert_eq!(config.timing.death_grace_ms, 1200);
    }

    #[test]
    fn test_rejects_starting_points_above_max() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "economy": {{ "starting_points": 40, "max_points": 30 }} }}"#).unwrap();

        let err = MatchConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
