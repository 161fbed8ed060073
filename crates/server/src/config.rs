//! Server Configuration

use match_runtime::MatchConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port peers connect to (host mode)
    pub listen_port: u16,
    /// Host address to connect to (peer mode)
    pub host_addr: String,
    /// Ticks between host heartbeats
    pub heartbeat_every: u64,
    /// Peer commands applied per tick
    pub max_commands_per_tick: usize,
    /// Capacity of the host's command intake
    pub intake_capacity: usize,
    /// Rules of the match itself
    #[serde(rename = "match")]
    pub game: MatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 9100,
            host_addr: "127.0.0.1:9100".to_string(),
            heartbeat_every: 30,
            max_commands_per_tick: 64,
            intake_capacity: 1024,
            game: MatchConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.game.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use match_runtime::Team;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "listen_port": 9200, "match": {{ "tie_break_team": "B", "synergy_threshold": 3 }} }}"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_port, 9200);
        assert_eq!(config.heartbeat_every, 30);
        assert_eq!(config.game.tie_break_team, Team::B);
        assert_eq!(config.game.synergy_threshold, 3);
        assert_eq!(config.game.economy.starting_points, 20);
    }

    #[test]
    fn test_invalid_match_rules_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "match": {{ "synergy_threshold": 0 }} }}"#).unwrap();
        assert!(ServerConfig::load(file.path()).is_err());
    }
}
