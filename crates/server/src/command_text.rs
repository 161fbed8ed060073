//! Console command parsing

use std::num::ParseIntError;

use match_runtime::{Cell, UnitArchetype};
use thiserror::Error;

/// A line typed at the server console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Place { archetype: UnitArchetype, cell: Cell },
    Ready,
    /// Host only: skip the remaining placement
    Start,
    Status,
    /// Peer only: ask the host for a fresh snapshot
    Sync,
    Help,
    Quit,
}

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid integer '{value}' for {context}: {source}")]
    InvalidInteger {
        value: String,
        context: &'static str,
        source: ParseIntError,
    },
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
}

pub const HELP: &str = "commands: place <unit> <x> <y> | ready | start | status | sync | help | quit";

pub fn parse_command_line(input: &str) -> Result<ConsoleCommand, CommandParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CommandParseError::Empty);
    }

    let mut parts = trimmed.split_whitespace();
    let verb = parts
        .next()
        .map(|v| v.to_ascii_lowercase())
        .ok_or(CommandParseError::Empty)?;

    match verb.as_str() {
        "place" | "p" => {
            let unit_str = parts
                .next()
                .ok_or(CommandParseError::MissingArgument("unit"))?;
            let x_str = parts.next().ok_or(CommandParseError::MissingArgument("x"))?;
            let y_str = parts.next().ok_or(CommandParseError::MissingArgument("y"))?;
            let archetype = UnitArchetype::from_name(unit_str)
                .ok_or_else(|| CommandParseError::UnknownUnit(unit_str.to_string()))?;
            let x = parse_u16(x_str, "cell x")?;
            let y = parse_u16(y_str, "cell y")?;
            Ok(ConsoleCommand::Place {
                archetype,
                cell: Cell::new(x, y),
            })
        }
        "ready" | "r" => Ok(ConsoleCommand::Ready),
        "start" | "fight" => Ok(ConsoleCommand::Start),
        "status" | "s" => Ok(ConsoleCommand::Status),
        "sync" => Ok(ConsoleCommand::Sync),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(CommandParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_u16(value: &str, context: &'static str) -> Result<u16, CommandParseError> {
    value
        .parse::<u16>()
        .map_err(|source| CommandParseError::InvalidInteger {
            value: value.to_string(),
            context,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_place() {
        assert_eq!(
            parse_command_line("place knight 2 3").unwrap(),
            ConsoleCommand::Place {
                archetype: UnitArchetype::Knight,
                cell: Cell::new(2, 3)
            }
        );
        assert_eq!(
            parse_command_line("  P Mage 5 0 ").unwrap(),
            ConsoleCommand::Place {
                archetype: UnitArchetype::Mage,
                cell: Cell::new(5, 0)
            }
        );
    }

    #[test]
    fn rejects_bad_place_arguments() {
        assert!(matches!(
            parse_command_line("place knight 2"),
            Err(CommandParseError::MissingArgument("y"))
        ));
        assert!(matches!(
            parse_command_line("place dragon 1 1"),
            Err(CommandParseError::UnknownUnit(_))
        ));
        assert!(matches!(
            parse_command_line("place scout -1 1"),
            Err(CommandParseError::InvalidInteger { context: "cell x", .. })
        ));
    }

    #[test]
    fn parses_simple_verbs() {
        assert_eq!(parse_command_line("READY").unwrap(), ConsoleCommand::Ready);
        assert_eq!(parse_command_line("start").unwrap(), ConsoleCommand::Start);
        assert_eq!(parse_command_line("sync").unwrap(), ConsoleCommand::Sync);
        assert!(matches!(parse_command_line("   "), Err(CommandParseError::Empty)));
        assert!(matches!(
            parse_command_line("dance"),
            Err(CommandParseError::UnknownCommand(_))
        ));
    }
}
