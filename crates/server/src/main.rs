//! Tactics match server
//!
//! Runs one side of a two-player match. Host mode owns the authoritative
//! round state and replicates it to the connected peer; peer mode mirrors the
//! host and forwards its player's placements. Both read console commands from
//! stdin.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use match_replication::{HostNode, NodeRole, PeerNode, ReplicationConfig};
use match_runtime::{EventBus, MatchEvent, MatchState, MirrorState, Team};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod command_text;
mod config;

use command_text::{parse_command_line, CommandParseError, ConsoleCommand, HELP};
use config::ServerConfig;

/// Node mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Host mode - owns the match and replicates it
    Host,
    /// Peer mode - mirrors the host and sends commands
    Peer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TeamArg {
    A,
    B,
}

impl From<TeamArg> for Team {
    fn from(team: TeamArg) -> Self {
        match team {
            TeamArg::A => Team::A,
            TeamArg::B => Team::B,
        }
    }
}

/// Two-player tactics match server
#[derive(Parser, Debug)]
#[command(name = "tactics-server")]
#[command(about = "Authoritative round and battle server for a two-player tactics match", long_about = None)]
struct Args {
    /// Node mode (host or peer)
    #[arg(long, value_enum, default_value = "host")]
    mode: Mode,

    /// Team controlled from this console (defaults to A for host, B for peer)
    #[arg(long, value_enum)]
    team: Option<TeamArg>,

    /// Port peers connect to (host mode)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Host address to connect to (peer mode)
    #[arg(long)]
    host_addr: Option<String>,

    /// Tick period in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut server_config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.listen_port {
        server_config.listen_port = port;
    }
    if let Some(addr) = &args.host_addr {
        server_config.host_addr = addr.clone();
    }
    if let Some(tick_ms) = args.tick_ms {
        server_config.game.timing.tick_ms = tick_ms;
    }
    server_config.game.validate()?;

    match args.mode {
        Mode::Host => run_host(&args, server_config).await,
        Mode::Peer => run_peer(&args, server_config).await,
    }
}

fn replication_config(role: NodeRole, team: Team, config: &ServerConfig) -> ReplicationConfig {
    ReplicationConfig {
        role,
        peer_id: rand::random(),
        team,
        host_addr: config.host_addr.clone(),
        listen_port: config.listen_port,
        tick_ms: config.game.timing.tick_ms,
        heartbeat_every: config.heartbeat_every,
        max_commands_per_tick: config.max_commands_per_tick,
        intake_capacity: config.intake_capacity,
    }
}

/// Wall-clock request timestamps, strictly increasing per console
struct RequestClock {
    last: AtomicU64,
}

impl RequestClock {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn next(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(wall.max(last + 1)))
            .unwrap_or(wall);
        wall.max(prev + 1)
    }
}

/// Log every match event until the bus is dropped
fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let (_, mut rx) = events.subscribe_all();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &MatchEvent) {
    match event {
        MatchEvent::PhaseChanged { phase, round } => {
            tracing::info!("Round {}: phase {:?}", round, phase);
        }
        MatchEvent::RoundEnded { winner, survivors, damage } => {
            tracing::info!(
                "Round won by team {} with {} survivors ({:.1} damage)",
                winner,
                survivors,
                damage
            );
        }
        MatchEvent::MatchEnded { winner } => {
            tracing::info!("Match over, team {} wins", winner);
        }
        other => tracing::debug!("{:?}", other),
    }
}

/// Console lines from stdin; `None` once stdin closes
async fn next_command(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<Option<ConsoleCommand>> {
    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        match parse_command_line(&line) {
            Ok(command) => return Ok(Some(command)),
            Err(CommandParseError::Empty) => continue,
            Err(e) => println!("{} ({})", e, HELP),
        }
    }
}

/// Run in host mode - authoritative match plus broadcast
async fn run_host(args: &Args, config: ServerConfig) -> Result<()> {
    let team: Team = args.team.map(Team::from).unwrap_or(Team::A);
    let replication = replication_config(NodeRole::Host, team, &config);

    tracing::info!("Starting tactics server - HOST MODE");
    tracing::info!("  Peer port: {}", replication.listen_port);
    tracing::info!("  Local team: {}", team);
    tracing::info!(
        "  Tick: {}ms ({}Hz)",
        replication.tick_ms,
        1000 / replication.tick_ms.max(1)
    );

    let events = EventBus::new();
    let logger = spawn_event_logger(&events);
    let state = MatchState::new(config.game.clone(), replication.peer_id, team, events.clone());

    let host = Arc::new(HostNode::listen(state, replication).await?);
    let runner = host.clone();
    let host_loop = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!("Host loop error: {}", e);
        }
    });

    tracing::info!("Match starts when a peer connects. Type 'help' for commands.");

    let clock = RequestClock::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let command = tokio::select! {
            command = next_command(&mut lines) => command?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(command) = command else { break };

        let now = host.clock().now_ms();
        let state = host.state();
        let mut state = state.lock();
        let result = match command {
            ConsoleCommand::Place { archetype, cell } => state
                .place_unit(archetype, cell, clock.next(), now)
                .map(|id| println!("placed {} at {}", id, cell)),
            ConsoleCommand::Ready => state.set_ready(team, now),
            ConsoleCommand::Start => state.start_battle(now),
            ConsoleCommand::Status => {
                println!(
                    "phase {:?}, round {}, peers live: {}",
                    state.phase(),
                    state.round().number,
                    state.is_transport_running()
                );
                for t in Team::ALL {
                    println!(
                        "  team {}: {} / {} points, {:.1} hp, {} units",
                        t,
                        state.ledger().balance(t),
                        state.ledger().cap(t),
                        state.hp().hp(t),
                        state.registry().count_alive(t)
                    );
                }
                Ok(())
            }
            ConsoleCommand::Sync => {
                println!("sync is a peer command");
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };
        if let Err(e) = result {
            println!("refused: {}", e);
        }
    }

    tracing::info!("Shutting down...");
    host.stop();
    host.state().lock().abort();
    host_loop.abort();
    logger.abort();

    let stats = host.stats();
    tracing::info!(
        "Host stopped after {} ticks: {} commands applied, {} refused, {} messages broadcast",
        stats.tick,
        stats.commands_applied,
        stats.commands_rejected,
        stats.messages_broadcast
    );

    Ok(())
}

/// Run in peer mode - mirror the host and forward commands
async fn run_peer(args: &Args, config: ServerConfig) -> Result<()> {
    let team: Team = args.team.map(Team::from).unwrap_or(Team::B);
    let replication = replication_config(NodeRole::Peer, team, &config);

    tracing::info!("Starting tactics server - PEER MODE");
    tracing::info!("  Connecting to host: {}", replication.host_addr);
    tracing::info!("  Local team: {}", team);

    let events = EventBus::new();
    let logger = spawn_event_logger(&events);
    let mirror = MirrorState::new(config.game.clone(), team, events.clone());

    let peer = Arc::new(PeerNode::new(mirror, replication));
    peer.connect().await?;

    let runner = peer.clone();
    let mut peer_loop = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!("Peer error: {}", e);
        }
    });

    tracing::info!("Connected to host. Type 'help' for commands.");

    let clock = RequestClock::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let command = tokio::select! {
            command = next_command(&mut lines) => command?,
            _ = tokio::signal::ctrl_c() => None,
            _ = &mut peer_loop => {
                tracing::warn!("Peer loop ended");
                None
            }
        };
        let Some(command) = command else { break };

        let result = match command {
            ConsoleCommand::Place { archetype, cell } => {
                peer.place(archetype, cell, clock.next()).await
            }
            ConsoleCommand::Ready => peer.ready().await,
            ConsoleCommand::Sync => peer.request_sync().await,
            ConsoleCommand::Status => {
                let mirror = peer.mirror();
                let mirror = mirror.lock();
                println!(
                    "phase {:?}, round {}, last seq {}, buffered {}",
                    mirror.phase(),
                    mirror.round().number,
                    mirror.last_applied(),
                    mirror.buffered()
                );
                for t in Team::ALL {
                    println!(
                        "  team {}: {} / {} points, {:.1} hp, {} units",
                        t,
                        mirror.ledger().balance(t),
                        mirror.ledger().cap(t),
                        mirror.hp().hp(t),
                        mirror.registry().count_alive(t)
                    );
                }
                Ok(())
            }
            ConsoleCommand::Start => {
                println!("only the host can start the battle");
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };
        if let Err(e) = result {
            println!("refused: {}", e);
        }
    }

    tracing::info!("Shutting down peer...");
    peer_loop.abort();
    logger.abort();
    tracing::info!("Peer stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_clock_strictly_increases() {
        let clock = RequestClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let ts = clock.next();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["tactics-server", "--mode", "peer", "--team", "a"]);
        assert!(matches!(args.mode, Mode::Peer));
        assert_eq!(args.team.map(Team::from), Some(Team::A));
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }
}
