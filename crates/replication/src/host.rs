//! Host node - owns the authoritative match and replicates it

use crate::broadcast::BroadcastServer;
use crate::transport::Transport;
use crate::types::{Clock, HostStats, InboundCommand, PeerMessage, ReplicationConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use match_runtime::{MatchState, Phase, Sequenced};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host node: tick loop around a `MatchState`
pub struct HostNode {
    state: Arc<Mutex<MatchState>>,
    transport: Arc<dyn Transport>,
    /// Peer commands waiting for the next tick
    intake_rx: Receiver<InboundCommand>,
    intake_tx: Sender<InboundCommand>,
    config: ReplicationConfig,
    stats: RwLock<HostStats>,
    running: Arc<AtomicBool>,
    clock: Clock,
}

impl HostNode {
    /// Create a host over an existing transport
    pub fn new(
        state: MatchState,
        transport: Arc<dyn Transport>,
        intake: (Sender<InboundCommand>, Receiver<InboundCommand>),
        config: ReplicationConfig,
    ) -> Self {
        let (intake_tx, intake_rx) = intake;
        Self {
            state: Arc::new(Mutex::new(state)),
            transport,
            intake_rx,
            intake_tx,
            config,
            stats: RwLock::new(HostStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            clock: Clock::new(),
        }
    }

    /// Create a host with its own WebSocket broadcast server and start
    /// listening on the configured port
    pub async fn listen(state: MatchState, config: ReplicationConfig) -> anyhow::Result<Self> {
        let (intake_tx, intake_rx) = bounded(config.intake_capacity);
        let server = Arc::new(BroadcastServer::new(intake_tx.clone(), config.team));
        let addr = format!("0.0.0.0:{}", config.listen_port);
        server.start(&addr).await?;
        tracing::info!("Host node started, accepting peers on port {}", config.listen_port);
        Ok(Self::new(state, server, (intake_tx, intake_rx), config))
    }

    /// Shared handle to the match (never hold it across an await)
    pub fn state(&self) -> Arc<Mutex<MatchState>> {
        self.state.clone()
    }

    /// Sender for commands that do not arrive over the network
    pub fn command_sender(&self) -> Sender<InboundCommand> {
        self.intake_tx.clone()
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn stats(&self) -> HostStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One host tick at `now`: liveness, peer commands, timers, broadcast
    pub async fn step(&self, now: u64) -> anyhow::Result<()> {
        let live = self.transport.is_running();
        let (outbox, phase, round) = {
            let mut state = self.state.lock();
            state.set_transport_running(live, now);
            if live && state.phase() == Phase::Setup {
                if let Err(e) = state.start_match(now) {
                    tracing::warn!("Could not start match: {}", e);
                }
            }

            let mut applied = 0u64;
            let mut rejected = 0u64;
            for _ in 0..self.config.max_commands_per_tick {
                match self.intake_rx.try_recv() {
                    Ok(InboundCommand { team, command }) => {
                        match state.handle_command(team, command, now) {
                            Ok(()) => applied += 1,
                            Err(e) => {
                                rejected += 1;
                                tracing::debug!("Command from team {} refused: {}", team, e);
                            }
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::warn!("Command intake disconnected");
                        self.stop();
                        break;
                    }
                }
            }

            state.tick(now);

            {
                let mut stats = self.stats.write();
                stats.commands_applied += applied;
                stats.commands_rejected += rejected;
            }
            (state.drain_outbox(), state.phase(), state.round().number)
        };

        self.broadcast(outbox).await?;

        let tick = {
            let mut stats = self.stats.write();
            stats.tick += 1;
            stats.connected_peers = self.transport.connected_peers();
            stats.phase = phase;
            stats.round = round;
            stats.tick
        };
        if self.config.heartbeat_every > 0 && tick % self.config.heartbeat_every == 0 {
            self.transport
                .send_to_others(&PeerMessage::Heartbeat { tick })
                .await?;
        }
        Ok(())
    }

    async fn broadcast(&self, outbox: Vec<Sequenced>) -> anyhow::Result<()> {
        let mut sent = 0;
        for message in outbox {
            let seq = message.seq;
            let recipients = self
                .transport
                .send_to_all(&PeerMessage::Replicate(message))
                .await?;
            tracing::trace!("Replicated seq {} to {} recipients", seq, recipients);
            sent += 1;
        }
        self.stats.write().messages_broadcast += sent;
        Ok(())
    }

    /// Run the host loop until stopped
    pub async fn run(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "Host loop started ({}ms ticks, {}Hz)",
            self.config.tick_ms,
            1000 / self.config.tick_ms.max(1)
        );

        let mut last_phase = Phase::Setup;
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if let Err(e) = self.step(self.clock.now_ms()).await {
                tracing::warn!("Host tick failed: {}", e);
            }

            let phase = self.stats.read().phase;
            if phase != last_phase {
                last_phase = phase;
                if phase == Phase::GameOver {
                    tracing::info!("Match finished; host loop idling until shutdown");
                }
            }
        }

        tracing::info!("Host loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Scope};
    use match_runtime::{
        Cell, ClientCommand, EventBus, MatchConfig, PlacementRequest, Replicated, Team,
        UnitArchetype,
    };

    fn host(transport: Arc<MemoryTransport>) -> HostNode {
        let state = MatchState::new(MatchConfig::default(), 1, Team::A, EventBus::new());
        let config = ReplicationConfig {
            heartbeat_every: 2,
            ..ReplicationConfig::default()
        };
        HostNode::new(state, transport, bounded(16), config)
    }

    fn replicated(sent: &[(Scope, PeerMessage)]) -> Vec<Replicated> {
        sent.iter()
            .filter_map(|(_, m)| match m {
                PeerMessage::Replicate(s) => Some(s.body.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_match_waits_for_transport() {
        let transport = Arc::new(MemoryTransport::new(false));
        let host = host(transport.clone());

        host.step(0).await.unwrap();
        assert_eq!(host.state().lock().phase(), Phase::Setup);
        assert!(replicated(&transport.take()).is_empty());

        assert_eq!(host.stats().connected_peers, 0);
        transport.set_running(true);
        host.step(33).await.unwrap();
        assert_eq!(host.state().lock().phase(), Phase::PlacementA);
        assert_eq!(host.stats().connected_peers, 1);

        let sent = transport.take();
        let bodies = replicated(&sent);
        assert!(matches!(
            bodies[0],
            Replicated::Phase {
                phase: Phase::PlacementA,
                transition_seq: 1,
                ..
            }
        ));
        assert!(bodies.last().unwrap().is_snapshot());
        assert!(sent.iter().all(|(scope, m)| match m {
            PeerMessage::Replicate(_) => *scope == Scope::All,
            _ => *scope == Scope::Others,
        }));
        // Second tick carries the first heartbeat
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, PeerMessage::Heartbeat { tick: 2 })));
    }

    #[tokio::test]
    async fn test_peer_commands_drained_each_tick() {
        let transport = Arc::new(MemoryTransport::new(true));
        let host = host(transport.clone());
        host.step(0).await.unwrap();
        host.state().lock().set_ready(Team::A, 1).unwrap();

        let sender = host.command_sender();
        let request = PlacementRequest {
            team: Team::B,
            archetype: UnitArchetype::Scout,
            cell: Cell::new(7, 5),
            timestamp: 99,
        };
        sender
            .send(InboundCommand {
                team: Team::B,
                command: ClientCommand::Place(request),
            })
            .unwrap();
        sender
            .send(InboundCommand {
                team: Team::B,
                command: ClientCommand::Place(request),
            })
            .unwrap();
        host.step(40).await.unwrap();

        let stats = host.stats();
        assert_eq!(stats.commands_applied, 1);
        assert_eq!(stats.commands_rejected, 1);
        assert_eq!(host.state().lock().ledger().balance(Team::B), 18);
        assert!(replicated(&transport.take())
            .iter()
            .any(|b| matches!(b, Replicated::PlacementConfirmed { timestamp: 99, .. })));
    }

    #[tokio::test]
    async fn test_transport_loss_holds_the_battle() {
        let transport = Arc::new(MemoryTransport::new(true));
        let host = host(transport.clone());
        host.step(0).await.unwrap();
        host.state().lock().start_battle(10).unwrap();

        transport.set_running(false);
        host.step(20).await.unwrap();
        assert_eq!(host.state().lock().phase(), Phase::BattleStart);

        transport.set_running(true);
        host.step(60).await.unwrap();
        assert_eq!(host.state().lock().phase(), Phase::BattleEnd);
    }
}
