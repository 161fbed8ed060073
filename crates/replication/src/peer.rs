//! Peer node - mirrors the host's match and forwards local commands

use crate::broadcast::{BroadcastClient, ClientSender};
use crate::types::{Clock, PeerMessage, ReplicationConfig, ReplicationError};
use match_runtime::{ApplyOutcome, Cell, ClientCommand, MirrorState, Sequenced, UnitArchetype};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Peer node wrapping a `MirrorState`
pub struct PeerNode {
    mirror: Arc<Mutex<MirrorState>>,
    /// Client connected to the host, taken by `run`
    client: RwLock<Option<BroadcastClient>>,
    /// Outgoing handle, kept after `run` takes the client
    sender: RwLock<Option<ClientSender>>,
    config: ReplicationConfig,
    clock: Clock,
}

impl PeerNode {
    pub fn new(mirror: MirrorState, config: ReplicationConfig) -> Self {
        Self {
            mirror: Arc::new(Mutex::new(mirror)),
            client: RwLock::new(None),
            sender: RwLock::new(None),
            config,
            clock: Clock::new(),
        }
    }

    /// Connect to the host
    pub async fn connect(&self) -> anyhow::Result<()> {
        let client =
            BroadcastClient::connect(&self.config.host_addr, self.config.peer_id, self.config.team)
                .await?;
        *self.sender.write() = Some(client.sender());
        *self.client.write() = Some(client);
        tracing::info!("Peer connected to host at {}", self.config.host_addr);
        Ok(())
    }

    /// Shared handle to the mirror (never hold it across an await)
    pub fn mirror(&self) -> Arc<Mutex<MirrorState>> {
        self.mirror.clone()
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Apply one replicated message; returns a resync request when the
    /// reorder buffer overflowed
    pub fn handle_replicated(&self, message: Sequenced) -> Option<PeerMessage> {
        let mut mirror = self.mirror.lock();
        let seq = message.seq;
        match mirror.receive(message) {
            ApplyOutcome::Applied(n) => {
                tracing::trace!("Applied {} replicated message(s) up to {}", n, mirror.last_applied());
                None
            }
            ApplyOutcome::Buffered => {
                tracing::debug!("Buffered out-of-order message {}", seq);
                None
            }
            ApplyOutcome::Stale => None,
            ApplyOutcome::Overflow => Some(PeerMessage::SyncRequest {
                from_seq: mirror.last_applied(),
            }),
        }
    }

    /// Run the peer loop: apply the host's stream and expire placement locks
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut client = self
            .client
            .write()
            .take()
            .ok_or(ReplicationError::NotConnected)?;

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Peer running, waiting for host state...");

        loop {
            tokio::select! {
                message = client.recv() => {
                    let Some(message) = message else {
                        tracing::warn!("Host connection lost");
                        break;
                    };
                    if let Some(resync) = self.handle_replicated(message) {
                        client.sender().send(resync).await?;
                    }
                }
                _ = interval.tick() => {
                    let now = self.clock.now_ms();
                    self.mirror.lock().tick(now);
                }
            }
        }

        Ok(())
    }

    fn sender(&self) -> Result<ClientSender, ReplicationError> {
        self.sender.read().clone().ok_or(ReplicationError::NotConnected)
    }

    fn command(&self, command: ClientCommand) -> PeerMessage {
        PeerMessage::Command {
            team: self.config.team,
            command,
        }
    }

    /// Place a unit: debited locally at once, confirmed by the host later
    pub async fn place(&self, archetype: UnitArchetype, cell: Cell, timestamp: u64) -> anyhow::Result<()> {
        let sender = self.sender()?;
        let command = {
            let now = self.clock.now_ms();
            self.mirror
                .lock()
                .submit_placement(archetype, cell, timestamp, now)?
        };
        sender.send(self.command(command)).await?;
        Ok(())
    }

    pub async fn ready(&self) -> anyhow::Result<()> {
        let sender = self.sender()?;
        let command = self.mirror.lock().set_ready()?;
        sender.send(self.command(command)).await?;
        Ok(())
    }

    pub async fn request_sync(&self) -> anyhow::Result<()> {
        let sender = self.sender()?;
        let from_seq = self.mirror.lock().last_applied();
        sender.send(PeerMessage::SyncRequest { from_seq }).await?;
        Ok(())
    }
}
