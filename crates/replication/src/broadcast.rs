//! Broadcast server and client for the match link
//!
//! The host runs BroadcastServer, peers connect with BroadcastClient

use crate::transport::Transport;
use crate::types::{InboundCommand, PeerMessage, ReplicationError};
use async_trait::async_trait;
use crossbeam_channel::Sender;
use futures_util::{SinkExt, StreamExt};
use match_runtime::{ClientCommand, PeerId, Sequenced, Team};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Broadcast server (run by the host)
pub struct BroadcastServer {
    /// Channel to send encoded messages to all connected peers
    tx: broadcast::Sender<Vec<u8>>,
    /// In-process observers of everything sent with `send_to_all`
    local_tx: broadcast::Sender<PeerMessage>,
    /// Connected peers by connection id
    peers: Arc<RwLock<HashMap<u64, PeerInfo>>>,
    /// Where peer commands go
    intake: Sender<InboundCommand>,
    /// Team driven by the host itself; no peer may claim it
    host_team: Team,
    started: Arc<AtomicBool>,
    next_connection: Arc<AtomicU64>,
    /// Stats
    stats: Arc<RwLock<ServerStats>>,
}

#[derive(Debug, Clone, Default)]
struct PeerInfo {
    /// Set once the peer has sent its Hello
    identity: Option<(PeerId, Team)>,
}

#[derive(Debug, Default)]
struct ServerStats {
    messages_broadcast: u64,
    commands_received: u64,
}

impl BroadcastServer {
    /// Create a new broadcast server feeding peer commands into `intake`
    pub fn new(intake: Sender<InboundCommand>, host_team: Team) -> Self {
        let (tx, _) = broadcast::channel(1000);
        let (local_tx, _) = broadcast::channel(1000);
        Self {
            tx,
            local_tx,
            peers: Arc::new(RwLock::new(HashMap::new())),
            intake,
            host_team,
            started: Arc::new(AtomicBool::new(false)),
            next_connection: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for peer connections; returns the bound address
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Broadcast server listening on {}", local_addr);

        let tx = self.tx.clone();
        let peers = self.peers.clone();
        let intake = self.intake.clone();
        let next_connection = self.next_connection.clone();
        let stats = self.stats.clone();
        let host_team = self.host_team;
        self.started.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::info!("Peer connected from {}", peer_addr);
                        let connection = next_connection.fetch_add(1, Ordering::SeqCst);
                        let rx = tx.subscribe();
                        let peers = peers.clone();
                        let intake = intake.clone();
                        let stats = stats.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_peer_connection(
                                    stream, connection, host_team, rx, peers, intake, stats,
                                )
                                .await
                            {
                                tracing::warn!("Peer connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Peers that have identified themselves
    pub fn connected_peers(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|info| info.identity.is_some())
            .count()
    }

    /// Watch everything the host sends to all participants
    pub fn subscribe_local(&self) -> broadcast::Receiver<PeerMessage> {
        self.local_tx.subscribe()
    }

    pub fn messages_broadcast(&self) -> u64 {
        self.stats.read().messages_broadcast
    }

    pub fn commands_received(&self) -> u64 {
        self.stats.read().commands_received
    }

    fn broadcast_bytes(&self, message: &PeerMessage) -> anyhow::Result<usize> {
        let data = message.to_bytes()?;
        match self.tx.send(data) {
            Ok(n) => {
                self.stats.write().messages_broadcast += 1;
                Ok(n)
            }
            // No receivers connected
            Err(_) => Ok(0),
        }
    }
}

#[async_trait]
impl Transport for BroadcastServer {
    async fn send_to_all(&self, message: &PeerMessage) -> anyhow::Result<usize> {
        let local = self.local_tx.send(message.clone()).unwrap_or(0);
        Ok(self.broadcast_bytes(message)? + local)
    }

    async fn send_to_others(&self, message: &PeerMessage) -> anyhow::Result<usize> {
        self.broadcast_bytes(message)
    }

    /// Listening and at least one peer has said hello
    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.connected_peers() > 0
    }

    fn connected_peers(&self) -> usize {
        BroadcastServer::connected_peers(self)
    }
}

/// Record a peer's identity unless its team is the host's or already taken
fn claim_team(
    peers: &RwLock<HashMap<u64, PeerInfo>>,
    connection: u64,
    peer_id: PeerId,
    team: Team,
    host_team: Team,
) -> bool {
    if team == host_team {
        return false;
    }
    let mut peers = peers.write();
    let taken = peers
        .iter()
        .any(|(id, info)| *id != connection && matches!(info.identity, Some((_, t)) if t == team));
    if taken {
        return false;
    }
    match peers.get_mut(&connection) {
        Some(info) => {
            info.identity = Some((peer_id, team));
            true
        }
        None => false,
    }
}

async fn handle_peer_connection(
    stream: TcpStream,
    connection: u64,
    host_team: Team,
    mut rx: broadcast::Receiver<Vec<u8>>,
    peers: Arc<RwLock<HashMap<u64, PeerInfo>>>,
    intake: Sender<InboundCommand>,
    stats: Arc<RwLock<ServerStats>>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    peers.write().insert(connection, PeerInfo::default());

    // Spawn task to forward broadcasts to this peer
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(data) => {
                    if ws_sender.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // The peer's reorder buffer will notice the gap and resync
                    tracing::warn!("Peer {} lagged {} messages", connection, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    // Handle incoming messages from the peer
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let peer_msg = match PeerMessage::from_bytes(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Dropping malformed message from peer {}: {}", connection, e);
                        continue;
                    }
                };
                let identity = peers.read().get(&connection).and_then(|info| info.identity);
                match (peer_msg, identity) {
                    (PeerMessage::Hello { peer_id, team }, None) => {
                        if !claim_team(&peers, connection, peer_id, team, host_team) {
                            tracing::warn!(
                                "Peer {} refused: team {} is not available",
                                peer_id,
                                team
                            );
                            break;
                        }
                        tracing::info!("Peer {} joined as team {}", peer_id, team);
                        // New peers start from a snapshot
                        forward(&intake, team, ClientCommand::RequestSync);
                    }
                    (PeerMessage::Command { team, command }, Some((peer_id, own_team))) => {
                        if team != own_team {
                            tracing::warn!(
                                "Peer {} (team {}) sent a command for team {}",
                                peer_id,
                                own_team,
                                team
                            );
                            continue;
                        }
                        stats.write().commands_received += 1;
                        forward(&intake, team, command);
                    }
                    (PeerMessage::SyncRequest { from_seq }, Some((peer_id, team))) => {
                        tracing::info!("Sync request from peer {} at seq {}", peer_id, from_seq);
                        forward(&intake, team, ClientCommand::RequestSync);
                    }
                    (other, None) => {
                        tracing::warn!("Peer {} sent {:?} before Hello", connection, other);
                    }
                    _ => {}
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    peers.write().remove(&connection);
    tracing::info!("Peer {} disconnected", connection);

    Ok(())
}

fn forward(intake: &Sender<InboundCommand>, team: Team, command: ClientCommand) {
    if let Err(e) = intake.try_send(InboundCommand { team, command }) {
        tracing::warn!("Command intake refused a command from team {}: {}", team, e);
    }
}

/// Cloneable handle for sending to the host
#[derive(Clone)]
pub struct ClientSender {
    msg_tx: mpsc::Sender<PeerMessage>,
}

impl ClientSender {
    pub async fn send(&self, message: PeerMessage) -> Result<(), ReplicationError> {
        self.msg_tx
            .send(message)
            .await
            .map_err(|_| ReplicationError::ChannelClosed)
    }
}

/// Broadcast client (run by peers)
pub struct BroadcastClient {
    /// Channel to receive replicated messages
    replicated_rx: mpsc::Receiver<Sequenced>,
    /// Channel to send messages to the host
    sender: ClientSender,
    connected: Arc<AtomicBool>,
}

impl BroadcastClient {
    /// Connect to the host and announce this peer
    pub async fn connect(host_addr: &str, peer_id: PeerId, team: Team) -> anyhow::Result<Self> {
        let url = format!("ws://{}", host_addr);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = PeerMessage::Hello { peer_id, team }.to_bytes()?;
        ws_sender.send(Message::Binary(hello)).await?;
        tracing::info!("Connected to host at {} as team {}", host_addr, team);

        let (replicated_tx, replicated_rx) = mpsc::channel::<Sequenced>(1000);
        let (msg_tx, mut msg_rx) = mpsc::channel::<PeerMessage>(100);
        let connected = Arc::new(AtomicBool::new(true));

        // Spawn receiver task
        let receiver_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match PeerMessage::from_bytes(&data) {
                        Ok(PeerMessage::Replicate(sequenced)) => {
                            if replicated_tx.send(sequenced).await.is_err() {
                                break;
                            }
                        }
                        Ok(PeerMessage::Heartbeat { tick }) => {
                            tracing::trace!("Heartbeat at host tick {}", tick);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Dropping malformed message from host: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::warn!("Host closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            receiver_connected.store(false, Ordering::SeqCst);
        });

        // Spawn sender task
        tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let data = match msg.to_bytes() {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::error!("Failed to encode {:?}: {}", msg, e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            replicated_rx,
            sender: ClientSender { msg_tx },
            connected,
        })
    }

    /// Receive the next replicated message from the host
    pub async fn recv(&mut self) -> Option<Sequenced> {
        self.replicated_rx.recv().await
    }

    pub fn sender(&self) -> ClientSender {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
