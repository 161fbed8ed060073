//! Transport abstraction used by the host loop

use crate::types::PeerMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reliable, ordered delivery to the match's peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver to every participant, local observers included.
    /// Returns the number of recipients.
    async fn send_to_all(&self, message: &PeerMessage) -> anyhow::Result<usize>;

    /// Deliver to remote peers only
    async fn send_to_others(&self, message: &PeerMessage) -> anyhow::Result<usize>;

    /// Whether messages are currently flowing
    fn is_running(&self) -> bool;

    /// Remote peers currently attached
    fn connected_peers(&self) -> usize;
}

/// Delivery scope of a recorded message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Others,
}

/// In-process transport that records what was sent
#[derive(Debug, Default)]
pub struct MemoryTransport {
    running: AtomicBool,
    sent: Mutex<Vec<(Scope, PeerMessage)>>,
}

impl MemoryTransport {
    pub fn new(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Take everything sent so far
    pub fn take(&self) -> Vec<(Scope, PeerMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to_all(&self, message: &PeerMessage) -> anyhow::Result<usize> {
        self.sent.lock().push((Scope::All, message.clone()));
        Ok(1)
    }

    async fn send_to_others(&self, message: &PeerMessage) -> anyhow::Result<usize> {
        self.sent.lock().push((Scope::Others, message.clone()));
        Ok(1)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One simulated peer while running
    fn connected_peers(&self) -> usize {
        usize::from(self.is_running())
    }
}
