//! Event Bus - publish/subscribe for match events
//!
//! Collaborators (UI bridges, loggers, the peer mirror) subscribe to the event
//! kinds they care about and must unsubscribe on teardown. Cloning the bus
//! shares the same subscriber set.

use crate::types::{Order, Phase, Team};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;

/// Subscription ID
pub type SubscriptionId = u64;

/// Per-subscriber channel depth
const SUBSCRIBER_CAPACITY: usize = 256;

/// Events emitted by the match kernel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchEvent {
    PhaseChanged { phase: Phase, round: u32 },
    CommandPointsChanged { team: Team, balance: u32, cap: u32 },
    UnitCountChanged { team: Team, order: Order, count: u32 },
    SynergyToggled { team: Team, order: Order, count: u32, active: bool },
    UnitRegistryChanged { team: Team, alive: usize },
    RoundEnded { winner: Team, survivors: u32, damage: f32 },
    MatchEnded { winner: Team },
}

/// Event kinds used for filtering subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Phase,
    CommandPoints,
    UnitCount,
    Synergy,
    UnitRegistry,
    Round,
    Match,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Phase,
        EventKind::CommandPoints,
        EventKind::UnitCount,
        EventKind::Synergy,
        EventKind::UnitRegistry,
        EventKind::Round,
        EventKind::Match,
    ];
}

impl MatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MatchEvent::PhaseChanged { .. } => EventKind::Phase,
            MatchEvent::CommandPointsChanged { .. } => EventKind::CommandPoints,
            MatchEvent::UnitCountChanged { .. } => EventKind::UnitCount,
            MatchEvent::SynergyToggled { .. } => EventKind::Synergy,
            MatchEvent::UnitRegistryChanged { .. } => EventKind::UnitRegistry,
            MatchEvent::RoundEnded { .. } => EventKind::Round,
            MatchEvent::MatchEnded { .. } => EventKind::Match,
        }
    }
}

/// Subscription entry
#[derive(Clone, Debug)]
struct Subscription {
    kinds: Vec<EventKind>,
    sender: broadcast::Sender<MatchEvent>,
}

/// Shared publish/subscribe bus
#[derive(Clone, Default)]
pub struct EventBus {
    /// Active subscriptions by ID
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    /// Subscriptions by event kind for efficient lookup
    kind_index: Arc<DashMap<EventKind, Vec<SubscriptionId>>>,
    /// Next subscription ID (0 is never handed out)
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given event kinds
    pub fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> (SubscriptionId, broadcast::Receiver<MatchEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = broadcast::channel(SUBSCRIBER_CAPACITY);

        for kind in kinds {
            self.kind_index.entry(*kind).or_default().push(id);
        }
        self.subscriptions.insert(
            id,
            Subscription {
                kinds: kinds.to_vec(),
                sender,
            },
        );

        tracing::debug!("Created event subscription {} for {:?}", id, kinds);
        (id, receiver)
    }

    /// Subscribe to every event kind
    pub fn subscribe_all(&self) -> (SubscriptionId, broadcast::Receiver<MatchEvent>) {
        self.subscribe(&EventKind::ALL)
    }

    /// Remove a subscription; returns false if it did not exist
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        if let Some((_, sub)) = self.subscriptions.remove(&subscription_id) {
            for kind in &sub.kinds {
                if let Some(mut ids) = self.kind_index.get_mut(kind) {
                    ids.retain(|&id| id != subscription_id);
                }
            }
            tracing::debug!("Removed event subscription {}", subscription_id);
            true
        } else {
            false
        }
    }

    /// Deliver an event to every subscriber of its kind
    pub fn publish(&self, event: MatchEvent) {
        if let Some(ids) = self.kind_index.get(&event.kind()) {
            for id in ids.iter() {
                if let Some(sub) = self.subscriptions.get(id) {
                    // Receiver may have been dropped without unsubscribing
                    let _ = sub.sender.send(event.clone());
                }
            }
        }
    }

    /// Drop every subscription (match teardown)
    pub fn clear(&self) {
        self.subscriptions.clear();
        self.kind_index.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn has_subscription(&self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&subscription_id)
    }
}
