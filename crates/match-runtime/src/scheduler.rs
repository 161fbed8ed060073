//! Deferred-task queue
//!
//! Grace periods, activation staggers and lock timeouts are stored as plain
//! data keyed by due time. The owner pops due tasks on every tick, so nothing
//! ever sleeps and a whole match's worth of timers can be cancelled at once.

use crate::types::{Millis, Team, UnitId};
use std::collections::{BTreeMap, HashMap};

/// Timer handle
pub type TimerId = u64;

/// Work to run when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTask {
    /// Remove a dead unit once its grace period is over
    RemoveUnit(UnitId),
    /// Start combat/targeting for one unit
    ActivateUnit(UnitId),
    /// Leave BattleStart once activations are queued
    BeginBattleActive,
    /// Release a placement lock whose confirmation never arrived
    PlacementLockTimeout { team: Team, timestamp: Millis },
    /// Leave BattleEnd for the next placement phase
    NextRound,
}

impl TimerTask {
    /// Tasks tied to units on the board
    pub fn is_unit_task(&self) -> bool {
        matches!(self, TimerTask::RemoveUnit(_) | TimerTask::ActivateUnit(_))
    }
}

/// Timer queue ordered by (due time, insertion order)
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(Millis, TimerId), TimerTask>,
    index: HashMap<TimerId, Millis>,
    next_id: TimerId,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a task at an absolute time
    pub fn schedule_at(&mut self, due: Millis, task: TimerTask) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.queue.insert((due, id), task);
        self.index.insert(id, due);
        tracing::trace!("Scheduled timer {} at {}ms: {:?}", id, due, task);
        id
    }

    /// Schedule a task `delay` ms after `now`
    pub fn schedule_after(&mut self, now: Millis, delay: Millis, task: TimerTask) -> TimerId {
        self.schedule_at(now.saturating_add(delay), task)
    }

    /// Cancel one timer; false if it already fired or never existed
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.index.remove(&id) {
            Some(due) => self.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every timer whose task matches the predicate
    pub fn cancel_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&TimerTask) -> bool,
    {
        let doomed: Vec<(Millis, TimerId)> = self
            .queue
            .iter()
            .filter(|(_, task)| predicate(task))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.queue.remove(key);
            self.index.remove(&key.1);
        }
        doomed.len()
    }

    /// Cancel everything (match or round teardown)
    pub fn cancel_all(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        self.index.clear();
        count
    }

    /// Pop the earliest task that is due at `now`
    pub fn pop_due(&mut self, now: Millis) -> Option<(TimerId, TimerTask)> {
        let (&(due, id), _) = self.queue.iter().next()?;
        if due > now {
            return None;
        }
        let task = self.queue.remove(&(due, id))?;
        self.index.remove(&id);
        Some((id, task))
    }

    pub fn next_due(&self) -> Option<Millis> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    pub fn count_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&TimerTask) -> bool,
    {
        self.queue.values().filter(|task| predicate(task)).count()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
