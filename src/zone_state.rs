//! Debounced per-agent zone state.
//!
//! The stored `inside_zone` only changes when a containment result differs
//! from it, and each change produces exactly one ENTER or EXIT. The first
//! observation seeds the state without an event.

use crate::types::TransitionKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Unknown,
    Inside,
    Outside,
}

impl ZoneState {
    pub fn from_stored(inside_zone: Option<bool>) -> Self {
        match inside_zone {
            None => ZoneState::Unknown,
            Some(true) => ZoneState::Inside,
            Some(false) => ZoneState::Outside,
        }
    }

    pub fn as_stored(&self) -> Option<bool> {
        match self {
            ZoneState::Unknown => None,
            ZoneState::Inside => Some(true),
            ZoneState::Outside => Some(false),
        }
    }
}

/// What one containment result does to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// First observation; becomes the state with no event.
    Initialize(bool),
    /// Matches the stored state; nothing to write.
    Unchanged,
    /// Differs from the stored state; write it and emit the event.
    Flip(TransitionKind),
}

impl Step {
    pub fn new_state(&self, previous: ZoneState) -> ZoneState {
        match self {
            Step::Initialize(inside) => ZoneState::from_stored(Some(*inside)),
            Step::Unchanged => previous,
            Step::Flip(TransitionKind::Enter) => ZoneState::Inside,
            Step::Flip(TransitionKind::Exit) => ZoneState::Outside,
        }
    }

    pub fn transition(&self) -> Option<TransitionKind> {
        match self {
            Step::Flip(kind) => Some(*kind),
            _ => None,
        }
    }
}

pub fn step(stored: ZoneState, now_inside: bool) -> Step {
    match (stored, now_inside) {
        (ZoneState::Unknown, inside) => Step::Initialize(inside),
        (ZoneState::Inside, true) | (ZoneState::Outside, false) => Step::Unchanged,
        (ZoneState::Outside, true) => Step::Flip(TransitionKind::Enter),
        (ZoneState::Inside, false) => Step::Flip(TransitionKind::Exit),
    }
}

/// One async mutex per agent id. Pulses for different agents never contend.
#[derive(Clone, Default)]
pub struct AgentLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                // The map only holds handles; a panic elsewhere can't leave it inconsistent.
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on; returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = locks.len();
        // Handles are cloned under this mutex, so a count of one means idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn tracked_agents(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}
