//! Cooldown registry - last unlock per identity plus last unknown denial
//!
//! No entry means "never", i.e. always eligible. Entries are never removed;
//! growth is bounded by the enrolled identity count. Timestamps only move
//! forward.

use crate::domain::types::IdentityId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry handle shared by the cameras guarding one lock
pub type SharedCooldownRegistry = Arc<Mutex<CooldownRegistry>>;

#[derive(Debug, Default)]
pub struct CooldownRegistry {
    last_unlock: FxHashMap<IdentityId, Instant>,
    last_unknown_denial: Option<Instant>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCooldownRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Elapsed time since this identity was last unlocked (`Duration::MAX` if never)
    pub fn time_since_last_unlock(&self, identity_id: &IdentityId, now: Instant) -> Duration {
        self.last_unlock
            .get(identity_id)
            .map_or(Duration::MAX, |&at| now.saturating_duration_since(at))
    }

    /// Elapsed time since the last unknown denial (`Duration::MAX` if never)
    pub fn time_since_last_unknown_denial(&self, now: Instant) -> Duration {
        self.last_unknown_denial.map_or(Duration::MAX, |at| now.saturating_duration_since(at))
    }

    pub fn record_unlock(&mut self, identity_id: &IdentityId, now: Instant) {
        self.last_unlock
            .entry(identity_id.clone())
            .and_modify(|at| *at = (*at).max(now))
            .or_insert(now);
    }

    pub fn record_unknown_denial(&mut self, now: Instant) {
        self.last_unknown_denial = Some(self.last_unknown_denial.map_or(now, |at| at.max(now)));
    }

    pub fn len(&self) -> usize {
        self.last_unlock.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_unlock.is_empty()
    }
}
