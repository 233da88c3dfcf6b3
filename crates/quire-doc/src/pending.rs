//! Remote updates waiting for their causal dependencies.

use crate::op::Update;
use quire_core::OpId;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct PendingUpdate {
    update: Update,
    queued_at: Instant,
}

/// Buffer of updates that arrived before something they depend on.
#[derive(Clone, Debug, Default)]
pub struct PendingQueue {
    entries: Vec<PendingUpdate>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.entries.iter().any(|p| &p.update.id == id)
    }

    pub fn push(&mut self, update: Update, now: Instant) {
        if !self.contains(&update.id) {
            self.entries.push(PendingUpdate {
                update,
                queued_at: now,
            });
        }
    }

    /// Remove and return every update for which `ready` holds, oldest id
    /// first so a replica's own chain drains in order.
    pub fn take_ready(&mut self, mut ready: impl FnMut(&Update) -> bool) -> Vec<Update> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if ready(&entry.update) {
                taken.push(entry.update);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        taken.sort_by(|a, b| a.id.cmp(&b.id));
        taken
    }

    /// Remove updates that have waited longer than `timeout`, returning the
    /// oldest one's id and its wait.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<(OpId, Duration)> {
        let mut oldest: Option<(OpId, Duration)> = None;
        self.entries.retain(|entry| {
            let waited = now.saturating_duration_since(entry.queued_at);
            if waited <= timeout {
                return true;
            }
            if oldest.as_ref().map_or(true, |(_, w)| waited > *w) {
                oldest = Some((entry.update.id.clone(), waited));
            }
            false
        });
        oldest
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
