//! Offline Reconciliation Manager
//!
//! Local updates the hub has not confirmed live in a durable, ordered
//! buffer keyed by document and client. On reconnect, after catch-up, the
//! buffer is re-validated against the current document and flushed in
//! chunks; an entry leaves the buffer only once an acknowledgement covers
//! it, so an interrupted flush keeps the unconfirmed tail for next time.

use crate::error::{Result, SyncError};
use crate::persistence::{BufferKey, PendingStore};
use async_trait::async_trait;
use quire_codec::{decode, encode};
use quire_core::{OpId, StateVector};
use quire_doc::{DocError, Update};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a flush sends buffered updates.
#[async_trait]
pub trait FlushSink: Send {
    /// Make sure `update` is part of the local document, re-applying it if
    /// it is missing. `Ok(true)` means it was re-applied.
    fn revalidate(&mut self, update: &Update) -> std::result::Result<bool, DocError>;

    /// Send a chunk and wait for the acknowledging state vector.
    async fn send_batch(&mut self, updates: &[Update]) -> Result<StateVector>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Updates that had to be re-applied locally first.
    pub replayed: usize,
    /// Updates confirmed by the peer and removed from the buffer.
    pub confirmed: usize,
    /// Updates that no longer apply and were discarded.
    pub dropped: usize,
    /// Updates still buffered.
    pub remaining: usize,
}

pub struct OfflineReconciler {
    key: BufferKey,
    buffer: VecDeque<Update>,
    store: Arc<dyn PendingStore>,
}

impl OfflineReconciler {
    /// Open the buffer for `key`, reloading whatever a previous run left.
    pub async fn load(key: BufferKey, store: Arc<dyn PendingStore>) -> Result<Self> {
        let frames = store.load(&key).await?;
        let total = frames.len();
        let mut buffer = VecDeque::with_capacity(total);
        for frame in frames {
            match decode(&frame) {
                Ok(update) => buffer.push_back(update),
                Err(err) => warn!(buffer = %key, %err, "skipping undecodable buffered update"),
            }
        }

        let reconciler = Self { key, buffer, store };
        if reconciler.buffer.len() != total {
            reconciler.rewrite_store().await?;
        }
        if !reconciler.buffer.is_empty() {
            info!(buffer = %reconciler.key, pending = reconciler.buffer.len(), "reloaded offline buffer");
        }
        Ok(reconciler)
    }

    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn pending_ids(&self) -> HashSet<OpId> {
        self.buffer.iter().map(|u| u.id.clone()).collect()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.buffer.iter().any(|u| &u.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Update> {
        self.buffer.iter()
    }

    /// Append a local update. Returns `false` for one already buffered.
    ///
    /// The update stays buffered in memory even when the store write fails;
    /// the error is still reported.
    pub async fn buffer_local_update(&mut self, update: Update) -> Result<bool> {
        if self.contains(&update.id) {
            return Ok(false);
        }
        let frame = encode(&update)?;
        debug!(buffer = %self.key, update = %update.id, "buffering offline update");
        self.buffer.push_back(update);
        self.store.append(&self.key, frame).await?;
        Ok(true)
    }

    /// Drop every buffered update `sv` covers. Returns how many went.
    pub async fn acknowledge(&mut self, sv: &StateVector) -> Result<usize> {
        let before = self.buffer.len();
        let prefix = self
            .buffer
            .iter()
            .take_while(|u| sv.contains(&u.id))
            .count();
        self.buffer.retain(|u| !sv.contains(&u.id));
        let removed = before - self.buffer.len();

        if removed == 0 {
            return Ok(0);
        }
        if removed == prefix {
            self.store.truncate_front(&self.key, prefix).await?;
        } else {
            self.rewrite_store().await?;
        }
        debug!(buffer = %self.key, removed, remaining = self.buffer.len(), "acknowledged buffered updates");
        Ok(removed)
    }

    /// Re-validate and send everything buffered, `batch_size` updates at a
    /// time. On error the unconfirmed tail stays buffered.
    pub async fn flush_on_reconnect<S: FlushSink>(
        &mut self,
        sink: &mut S,
        batch_size: usize,
    ) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        if self.buffer.is_empty() {
            return Ok(result);
        }

        let mut kept = VecDeque::with_capacity(self.buffer.len());
        for update in self.buffer.drain(..) {
            match sink.revalidate(&update) {
                Ok(replayed) => {
                    result.replayed += usize::from(replayed);
                    kept.push_back(update);
                }
                Err(err) => {
                    warn!(buffer = %self.key, update = %update.id, %err, "dropping buffered update that no longer applies");
                    result.dropped += 1;
                }
            }
        }
        self.buffer = kept;
        if result.dropped > 0 {
            self.rewrite_store().await?;
        }

        while !self.buffer.is_empty() {
            let batch: Vec<Update> = self
                .buffer
                .iter()
                .take(batch_size.max(1))
                .cloned()
                .collect();
            let sv = sink.send_batch(&batch).await?;
            let confirmed = self.acknowledge(&sv).await?;
            if confirmed == 0 {
                warn!(buffer = %self.key, "acknowledgement covered none of the flushed batch");
                break;
            }
            result.confirmed += confirmed;
        }

        result.remaining = self.buffer.len();
        info!(
            buffer = %self.key,
            confirmed = result.confirmed,
            replayed = result.replayed,
            dropped = result.dropped,
            remaining = result.remaining,
            "offline buffer flushed"
        );
        Ok(result)
    }

    async fn rewrite_store(&self) -> Result<()> {
        let frames = self
            .buffer
            .iter()
            .map(encode)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SyncError::from)?;
        self.store.replace(&self.key, frames).await?;
        Ok(())
    }
}
