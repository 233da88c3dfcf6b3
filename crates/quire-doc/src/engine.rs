//! Document State Engine
//!
//! Owns one replica of one document:
//! - resolves local operations into updates stamped with the next Lamport clock
//! - integrates remote updates once their causal dependencies are observed,
//!   queueing them until then
//! - serves snapshots, state vectors and the update log for catch-up sync

use crate::block::Placement;
use crate::error::{DocError, Result};
use crate::log::UpdateLog;
use crate::op::{Change, DocumentId, Operation, Update};
use crate::pending::PendingQueue;
use crate::state::{DocumentState, RenderedDocument};
use quire_core::{LamportClock, Lattice, OpId, ReplicaId, StateVector};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum queued remote updates before a full resync is requested.
    pub max_pending: usize,
    /// How long a queued update may wait for its dependencies.
    pub dependency_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            dependency_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of integrating a remote update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyResult {
    /// The update and any queued updates it unblocked, in application order.
    Applied(Vec<Update>),
    /// Already integrated or already queued.
    Duplicate,
    /// Waiting for these dependencies.
    Queued { missing: Vec<OpId> },
    /// The dependency queue overflowed and was dropped; the caller should
    /// request the peer's full state.
    ResyncRequired { dropped: usize },
}

/// Result of applying several local operations.
#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub updates: Vec<Update>,
    /// Index in the batch and reason of each dropped operation.
    pub dropped: Vec<(usize, DocError)>,
}

pub struct DocumentEngine {
    replica_id: ReplicaId,
    state: DocumentState,
    clock: LamportClock,
    log: UpdateLog,
    pending: PendingQueue,
    config: EngineConfig,
}

impl DocumentEngine {
    pub fn new(document_id: impl Into<DocumentId>, replica_id: impl Into<ReplicaId>) -> Self {
        Self::with_config(document_id, replica_id, EngineConfig::default())
    }

    pub fn with_config(
        document_id: impl Into<DocumentId>,
        replica_id: impl Into<ReplicaId>,
        config: EngineConfig,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            state: DocumentState::new(document_id),
            clock: LamportClock::new(),
            log: UpdateLog::new(),
            pending: PendingQueue::new(),
            config,
        }
    }

    /// Resume from a stored snapshot. The log starts empty with the
    /// snapshot's state vector as its baseline.
    pub fn from_snapshot(
        state: DocumentState,
        replica_id: impl Into<ReplicaId>,
        config: EngineConfig,
    ) -> Self {
        let mut clock = LamportClock::new();
        clock.observe(state.state_vector().max_clock());
        Self {
            replica_id: replica_id.into(),
            log: UpdateLog::with_baseline(state.state_vector().clone()),
            state,
            clock,
            pending: PendingQueue::new(),
            config,
        }
    }

    pub fn document_id(&self) -> &str {
        self.state.document_id()
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn snapshot(&self) -> DocumentState {
        self.state.clone()
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.state_vector().clone()
    }

    pub fn log(&self) -> &UpdateLog {
        &self.log
    }

    pub fn render(&self) -> RenderedDocument {
        self.state.render()
    }

    pub fn plain_text(&self) -> String {
        self.state.plain_text()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the update has been integrated.
    pub fn contains(&self, id: &OpId) -> bool {
        self.state.has_observed(id)
    }

    // === Local operations ===

    /// Apply a local operation and return the update to broadcast.
    pub fn apply_local(&mut self, op: Operation) -> Result<Update> {
        let change = self.resolve(op)?;
        let update = Update {
            document_id: self.state.document_id().to_string(),
            prev: self.state.state_vector().get(&self.replica_id),
            id: OpId::new(self.replica_id.clone(), self.clock.tick()),
            change,
        };
        self.state.integrate(&update);
        self.log.push(update.clone());
        Ok(update)
    }

    /// Apply operations in order. An operation that cannot be applied is
    /// dropped and reported; the rest still go through.
    pub fn apply_local_batch(&mut self, ops: impl IntoIterator<Item = Operation>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (index, op) in ops.into_iter().enumerate() {
            match self.apply_local(op) {
                Ok(update) => outcome.updates.push(update),
                Err(err) => {
                    debug!(document_id = %self.document_id(), index, %err, "dropping operation from batch");
                    outcome.dropped.push((index, err));
                }
            }
        }
        outcome
    }

    /// Turn an offset-addressed operation into an id-addressed change.
    fn resolve(&self, op: Operation) -> Result<Change> {
        let blocks = self.state.blocks();
        let visible_block = |block: &OpId| match blocks.get(block) {
            None => Err(DocError::InvalidOperation(format!("unknown block {block}"))),
            Some(b) if b.is_deleted() => {
                Err(DocError::InvalidOperation(format!("block {block} was deleted")))
            }
            Some(b) => Ok(b),
        };

        match op {
            Operation::InsertBlock { after, kind } => {
                if let Some(after) = &after {
                    if !blocks.contains(after) {
                        return Err(DocError::InvalidOperation(format!("unknown block {after}")));
                    }
                }
                Ok(Change::InsertBlock {
                    origin: after,
                    kind,
                })
            }
            Operation::DeleteBlock { block } => {
                visible_block(&block)?;
                Ok(Change::DeleteBlock { block })
            }
            Operation::SetBlockKind { block, kind } => {
                visible_block(&block)?;
                Ok(Change::SetBlockKind { block, kind })
            }
            Operation::InsertText {
                block,
                offset,
                text,
            } => {
                if text.is_empty() {
                    return Err(DocError::InvalidOperation("empty text insert".into()));
                }
                let Some(target) = blocks.get(&block) else {
                    return Err(DocError::InvalidOperation(format!("unknown block {block}")));
                };
                if !target.is_deleted() {
                    let len = target.text().len();
                    if offset > len {
                        debug!(document_id = %self.document_id(), offset, len, "clamping insert offset");
                    }
                    let origin = target.text().origin_at(offset.min(len));
                    return Ok(Change::InsertText {
                        block,
                        origin,
                        text,
                    });
                }

                // The block went away under us: move the text next door
                let Some((nearest, placement)) = blocks.nearest_visible(&block) else {
                    return Err(DocError::InvalidOperation(format!(
                        "block {block} was deleted and no visible block remains"
                    )));
                };
                warn!(document_id = %self.document_id(), from = %block, to = %nearest, "relocating insert out of deleted block");
                let origin = match (placement, blocks.get(&nearest)) {
                    (Placement::End, Some(b)) => b.text().origin_at(b.text().len()),
                    _ => None,
                };
                Ok(Change::InsertText {
                    block: nearest,
                    origin,
                    text,
                })
            }
            Operation::DeleteText { block, offset, len } => {
                let target = visible_block(&block)?;
                let Some((first, last)) = target.text().visible_span(offset, len) else {
                    return Err(DocError::InvalidOperation(format!(
                        "range {offset}+{len} outside text of length {}",
                        target.text().len()
                    )));
                };
                Ok(Change::DeleteText { block, first, last })
            }
            Operation::Format {
                block,
                offset,
                len,
                mark,
                enabled,
            } => {
                let target = visible_block(&block)?;
                let Some((start, end)) = target.text().visible_span(offset, len) else {
                    return Err(DocError::InvalidOperation(format!(
                        "range {offset}+{len} outside text of length {}",
                        target.text().len()
                    )));
                };
                Ok(Change::Format {
                    block,
                    start,
                    end,
                    mark,
                    enabled,
                })
            }
        }
    }

    // === Remote updates ===

    /// Integrate an update from another replica.
    pub fn apply_remote(&mut self, update: Update) -> Result<ApplyResult> {
        if update.document_id != self.state.document_id() {
            return Err(DocError::DocumentMismatch {
                expected: self.state.document_id().to_string(),
                actual: update.document_id,
            });
        }
        if self.state.has_observed(&update.id) || self.pending.contains(&update.id) {
            return Ok(ApplyResult::Duplicate);
        }

        let missing = self.state.missing_dependencies(&update);
        if !missing.is_empty() {
            if self.pending.len() >= self.config.max_pending {
                let dropped = self.pending.clear() + 1;
                warn!(document_id = %self.document_id(), dropped, "dependency queue overflow, full resync required");
                return Ok(ApplyResult::ResyncRequired { dropped });
            }
            debug!(document_id = %self.document_id(), update = %update.id, missing = missing.len(), "queueing update until dependencies arrive");
            self.pending.push(update, Instant::now());
            return Ok(ApplyResult::Queued { missing });
        }

        let mut applied = Vec::new();
        self.integrate_remote(update, &mut applied)?;
        self.drain_pending(&mut applied);
        Ok(ApplyResult::Applied(applied))
    }

    fn integrate_remote(&mut self, update: Update, applied: &mut Vec<Update>) -> Result<()> {
        self.state.check_references(&update)?;
        self.clock.observe(update.id.clock);
        self.state.integrate(&update);
        self.log.push(update.clone());
        applied.push(update);
        Ok(())
    }

    fn drain_pending(&mut self, applied: &mut Vec<Update>) {
        loop {
            let state = &self.state;
            let ready = self
                .pending
                .take_ready(|u| state.missing_dependencies(u).is_empty());
            if ready.is_empty() {
                break;
            }
            for update in ready {
                if self.state.has_observed(&update.id) {
                    continue;
                }
                let id = update.id.clone();
                if let Err(err) = self.integrate_remote(update, applied) {
                    warn!(document_id = %self.document_id(), update = %id, %err, "discarding queued update");
                }
            }
        }
    }

    /// Join a peer's full state into this replica. Returns queued updates
    /// that became applicable.
    pub fn merge_snapshot(&mut self, snapshot: &DocumentState) -> Result<Vec<Update>> {
        if snapshot.document_id() != self.state.document_id() {
            return Err(DocError::DocumentMismatch {
                expected: self.state.document_id().to_string(),
                actual: snapshot.document_id().to_string(),
            });
        }
        self.state.join_assign(snapshot);
        self.clock.observe(snapshot.state_vector().max_clock());
        self.log.note_baseline(snapshot.state_vector());

        let mut applied = Vec::new();
        self.drain_pending(&mut applied);
        Ok(applied)
    }

    /// Drop queued updates that have waited longer than the configured
    /// timeout. An error means the caller should request a resync.
    pub fn expire_pending(&mut self, now: Instant) -> Result<()> {
        match self.pending.expire(now, self.config.dependency_timeout) {
            Some((update, waited)) => {
                warn!(document_id = %self.document_id(), %update, ?waited, "dependency timeout");
                Err(DocError::DependencyTimeout { update, waited })
            }
            None => Ok(()),
        }
    }

    /// Drop log entries every peer is known to have.
    pub fn compact_log(&mut self, stable: &StateVector) -> usize {
        self.log.compact(stable)
    }
}
