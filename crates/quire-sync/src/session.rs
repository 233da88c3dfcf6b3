//! Sync Session Manager
//!
//! A client session walks `Connecting -> Handshaking -> Syncing -> Live` and
//! on link loss `Disconnected -> Reconnecting -> Handshaking` again, until
//! the owner closes it. [`Link`] speaks the protocol on one transport and is
//! shared with the hub side.

use crate::awareness::{AwarenessEvent, AwarenessState, AwarenessUpdate};
use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::document::{DocEvent, DocumentHandle, Origin, SessionId};
use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::network::{Connector, Transport, TransportError, TransportEvent};
use crate::offline::{FlushSink, OfflineReconciler};
use crate::protocol::{
    snapshot_chunks, Hello, ProtocolMessage, SnapshotAssembler, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use quire_codec::{decode_all, decode_snapshot, encode_all, encode_snapshot, Diff};
use quire_core::{OpId, StateVector};
use quire_doc::{ApplyResult, DocError, Update};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use ulid::Ulid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Syncing,
    Live,
    Disconnected,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Handshaking | Disconnected) => true,
            (Handshaking, Syncing | Disconnected) => true,
            (Syncing, Live | Disconnected) => true,
            (Live, Disconnected) => true,
            (Disconnected, Reconnecting) => true,
            (Reconnecting, Handshaking | Disconnected) => true,
            _ => false,
        }
    }

    /// Whether a transport is currently up.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Handshaking | SessionState::Syncing | SessionState::Live
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Syncing => "syncing",
            SessionState::Live => "live",
            SessionState::Disconnected => "disconnected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Resolves once `cancel` is set or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        let set = *cancel.borrow_and_update();
        if set || cancel.changed().await.is_err() {
            return;
        }
    }
}

/// What a received message means to the caller.
#[derive(Debug)]
pub(crate) enum Inbound {
    SyncDone,
    Acked(StateVector),
    /// Applied, answered or ignored.
    Handled,
}

pub(crate) enum Handshake {
    Accepted(Hello),
    Rejected(String),
}

/// One step of a session loop.
pub(crate) enum Step {
    Cancel,
    Transport(Option<TransportEvent>),
    Doc(std::result::Result<DocEvent, RecvError>),
    Awareness(std::result::Result<AwarenessEvent, RecvError>),
    Heartbeat,
}

/// The protocol on one transport for one document.
pub(crate) struct Link<T: Transport> {
    transport: T,
    session: SessionId,
    document: DocumentHandle,
    config: SyncConfig,
    /// What the peer is known to hold: its hello, its acks and whatever it
    /// sent us.
    pub(crate) peer_sv: StateVector,
    assembler: SnapshotAssembler,
}

impl<T: Transport> Link<T> {
    pub(crate) fn new(
        transport: T,
        session: SessionId,
        document: DocumentHandle,
        config: SyncConfig,
        peer_sv: StateVector,
    ) -> Self {
        Self {
            transport,
            session,
            document,
            config,
            peer_sv,
            assembler: SnapshotAssembler::new(),
        }
    }

    pub(crate) fn session(&self) -> &str {
        &self.session
    }

    pub(crate) async fn send(&mut self, message: &ProtocolMessage) -> Result<()> {
        let bytes = message.encode()?;
        trace!(session = %self.session, message = message.name(), bytes = bytes.len(), "send");
        self.transport.send(bytes).await?;
        Ok(())
    }

    pub(crate) async fn next_event(&mut self) -> Option<TransportEvent> {
        self.transport.next_event().await
    }

    /// Best-effort goodbye, then close.
    pub(crate) async fn goodbye(&mut self, reason: &str) {
        let _ = self
            .send(&ProtocolMessage::Goodbye {
                reason: reason.to_string(),
            })
            .await;
        self.transport.close(reason).await;
    }

    pub(crate) async fn close(&mut self, reason: &str) {
        self.assembler.reset();
        self.transport.close(reason).await;
    }

    /// Wait for the link to open, send `hello` and read the peer's.
    pub(crate) async fn exchange_hello(&mut self, hello: Hello) -> Result<Handshake> {
        let mut sent = false;
        loop {
            match self.transport.next_event().await {
                Some(TransportEvent::Opened) if !sent => {
                    self.send(&ProtocolMessage::Hello(hello.clone())).await?;
                    sent = true;
                }
                Some(TransportEvent::Opened) => {}
                Some(TransportEvent::Message(bytes)) => match ProtocolMessage::decode(&bytes)? {
                    ProtocolMessage::Hello(peer) => return Ok(Handshake::Accepted(peer)),
                    ProtocolMessage::Goodbye { reason } => return Ok(Handshake::Rejected(reason)),
                    other => {
                        debug!(session = %self.session, message = other.name(), "ignoring message before hello")
                    }
                },
                Some(TransportEvent::Closed(reason)) => {
                    return Err(TransportError::Closed(reason).into())
                }
                None => return Err(TransportError::Closed("link closed".into()).into()),
            }
        }
    }

    /// Handle a transport event. A closed link or a goodbye is an error.
    pub(crate) async fn receive(&mut self, event: Option<TransportEvent>) -> Result<Inbound> {
        match event {
            Some(TransportEvent::Message(bytes)) => self.handle(&bytes).await,
            Some(TransportEvent::Opened) => Ok(Inbound::Handled),
            Some(TransportEvent::Closed(reason)) => Err(TransportError::Closed(reason).into()),
            None => Err(TransportError::Closed("link closed".into()).into()),
        }
    }

    pub(crate) async fn handle(&mut self, bytes: &[u8]) -> Result<Inbound> {
        let message = match ProtocolMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.session, %err, "discarding undecodable message");
                self.assembler.reset();
                self.send(&ProtocolMessage::ResyncRequest).await?;
                return Ok(Inbound::Handled);
            }
        };
        trace!(session = %self.session, message = message.name(), "received");

        match message {
            ProtocolMessage::Hello(_) => {
                debug!(session = %self.session, "ignoring repeated hello");
            }
            ProtocolMessage::SyncChunk { updates } | ProtocolMessage::Update { updates } => {
                self.apply_frames(&updates).await?
            }
            ProtocolMessage::SnapshotChunk {
                index,
                total,
                bytes,
            } => {
                if let Some(whole) = self.assembler.push(index, total, bytes) {
                    self.apply_snapshot(&whole).await?;
                }
            }
            ProtocolMessage::SyncDone => return Ok(Inbound::SyncDone),
            ProtocolMessage::Ack { state_vector } => {
                self.peer_sv.merge(&state_vector);
                return Ok(Inbound::Acked(state_vector));
            }
            ProtocolMessage::Awareness { updates, removed } => {
                let awareness = self.document.awareness();
                let now = Instant::now();
                for update in &updates {
                    awareness.apply_remote_state(update, now);
                }
                if !removed.is_empty() {
                    awareness.remove(&removed);
                }
            }
            ProtocolMessage::ResyncRequest => {
                info!(session = %self.session, "peer requested full state");
                self.send_snapshot().await?;
            }
            ProtocolMessage::Goodbye { reason } => {
                return Err(TransportError::Closed(reason).into());
            }
        }
        Ok(Inbound::Handled)
    }

    /// Apply a chunk of update frames and acknowledge. A chunk that fails
    /// to decode is discarded whole.
    async fn apply_frames(&mut self, frames: &[Vec<u8>]) -> Result<()> {
        let updates = match decode_all(frames) {
            Ok(updates) => updates,
            Err(err) => {
                warn!(session = %self.session, %err, frames = frames.len(), "discarding corrupt chunk");
                return self.send(&ProtocolMessage::ResyncRequest).await;
            }
        };

        let mut resync = false;
        for update in updates {
            self.peer_sv.observe(&update.id.replica, update.id.clock);
            let id = update.id.clone();
            match self
                .document
                .apply_remote(update, Origin::Remote(self.session.clone()))
            {
                Ok(ApplyResult::ResyncRequired { dropped }) => {
                    warn!(session = %self.session, dropped, "dependency queue overflowed");
                    resync = true;
                }
                Ok(ApplyResult::Queued { missing }) => {
                    debug!(session = %self.session, update = %id, missing = missing.len(), "update waiting for dependencies");
                }
                Ok(_) => {}
                Err(err) => warn!(session = %self.session, update = %id, %err, "rejected remote update"),
            }
        }

        if resync {
            self.send(&ProtocolMessage::ResyncRequest).await?;
        }
        let state_vector = self.document.state_vector();
        self.send(&ProtocolMessage::Ack { state_vector }).await
    }

    async fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let state = match decode_snapshot(bytes) {
            Ok(state) => state,
            Err(err) => {
                warn!(session = %self.session, %err, "discarding corrupt snapshot");
                return self.send(&ProtocolMessage::ResyncRequest).await;
            }
        };
        match self
            .document
            .merge_snapshot(&state, Origin::Remote(self.session.clone()))
        {
            Ok(()) => {
                self.peer_sv.merge(state.state_vector());
                debug!(session = %self.session, "merged peer snapshot");
            }
            Err(err) => warn!(session = %self.session, %err, "rejected peer snapshot"),
        }
        let state_vector = self.document.state_vector();
        self.send(&ProtocolMessage::Ack { state_vector }).await
    }

    /// Send what a peer at `remote` is missing, then `SyncDone`.
    pub(crate) async fn send_diff(
        &mut self,
        remote: &StateVector,
        exclude: &HashSet<OpId>,
    ) -> Result<()> {
        match self.document.diff_for(remote) {
            Diff::Updates(updates) => {
                let updates: Vec<Update> = updates
                    .into_iter()
                    .filter(|u| !exclude.contains(&u.id))
                    .collect();
                debug!(session = %self.session, updates = updates.len(), "sending catch-up diff");
                for chunk in updates.chunks(self.config.chunk_size.max(1)) {
                    let updates = encode_all(chunk)?;
                    self.send(&ProtocolMessage::SyncChunk { updates }).await?;
                }
            }
            Diff::FullState => self.send_snapshot().await?,
        }
        self.send(&ProtocolMessage::SyncDone).await
    }

    pub(crate) async fn send_snapshot(&mut self) -> Result<()> {
        let bytes = encode_snapshot(&self.document.snapshot())?;
        let chunks = snapshot_chunks(&bytes, self.config.snapshot_chunk_bytes);
        debug!(session = %self.session, bytes = bytes.len(), chunks = chunks.len(), "sending full snapshot");
        for chunk in &chunks {
            self.send(chunk).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_updates(&mut self, updates: &[Update]) -> Result<()> {
        for chunk in updates.chunks(self.config.chunk_size.max(1)) {
            let updates = encode_all(chunk)?;
            self.send(&ProtocolMessage::Update { updates }).await?;
        }
        Ok(())
    }

    /// Send one live update unless the peer already has it.
    pub(crate) async fn forward(&mut self, update: &Update) -> Result<()> {
        if self.peer_sv.contains(&update.id) {
            return Ok(());
        }
        self.send_updates(std::slice::from_ref(update)).await
    }

    /// Catch the peer up after missed events.
    pub(crate) async fn resend_since_peer(&mut self) -> Result<()> {
        let remote = self.peer_sv.clone();
        match self.document.diff_for(&remote) {
            Diff::Updates(updates) if updates.is_empty() => Ok(()),
            Diff::Updates(updates) => self.send_updates(&updates).await,
            Diff::FullState => self.send_snapshot().await,
        }
    }

    pub(crate) async fn send_awareness(
        &mut self,
        updates: Vec<AwarenessUpdate>,
        removed: Vec<String>,
    ) -> Result<()> {
        if updates.is_empty() && removed.is_empty() {
            return Ok(());
        }
        self.send(&ProtocolMessage::Awareness { updates, removed })
            .await
    }
}

/// Flushes the offline buffer over a live link.
struct LinkSink<'a, T: Transport> {
    link: &'a mut Link<T>,
    cancel: &'a mut watch::Receiver<bool>,
    ack_timeout: Duration,
}

#[async_trait]
impl<'a, T: Transport> FlushSink for LinkSink<'a, T> {
    fn revalidate(&mut self, update: &Update) -> std::result::Result<bool, DocError> {
        let document = &self.link.document;
        if document.contains(&update.id) {
            return Ok(false);
        }
        match document.apply_remote(update.clone(), Origin::Replay)? {
            ApplyResult::Applied(_) => Ok(true),
            ApplyResult::Duplicate => Ok(false),
            ApplyResult::Queued { .. } | ApplyResult::ResyncRequired { .. } => {
                Err(DocError::MalformedUpdate {
                    update: update.id.clone(),
                    reason: "dependencies missing after catch-up".into(),
                })
            }
        }
    }

    async fn send_batch(&mut self, updates: &[Update]) -> Result<StateVector> {
        self.link.send_updates(updates).await?;
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled(&mut *self.cancel) => return Err(SyncError::Cancelled),
                event = tokio::time::timeout_at(deadline, self.link.next_event()) => {
                    event.map_err(|_| SyncError::Timeout("flush acknowledgement"))?
                }
            };
            if let Inbound::Acked(sv) = self.link.receive(event).await? {
                if updates.iter().any(|u| sv.contains(&u.id)) {
                    return Ok(sv);
                }
            }
        }
    }
}

enum LinkEnd {
    /// The link dropped; reconnect.
    Lost(String),
    /// Closed by the owner or rejected by the peer; stop.
    Closed,
}

/// The client side of one document's sync.
struct ClientSession<C: Connector> {
    connector: C,
    identity: Identity,
    document: DocumentHandle,
    reconciler: OfflineReconciler,
    config: SyncConfig,
    state: watch::Sender<SessionState>,
    cancel: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    events: broadcast::Receiver<DocEvent>,
    awareness_events: broadcast::Receiver<AwarenessEvent>,
    backoff: Backoff,
    /// Last known hub state, kept across links.
    peer_sv: StateVector,
}

impl<C: Connector> ClientSession<C> {
    fn transition(&self, next: SessionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(document_id = %self.document.document_id(), from = %current, to = %next, "ignoring invalid session transition");
            return;
        }
        debug!(document_id = %self.document.document_id(), from = %current, to = %next, "session state");
        self.state.send_replace(next);
    }

    async fn run(mut self) {
        info!(document_id = %self.document.document_id(), client = %self.identity.client_id, "session started");
        while let Some(transport) = self.connect().await {
            match self.run_link(transport).await {
                LinkEnd::Closed => break,
                LinkEnd::Lost(reason) => {
                    warn!(document_id = %self.document.document_id(), %reason, "link lost");
                    self.transition(SessionState::Disconnected);
                    self.stash_unconfirmed().await;
                    if !self.wait_backoff().await {
                        break;
                    }
                    self.transition(SessionState::Reconnecting);
                }
            }
        }

        // Keep whatever was edited but not confirmed for the next run
        while let Ok(event) = self.events.try_recv() {
            self.on_offline_event(Ok(event)).await;
        }
        self.stash_unconfirmed().await;
        self.transition(SessionState::Closed);
        info!(document_id = %self.document.document_id(), pending = self.reconciler.pending_count(), "session closed");
    }

    /// Dial until a transport comes up. `None` once cancelled.
    async fn connect(&mut self) -> Option<C::Transport> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return None,
                attempt = self.connector.connect() => attempt,
            };
            match attempt {
                Ok(transport) => return Some(transport),
                Err(err) => {
                    debug!(document_id = %self.document.document_id(), %err, attempt = self.backoff.attempt(), "connect failed");
                    self.transition(SessionState::Disconnected);
                    if !self.wait_backoff().await {
                        return None;
                    }
                    self.transition(SessionState::Reconnecting);
                }
            }
        }
    }

    /// Sleep out the next backoff delay, buffering local edits meanwhile.
    /// Returns `false` when cancelled.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(document_id = %self.document.document_id(), ?delay, "reconnecting after delay");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return false,
                _ = &mut sleep => return true,
                event = self.events.recv() => self.on_offline_event(event).await,
            }
        }
    }

    async fn run_link(&mut self, transport: C::Transport) -> LinkEnd {
        let session: SessionId = Ulid::new().to_string();
        let mut link = Link::new(
            transport,
            session,
            self.document.clone(),
            self.config.clone(),
            self.peer_sv.clone(),
        );

        let end = match self.drive(&mut link).await {
            Ok(end) => end,
            Err(SyncError::Cancelled) => {
                link.goodbye("session closed").await;
                LinkEnd::Closed
            }
            Err(err) if !err.is_retryable() => {
                error!(document_id = %self.document.document_id(), session = %link.session(), %err, "giving up on session");
                link.goodbye(&err.to_string()).await;
                LinkEnd::Closed
            }
            Err(err) => {
                link.close("link lost").await;
                LinkEnd::Lost(err.to_string())
            }
        };
        self.peer_sv = link.peer_sv.clone();
        end
    }

    async fn drive(&mut self, link: &mut Link<C::Transport>) -> Result<LinkEnd> {
        // Handshaking
        self.transition(SessionState::Handshaking);
        let hello = Hello {
            document_id: self.document.document_id().to_string(),
            protocol_version: PROTOCOL_VERSION,
            client_id: self.identity.client_id.clone(),
            display_name: self.identity.display_name.clone(),
            state_vector: self.document.state_vector(),
        };
        let handshake = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.config.handshake_timeout(), link.exchange_hello(hello)) => {
                result.map_err(|_| SyncError::Timeout("handshake"))??
            }
        };
        let peer = match handshake {
            Handshake::Accepted(peer) => peer,
            Handshake::Rejected(reason) => return Err(SyncError::Protocol(reason)),
        };
        if peer.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "peer speaks protocol {}, expected {}",
                peer.protocol_version, PROTOCOL_VERSION
            )));
        }
        if peer.document_id != self.document.document_id() {
            return Err(SyncError::Protocol(format!(
                "peer answered for document {}",
                peer.document_id
            )));
        }
        link.peer_sv = peer.state_vector;

        // Syncing
        self.transition(SessionState::Syncing);
        let exclude = self.reconciler.pending_ids();
        let remote = link.peer_sv.clone();
        link.send_diff(&remote, &exclude).await?;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => Step::Cancel,
                event = link.next_event() => Step::Transport(event),
                event = self.events.recv() => Step::Doc(event),
            };
            match step {
                Step::Cancel => return Err(SyncError::Cancelled),
                Step::Transport(event) => {
                    if let Inbound::SyncDone = link.receive(event).await? {
                        break;
                    }
                }
                Step::Doc(event) => self.on_offline_event(event).await,
                Step::Awareness(_) | Step::Heartbeat => {}
            }
        }

        // Live
        self.transition(SessionState::Live);
        self.backoff.reset();
        self.flush(link).await?;
        self.announce_presence(link).await?;

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let step = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => Step::Cancel,
                event = link.next_event() => Step::Transport(event),
                event = self.events.recv() => Step::Doc(event),
                event = self.awareness_events.recv() => Step::Awareness(event),
                _ = heartbeat.tick() => Step::Heartbeat,
            };
            match step {
                Step::Cancel => return Err(SyncError::Cancelled),
                Step::Transport(event) => {
                    if let Inbound::Acked(sv) = link.receive(event).await? {
                        if let Err(err) = self.reconciler.acknowledge(&sv).await {
                            warn!(document_id = %self.document.document_id(), %err, "could not trim offline buffer");
                        }
                        self.update_pending(&link.peer_sv);
                    }
                }
                Step::Doc(Ok(DocEvent::Applied {
                    update,
                    origin: Origin::Local,
                })) => {
                    link.forward(&update).await?;
                    self.update_pending(&link.peer_sv);
                }
                Step::Doc(Ok(_)) => {}
                Step::Doc(Err(RecvError::Lagged(skipped))) => {
                    warn!(document_id = %self.document.document_id(), skipped, "document events lagged, resending");
                    link.resend_since_peer().await?;
                }
                Step::Doc(Err(RecvError::Closed)) => return Ok(LinkEnd::Closed),
                Step::Awareness(Ok(AwarenessEvent::Changed { entry, local: true })) => {
                    link.send_awareness(vec![entry.to_update()], Vec::new())
                        .await?
                }
                Step::Awareness(_) => {}
                Step::Heartbeat => self.on_heartbeat(link).await?,
            }
        }
    }

    async fn flush(&mut self, link: &mut Link<C::Transport>) -> Result<()> {
        if self.reconciler.pending_count() > 0 {
            let mut sink = LinkSink {
                link: &mut *link,
                cancel: &mut self.cancel,
                ack_timeout: self.config.ack_timeout(),
            };
            let result = self
                .reconciler
                .flush_on_reconnect(&mut sink, self.config.chunk_size)
                .await;
            match result {
                Ok(_) => {}
                Err(err @ (SyncError::Transport(_) | SyncError::Cancelled)) => return Err(err),
                Err(err) => {
                    warn!(document_id = %self.document.document_id(), %err, pending = self.reconciler.pending_count(), "offline flush incomplete")
                }
            }
        }
        self.update_pending(&link.peer_sv);
        Ok(())
    }

    async fn announce_presence(&mut self, link: &mut Link<C::Transport>) -> Result<()> {
        let awareness = self.document.awareness().clone();
        if awareness.local_state().is_none() {
            // Goes out through the awareness event
            awareness.set_local_state(AwarenessState::for_client(
                &self.identity.client_id,
                self.identity.display_name.clone(),
            ));
            return Ok(());
        }
        match awareness.heartbeat(Instant::now()) {
            Some(update) => link.send_awareness(vec![update], Vec::new()).await,
            None => Ok(()),
        }
    }

    async fn on_heartbeat(&mut self, link: &mut Link<C::Transport>) -> Result<()> {
        let now = Instant::now();
        let awareness = self.document.awareness().clone();
        if let Some(update) = awareness.heartbeat(now) {
            link.send_awareness(vec![update], Vec::new()).await?;
        }
        awareness.remove_stale(now);
        if let Err(err) = self.document.expire_pending(now) {
            warn!(document_id = %self.document.document_id(), %err, "requesting full state");
            link.send(&ProtocolMessage::ResyncRequest).await?;
        }
        Ok(())
    }

    /// Local edits made without a live link go to the offline buffer.
    async fn on_offline_event(&mut self, event: std::result::Result<DocEvent, RecvError>) {
        match event {
            Ok(DocEvent::Applied {
                update,
                origin: Origin::Local,
            }) => {
                if let Err(err) = self.reconciler.buffer_local_update(update).await {
                    warn!(document_id = %self.document.document_id(), %err, "offline buffer write failed");
                }
                self.update_pending(&self.peer_sv);
            }
            Ok(_) | Err(RecvError::Closed) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(document_id = %self.document.document_id(), skipped, "document events lagged while offline");
                self.stash_unconfirmed().await;
            }
        }
    }

    /// Buffer every local update the hub has not confirmed.
    async fn stash_unconfirmed(&mut self) {
        let mut stashed = 0;
        for update in self.document.local_updates_since(&self.peer_sv) {
            match self.reconciler.buffer_local_update(update).await {
                Ok(true) => stashed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(document_id = %self.document.document_id(), %err, "offline buffer write failed")
                }
            }
        }
        if stashed > 0 {
            info!(document_id = %self.document.document_id(), stashed, "moved unconfirmed updates to offline buffer");
        }
        self.update_pending(&self.peer_sv);
    }

    fn update_pending(&self, peer_sv: &StateVector) {
        let unsent = self
            .document
            .local_updates_since(peer_sv)
            .iter()
            .filter(|u| !self.reconciler.contains(&u.id))
            .count();
        let count = self.reconciler.pending_count() + unsent;
        self.pending.store(count, Ordering::SeqCst);
        self.document.set_unconfirmed(count);
    }
}

/// Owner's view of a running client session.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    cancel: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`. Returns `false` on timeout.
    pub async fn wait_for(&self, target: SessionState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(timeout, state.wait_for(|s| *s == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Local updates not yet confirmed by the hub.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop the session and wait for it to wind down. Unconfirmed updates
    /// stay in the offline buffer.
    pub async fn close(&self) {
        let _ = self.cancel.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "session task failed");
            }
        }
    }
}

/// Start syncing `document` through `connector`.
pub(crate) fn spawn_client_session<C: Connector>(
    connector: C,
    identity: Identity,
    document: DocumentHandle,
    reconciler: OfflineReconciler,
    config: SyncConfig,
) -> SessionHandle {
    let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pending = Arc::new(AtomicUsize::new(reconciler.pending_count()));
    let backoff = Backoff::new(
        Duration::from_millis(config.reconnect_base_ms),
        Duration::from_millis(config.reconnect_max_ms),
    );

    let session = ClientSession {
        connector,
        identity,
        events: document.subscribe(),
        awareness_events: document.awareness().subscribe(),
        document,
        reconciler,
        config,
        state: state_tx,
        cancel: cancel_rx,
        pending: Arc::clone(&pending),
        backoff,
        peer_sv: StateVector::new(),
    };
    let task = tokio::spawn(session.run());

    SessionHandle {
        state: state_rx,
        cancel: cancel_tx,
        pending,
        task: Mutex::new(Some(task)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CollabDocument;
    use crate::network::MemoryTransport;
    use quire_doc::{BlockKind, Operation};

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Live));
        assert!(Live.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Handshaking));
        assert!(Live.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Live));
        assert!(!Live.can_transition_to(Syncing));
        assert!(!Disconnected.can_transition_to(Live));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(Live.is_connected());
        assert!(!Reconnecting.is_connected());
    }

    #[tokio::test]
    async fn test_cancelled_on_signal_or_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        cancelled(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        cancelled(&mut rx).await;
    }

    #[test]
    fn test_cancelled_pending_until_signal() {
        let (tx, mut rx) = watch::channel(false);
        let mut fut = tokio_test::task::spawn(cancelled(&mut rx));
        tokio_test::assert_pending!(fut.poll());

        tx.send(false).unwrap();
        tokio_test::assert_pending!(fut.poll());

        tx.send(true).unwrap();
        assert!(fut.is_woken());
        tokio_test::assert_ready!(fut.poll());
    }

    fn document(replica: &str) -> DocumentHandle {
        CollabDocument::new("doc", replica, replica, &SyncConfig::default())
    }

    fn link(
        transport: MemoryTransport,
        document: &DocumentHandle,
    ) -> Link<MemoryTransport> {
        Link::new(
            transport,
            "s".into(),
            document.clone(),
            SyncConfig::builder().chunk_size(2).build(),
            StateVector::new(),
        )
    }

    fn paragraph_with_text(document: &CollabDocument, chars: usize) {
        let block = document
            .apply_local(Operation::InsertBlock {
                after: None,
                kind: BlockKind::Paragraph,
            })
            .unwrap()
            .id;
        for i in 0..chars {
            document
                .apply_local(Operation::InsertText {
                    block: block.clone(),
                    offset: i,
                    text: "x".into(),
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_diff_and_ack_between_links() {
        let a = document("a");
        let b = document("b");
        paragraph_with_text(&a, 4);

        let (ta, tb) = MemoryTransport::pair();
        let mut la = link(ta, &a);
        let mut lb = link(tb, &b);
        assert!(matches!(lb.next_event().await, Some(TransportEvent::Opened)));

        // b claims the block without holding it, so the text has to wait
        let mut remote = StateVector::new();
        remote.observe("a", 1);
        la.send_diff(&remote, &HashSet::new()).await.unwrap();

        // Four updates in chunks of two, then done
        for _ in 0..2 {
            let event = lb.next_event().await;
            assert!(matches!(lb.receive(event).await.unwrap(), Inbound::Handled));
        }
        let event = lb.next_event().await;
        assert!(matches!(lb.receive(event).await.unwrap(), Inbound::SyncDone));
        assert_eq!(b.plain_text(), "");
        assert_eq!(b.pending_len(), 4);
        assert_eq!(lb.peer_sv.get("a"), 5);

        // Every chunk was acknowledged
        assert!(matches!(la.next_event().await, Some(TransportEvent::Opened)));
        for _ in 0..2 {
            let event = la.next_event().await;
            assert!(matches!(la.receive(event).await.unwrap(), Inbound::Acked(_)));
        }
    }

    #[tokio::test]
    async fn test_excluded_updates_not_sent() {
        let a = document("a");
        paragraph_with_text(&a, 2);
        let (ta, mut raw) = MemoryTransport::pair();
        let mut la = link(ta, &a);
        raw.next_event().await;

        let exclude: HashSet<OpId> = [OpId::new("a", 3)].into_iter().collect();
        la.send_diff(&StateVector::from_entries([("a".to_string(), 1)]), &exclude)
            .await
            .unwrap();

        match raw.next_event().await {
            Some(TransportEvent::Message(bytes)) => match ProtocolMessage::decode(&bytes).unwrap() {
                ProtocolMessage::SyncChunk { updates } => {
                    let ids: Vec<_> = decode_all(&updates)
                        .unwrap()
                        .into_iter()
                        .map(|u| u.id)
                        .collect();
                    assert_eq!(ids, vec![OpId::new("a", 2)]);
                }
                other => panic!("unexpected message {}", other.name()),
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_message_requests_resync() {
        let a = document("a");
        let b = document("b");
        a.apply_local(Operation::InsertBlock {
            after: None,
            kind: BlockKind::Heading { level: 1 },
        })
        .unwrap();

        let (ta, mut raw) = MemoryTransport::pair();
        let mut la = link(ta, &a);
        raw.next_event().await;

        let mut garbage = ProtocolMessage::SyncDone.encode().unwrap();
        let last = garbage.len() - 1;
        garbage[last] ^= 0xFF;
        assert!(matches!(la.handle(&garbage).await.unwrap(), Inbound::Handled));
        match raw.next_event().await {
            Some(TransportEvent::Message(bytes)) => assert_eq!(
                ProtocolMessage::decode(&bytes).unwrap(),
                ProtocolMessage::ResyncRequest
            ),
            other => panic!("unexpected event {other:?}"),
        }

        // A resync request is answered with the full snapshot
        let request = ProtocolMessage::ResyncRequest.encode().unwrap();
        la.handle(&request).await.unwrap();
        let mut assembler = SnapshotAssembler::new();
        let mut whole = None;
        while whole.is_none() {
            match raw.next_event().await {
                Some(TransportEvent::Message(bytes)) => {
                    if let ProtocolMessage::SnapshotChunk { index, total, bytes } =
                        ProtocolMessage::decode(&bytes).unwrap()
                    {
                        whole = assembler.push(index, total, bytes);
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let state = decode_snapshot(&whole.unwrap()).unwrap();
        b.merge_snapshot(&state, Origin::Remote("s".into())).unwrap();
        assert_eq!(b.render(), a.render());
    }
}
