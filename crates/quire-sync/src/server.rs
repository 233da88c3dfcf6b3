//! The hub: answers sessions, relays updates and awareness between the
//! sessions of a document, and keeps documents persisted.

use crate::awareness::AwarenessEvent;
use crate::config::SyncConfig;
use crate::document::{DocEvent, DocumentHandle, Origin};
use crate::error::{Result, SyncError};
use crate::network::{Listener, Transport, TransportError, TransportEvent};
use crate::persistence::Persistence;
use crate::protocol::{Hello, ProtocolMessage, PROTOCOL_VERSION};
use crate::registry::DocumentRegistry;
use crate::session::{cancelled, Link, Step};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// What one maintenance round did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub persisted: usize,
    pub evicted: Vec<String>,
    pub stale_clients: usize,
    /// Documents whose queued updates timed out; their sessions were asked
    /// for a full state.
    pub expired: usize,
}

pub struct Hub<P: Persistence> {
    hub_id: String,
    registry: DocumentRegistry<P>,
    config: SyncConfig,
    shutdown: watch::Sender<bool>,
}

impl<P: Persistence> Hub<P> {
    pub fn new(hub_id: impl Into<String>, persistence: Arc<P>, config: SyncConfig) -> Arc<Self> {
        let hub_id = hub_id.into();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            registry: DocumentRegistry::new(hub_id.clone(), persistence, config.clone()),
            hub_id,
            config,
            shutdown,
        })
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    pub fn registry(&self) -> &DocumentRegistry<P> {
        &self.registry
    }

    /// Answer one session until the peer leaves or the hub shuts down.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<()> {
        let peer = match tokio::time::timeout(
            self.config.handshake_timeout(),
            read_hello(&mut transport),
        )
        .await
        {
            Ok(peer) => peer?,
            Err(_) => {
                transport.close("handshake timeout").await;
                return Err(SyncError::Timeout("handshake"));
            }
        };

        if peer.protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "unsupported protocol version {} (hub speaks {})",
                peer.protocol_version, PROTOCOL_VERSION
            );
            warn!(client = %peer.client_id, %reason, "rejecting session");
            reject(&mut transport, &reason).await;
            return Err(SyncError::Protocol(reason));
        }

        let document = self.registry.open(&peer.document_id).await?;
        self.registry.attach(&peer.document_id);
        let session = Ulid::new().to_string();
        info!(
            document_id = %peer.document_id,
            %session,
            client = %peer.client_id,
            name = %peer.display_name,
            "session opened"
        );

        let result = self
            .run_session(transport, session.clone(), &peer, document.clone())
            .await;

        self.registry.detach(&peer.document_id, Instant::now());
        document.awareness().remove(&[peer.client_id.clone()]);
        match &result {
            Ok(()) => info!(document_id = %peer.document_id, %session, "session ended"),
            Err(err) => warn!(document_id = %peer.document_id, %session, %err, "session failed"),
        }
        result
    }

    async fn run_session<T: Transport>(
        &self,
        transport: T,
        session: String,
        peer: &Hello,
        document: DocumentHandle,
    ) -> Result<()> {
        // Subscribe before the diff so nothing applied meanwhile is missed
        let mut doc_events = document.subscribe();
        let mut awareness_events = document.awareness().subscribe();
        let mut shutdown = self.shutdown.subscribe();

        let mut link = Link::new(
            transport,
            session.clone(),
            document.clone(),
            self.config.clone(),
            peer.state_vector.clone(),
        );
        link.send(&ProtocolMessage::Hello(Hello {
            document_id: document.document_id().to_string(),
            protocol_version: PROTOCOL_VERSION,
            client_id: self.hub_id.clone(),
            display_name: self.hub_id.clone(),
            state_vector: document.state_vector(),
        }))
        .await?;

        let present = document
            .awareness()
            .get_states()
            .into_iter()
            .filter(|e| e.client_id != peer.client_id)
            .map(|e| e.to_update())
            .collect();
        link.send_awareness(present, Vec::new()).await?;
        link.send_diff(&peer.state_vector, &HashSet::new()).await?;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => Step::Cancel,
                event = link.next_event() => Step::Transport(event),
                event = doc_events.recv() => Step::Doc(event),
                event = awareness_events.recv() => Step::Awareness(event),
            };
            match step {
                Step::Cancel => {
                    link.goodbye("hub shutting down").await;
                    return Ok(());
                }
                Step::Transport(event) => match link.receive(event).await {
                    Ok(_) => {}
                    Err(SyncError::Transport(err)) => {
                        debug!(%session, %err, "peer left");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                },
                Step::Doc(Ok(DocEvent::Applied { update, origin })) => {
                    if !is_own(&origin, &session) {
                        link.forward(&update).await?;
                    }
                }
                Step::Doc(Ok(DocEvent::Reset { origin })) => {
                    if !is_own(&origin, &session) {
                        link.resend_since_peer().await?;
                    }
                }
                Step::Doc(Ok(DocEvent::DependencyTimeout { update })) => {
                    debug!(%session, %update, "requesting full state after dependency timeout");
                    link.send(&ProtocolMessage::ResyncRequest).await?;
                }
                Step::Doc(Err(RecvError::Lagged(skipped))) => {
                    warn!(%session, skipped, "document events lagged, resending");
                    link.resend_since_peer().await?;
                }
                Step::Doc(Err(RecvError::Closed)) => return Ok(()),
                Step::Awareness(Ok(AwarenessEvent::Changed { entry, .. })) => {
                    if entry.client_id != peer.client_id {
                        link.send_awareness(vec![entry.to_update()], Vec::new())
                            .await?;
                    }
                }
                Step::Awareness(Ok(AwarenessEvent::Removed(ids))) => {
                    link.send_awareness(Vec::new(), ids).await?;
                }
                Step::Awareness(Err(_)) | Step::Heartbeat => {}
            }
        }
    }

    /// Accept links until the listener ends or the hub shuts down.
    pub fn spawn_listener<L: Listener>(self: &Arc<Self>, mut listener: L) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = hub.shutdown.subscribe();
            loop {
                let transport = tokio::select! {
                    biased;
                    _ = cancelled(&mut shutdown) => break,
                    transport = listener.accept() => match transport {
                        Some(transport) => transport,
                        None => break,
                    },
                };
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    let _ = hub.serve(transport).await;
                });
            }
            debug!(hub = %hub.hub_id, "listener stopped");
        })
    }

    /// Expire stuck queued updates, persist dirty documents, evict idle
    /// ones and purge stale awareness.
    pub async fn maintenance_tick(&self, now: Instant) -> MaintenanceReport {
        let expired = self
            .registry
            .documents()
            .iter()
            .filter(|d| d.expire_pending(now).is_err())
            .count();
        let persisted = self.registry.persist_dirty().await;
        let evicted = self.registry.evict_idle(now).await;
        let stale_clients = self
            .registry
            .documents()
            .iter()
            .map(|d| d.awareness().remove_stale(now).len())
            .sum();
        if persisted > 0 || !evicted.is_empty() || stale_clients > 0 || expired > 0 {
            debug!(hub = %self.hub_id, persisted, evicted = evicted.len(), stale_clients, expired, "maintenance");
        }
        MaintenanceReport {
            persisted,
            evicted,
            stale_clients,
            expired,
        }
    }

    /// Run maintenance every persist interval. A last persist runs on
    /// shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = hub.shutdown.subscribe();
            let period = hub.config.persist_interval();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        hub.maintenance_tick(Instant::now()).await;
                    }
                }
            }
            let saved = hub.registry.persist_dirty().await;
            info!(hub = %hub.hub_id, saved, "final persist on shutdown");
        })
    }

    /// Ask every session, the listener and maintenance to stop.
    pub fn shutdown(&self) {
        info!(hub = %self.hub_id, "shutting down");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn is_own(origin: &Origin, session: &str) -> bool {
    matches!(origin, Origin::Remote(s) if s == session)
}

async fn read_hello<T: Transport>(transport: &mut T) -> Result<Hello> {
    loop {
        match transport.next_event().await {
            Some(TransportEvent::Opened) => {}
            Some(TransportEvent::Message(bytes)) => {
                return match ProtocolMessage::decode(&bytes)? {
                    ProtocolMessage::Hello(hello) => Ok(hello),
                    other => Err(SyncError::Protocol(format!(
                        "expected hello, got {}",
                        other.name()
                    ))),
                };
            }
            Some(TransportEvent::Closed(reason)) => {
                return Err(TransportError::Closed(reason).into())
            }
            None => return Err(TransportError::Closed("link closed".into()).into()),
        }
    }
}

async fn reject<T: Transport>(transport: &mut T, reason: &str) {
    let goodbye = ProtocolMessage::Goodbye {
        reason: reason.to_string(),
    };
    if let Ok(bytes) = goodbye.encode() {
        let _ = transport.send(bytes).await;
    }
    transport.close(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;
    use crate::persistence::MemoryStore;
    use quire_core::StateVector;

    fn hello(version: u16) -> ProtocolMessage {
        ProtocolMessage::Hello(Hello {
            document_id: "doc".into(),
            protocol_version: version,
            client_id: "c1".into(),
            display_name: "Alice".into(),
            state_vector: StateVector::new(),
        })
    }

    async fn next_message(transport: &mut MemoryTransport) -> ProtocolMessage {
        loop {
            match transport.next_event().await {
                Some(TransportEvent::Message(bytes)) => {
                    return ProtocolMessage::decode(&bytes).unwrap()
                }
                Some(TransportEvent::Opened) => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let hub = Hub::new("hub", Arc::new(MemoryStore::new()), SyncConfig::default());
        let (mut client, server) = MemoryTransport::pair();
        client.send(hello(99).encode().unwrap()).await.unwrap();

        let err = hub.serve(server).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(matches!(
            next_message(&mut client).await,
            ProtocolMessage::Goodbye { .. }
        ));
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_then_shutdown() {
        let hub = Hub::new("hub", Arc::new(MemoryStore::new()), SyncConfig::default());
        let (mut client, server) = MemoryTransport::pair();
        client.send(hello(PROTOCOL_VERSION).encode().unwrap()).await.unwrap();

        let serving = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.serve(server).await })
        };

        match next_message(&mut client).await {
            ProtocolMessage::Hello(reply) => {
                assert_eq!(reply.document_id, "doc");
                assert_eq!(reply.client_id, "hub");
            }
            other => panic!("unexpected message {}", other.name()),
        }
        // The new document has nothing to send
        assert_eq!(next_message(&mut client).await, ProtocolMessage::SyncDone);
        assert_eq!(hub.registry().connections("doc"), 1);

        hub.shutdown();
        assert!(matches!(
            next_message(&mut client).await,
            ProtocolMessage::Goodbye { .. }
        ));
        serving.await.unwrap().unwrap();
        assert_eq!(hub.registry().connections("doc"), 0);
    }

    #[tokio::test]
    async fn test_maintenance_expires_stuck_updates_and_requests_resync() {
        let config = SyncConfig::builder().dependency_timeout(10).build();
        let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config);
        let (mut client, server) = MemoryTransport::pair();
        client.send(hello(PROTOCOL_VERSION).encode().unwrap()).await.unwrap();
        let serving = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.serve(server).await })
        };
        assert!(matches!(next_message(&mut client).await, ProtocolMessage::Hello(_)));
        assert_eq!(next_message(&mut client).await, ProtocolMessage::SyncDone);

        // Text whose block never arrives
        let mut other = quire_doc::DocumentEngine::new("doc", "x");
        let block = other
            .apply_local(quire_doc::Operation::InsertBlock {
                after: None,
                kind: quire_doc::BlockKind::Paragraph,
            })
            .unwrap();
        let text = other
            .apply_local(quire_doc::Operation::InsertText {
                block: block.id.clone(),
                offset: 0,
                text: "lost".into(),
            })
            .unwrap();
        let document = hub.registry().get("doc").unwrap();
        assert!(matches!(
            document
                .apply_remote(text, Origin::Remote("elsewhere".into()))
                .unwrap(),
            quire_doc::ApplyResult::Queued { .. }
        ));
        assert_eq!(document.pending_len(), 1);

        let report = hub
            .maintenance_tick(Instant::now() + std::time::Duration::from_secs(3600))
            .await;
        assert_eq!(report.expired, 1);
        assert_eq!(document.pending_len(), 0);
        assert_eq!(
            next_message(&mut client).await,
            ProtocolMessage::ResyncRequest
        );

        // Nothing left to expire
        let report = hub.maintenance_tick(Instant::now()).await;
        assert_eq!(report.expired, 0);

        hub.shutdown();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_persists_dirty_documents() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new("hub", store.clone(), SyncConfig::default());
        let document = hub.registry().open("doc").await.unwrap();
        document
            .apply_local(quire_doc::Operation::InsertBlock {
                after: None,
                kind: quire_doc::BlockKind::Quote,
            })
            .unwrap();

        let report = hub.maintenance_tick(Instant::now()).await;
        assert_eq!(report.persisted, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(
            store.stored_state_vector("doc"),
            Some(document.state_vector())
        );
    }
}
