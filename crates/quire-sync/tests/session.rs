//! End-to-end sessions between clients and a hub over the memory network.

use quire_core::OpId;
use quire_doc::{BlockKind, Operation};
use quire_sync::{
    memory_network, BufferKey, Client, ClientDocument, Hub, Identity, Listener, MemoryConnector,
    MemoryStore, ProtocolMessage, Selection, SessionState, StaticIdentity, SyncConfig, Transport,
    TransportEvent, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> SyncConfig {
    SyncConfig::builder()
        .chunk_size(8)
        .heartbeat_interval(50)
        .missed_heartbeats(3)
        .handshake_timeout(1000)
        .ack_timeout(1000)
        .reconnect(10, 40)
        .persist_interval(50)
        .build()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Harness {
    hub: Arc<Hub<MemoryStore>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            hub: Hub::new("hub", Arc::new(MemoryStore::new()), config()),
        }
    }

    /// A private network from one client to the hub.
    fn network(&self) -> MemoryConnector {
        let (connector, listener) = memory_network();
        self.hub.spawn_listener(listener);
        connector
    }

    fn hub_text(&self, document_id: &str) -> Option<String> {
        self.hub
            .registry()
            .get(document_id)
            .map(|d| d.plain_text())
    }
}

fn client(
    connector: MemoryConnector,
    identity: Identity,
    store: Arc<MemoryStore>,
) -> Client<MemoryConnector, StaticIdentity> {
    Client::new(connector, StaticIdentity(identity), store, config())
}

async fn open_live(client: &Client<MemoryConnector, StaticIdentity>) -> ClientDocument {
    let document = client.open_document("doc").await.unwrap();
    assert!(
        document.session().wait_for(SessionState::Live, WAIT).await,
        "session never went live"
    );
    document
}

fn new_block(document: &ClientDocument) -> OpId {
    document
        .edit(Operation::InsertBlock {
            after: None,
            kind: BlockKind::Paragraph,
        })
        .unwrap()
        .id
}

fn type_text(document: &ClientDocument, block: &OpId, offset: usize, text: &str) {
    document
        .edit(Operation::InsertText {
            block: block.clone(),
            offset,
            text: text.into(),
        })
        .unwrap();
}

#[tokio::test]
async fn test_two_clients_converge_through_hub() {
    let harness = Harness::new();
    let alice = client(harness.network(), Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let bob = client(harness.network(), Identity::new("Bob"), Arc::new(MemoryStore::new()));
    let alice_doc = open_live(&alice).await;
    let bob_doc = open_live(&bob).await;

    let block = new_block(&alice_doc);
    type_text(&alice_doc, &block, 0, "Hello");
    wait_until("bob to see alice's text", || {
        bob_doc.document().plain_text() == "Hello"
    })
    .await;

    type_text(&bob_doc, &block, 5, " world");
    wait_until("alice to see bob's text", || {
        alice_doc.document().plain_text() == "Hello world"
    })
    .await;

    wait_until("everything confirmed", || {
        alice_doc.pending_count() == 0 && bob_doc.pending_count() == 0
    })
    .await;
    assert_eq!(harness.hub_text("doc").as_deref(), Some("Hello world"));
    assert_eq!(alice_doc.document().render(), bob_doc.document().render());
    assert!(alice_doc.document().sync_status().borrow().is_synced());

    alice_doc.close().await;
    bob_doc.close().await;
    assert_eq!(alice_doc.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let harness = Harness::new();
    let alice = client(harness.network(), Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let alice_doc = open_live(&alice).await;

    let block = new_block(&alice_doc);
    for i in 0..40 {
        type_text(&alice_doc, &block, i, "a");
    }
    wait_until("hub to receive alice's edits", || {
        harness.hub_text("doc").map_or(0, |t| t.len()) == 40
    })
    .await;

    let bob = client(harness.network(), Identity::new("Bob"), Arc::new(MemoryStore::new()));
    let bob_doc = open_live(&bob).await;
    assert_eq!(bob_doc.document().plain_text(), "a".repeat(40));
    assert_eq!(
        bob_doc.document().state_vector(),
        alice_doc.document().state_vector()
    );
}

#[tokio::test]
async fn test_offline_edits_replayed_on_reconnect() {
    let harness = Harness::new();
    let alice_net = harness.network();
    let alice = client(alice_net.clone(), Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let bob = client(harness.network(), Identity::new("Bob"), Arc::new(MemoryStore::new()));
    let alice_doc = open_live(&alice).await;
    let bob_doc = open_live(&bob).await;

    let block = new_block(&alice_doc);
    wait_until("bob to see the block", || {
        bob_doc.document().render().blocks.len() == 1
    })
    .await;
    wait_until("the block to be confirmed", || alice_doc.pending_count() == 0).await;

    alice_net.set_online(false);
    wait_until("alice to notice", || alice_doc.state() != SessionState::Live).await;

    // Concurrent edits on both sides of the partition
    type_text(&alice_doc, &block, 0, "abc");
    type_text(&bob_doc, &block, 0, "xyz");
    wait_until("alice's edit to be buffered", || alice_doc.pending_count() == 1).await;
    wait_until("hub to receive bob's edit", || {
        harness.hub_text("doc").as_deref() == Some("xyz")
    })
    .await;

    alice_net.set_online(true);
    wait_until("alice to flush", || {
        alice_doc.state() == SessionState::Live && alice_doc.pending_count() == 0
    })
    .await;
    wait_until("all replicas to agree", || {
        let text = alice_doc.document().plain_text();
        text.len() == 6
            && bob_doc.document().plain_text() == text
            && harness.hub_text("doc").as_deref() == Some(text.as_str())
    })
    .await;

    let text = alice_doc.document().plain_text();
    assert!(text.contains("abc") && text.contains("xyz"));
}

#[tokio::test]
async fn test_severed_link_reconnects() {
    let harness = Harness::new();
    let net = harness.network();
    let alice = client(net.clone(), Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let alice_doc = open_live(&alice).await;
    let block = new_block(&alice_doc);

    net.sever_all("flaky wifi");
    type_text(&alice_doc, &block, 0, "still here");

    wait_until("hub to get the edit after reconnecting", || {
        harness.hub_text("doc").as_deref() == Some("still here")
    })
    .await;
    wait_until("nothing pending", || alice_doc.pending_count() == 0).await;
    assert_eq!(alice_doc.state(), SessionState::Live);
}

#[tokio::test]
async fn test_restarted_client_flushes_buffer() {
    let harness = Harness::new();
    let net = harness.network();
    let store = Arc::new(MemoryStore::new());
    let identity = Identity::with_client_id("alice-laptop", "Alice");

    net.set_online(false);
    let first = client(net.clone(), identity.clone(), store.clone());
    let doc = first.open_document("doc").await.unwrap();
    let block = new_block(&doc);
    type_text(&doc, &block, 0, "written offline");
    wait_until("both edits buffered", || doc.pending_count() == 2).await;
    doc.close().await;
    assert_eq!(store.pending_len(&BufferKey::new("doc", "alice-laptop")), 2);
    assert!(harness.hub_text("doc").is_none());

    // Next run, same user and storage, network back
    net.set_online(true);
    let second = client(net, identity, store.clone());
    let doc = open_live(&second).await;
    wait_until("buffer flushed", || doc.pending_count() == 0).await;

    assert_eq!(doc.document().plain_text(), "written offline");
    assert_eq!(harness.hub_text("doc").as_deref(), Some("written offline"));
    assert_eq!(store.pending_len(&BufferKey::new("doc", "alice-laptop")), 0);
}

#[tokio::test]
async fn test_awareness_relayed_and_removed() {
    let harness = Harness::new();
    let alice = client(harness.network(), Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let bob = client(harness.network(), Identity::new("Bob"), Arc::new(MemoryStore::new()));
    let alice_doc = open_live(&alice).await;
    let bob_doc = open_live(&bob).await;
    let alice_id = alice_doc.identity().client_id.clone();

    wait_until("bob to see alice", || {
        bob_doc.document().awareness().get(&alice_id).is_some()
    })
    .await;
    let seen = bob_doc.document().awareness().get(&alice_id).unwrap();
    assert_eq!(seen.state.display_name, "Alice");

    let block = new_block(&alice_doc);
    alice_doc
        .document()
        .awareness()
        .set_selection(Some(Selection::caret(block.clone(), 0)))
        .unwrap();
    wait_until("bob to see alice's cursor", || {
        bob_doc
            .document()
            .awareness()
            .get(&alice_id)
            .and_then(|e| e.state.selection)
            .is_some_and(|s| s.block == block)
    })
    .await;

    alice_doc.close().await;
    wait_until("alice to disappear for bob", || {
        bob_doc.document().awareness().get(&alice_id).is_none()
    })
    .await;
}

#[tokio::test]
async fn test_protocol_mismatch_closes_session() {
    let (connector, mut listener) = memory_network();
    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        while let Some(event) = transport.next_event().await {
            if let TransportEvent::Message(bytes) = event {
                let ProtocolMessage::Hello(mut hello) = ProtocolMessage::decode(&bytes).unwrap()
                else {
                    continue;
                };
                hello.protocol_version = PROTOCOL_VERSION + 1;
                let reply = ProtocolMessage::Hello(hello).encode().unwrap();
                transport.send(reply).await.unwrap();
            }
        }
    });

    let alice = client(connector, Identity::new("Alice"), Arc::new(MemoryStore::new()));
    let doc = alice.open_document("doc").await.unwrap();
    assert!(doc.session().wait_for(SessionState::Closed, WAIT).await);
}

#[tokio::test]
async fn test_zero_heartbeat_still_delivers_edits() {
    let config = SyncConfig::builder().heartbeat_interval(0).build();
    let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config.clone());
    let (connector, listener) = memory_network();
    hub.spawn_listener(listener);

    let alice = Client::new(
        connector,
        StaticIdentity(Identity::new("Alice")),
        Arc::new(MemoryStore::new()),
        config,
    );
    let doc = open_live(&alice).await;
    let block = new_block(&doc);
    type_text(&doc, &block, 0, "ping");

    wait_until("hub to receive the edit", || {
        hub.registry().get("doc").map(|d| d.plain_text()).as_deref() == Some("ping")
    })
    .await;
    assert_eq!(doc.state(), SessionState::Live);
    doc.close().await;
}

#[tokio::test]
async fn test_restarted_client_starts_empty_until_caught_up() {
    let harness = Harness::new();
    let net = harness.network();
    let store = Arc::new(MemoryStore::new());
    let identity = Identity::with_client_id("bob-tablet", "Bob");

    net.set_online(false);
    let first = client(net.clone(), identity.clone(), store.clone());
    let doc = first.open_document("doc").await.unwrap();
    new_block(&doc);
    wait_until("edit buffered", || doc.pending_count() == 1).await;
    doc.close().await;

    // Still offline: the reopened document is empty, the buffer is not
    let second = client(net.clone(), identity, store.clone());
    let doc = second.open_document("doc").await.unwrap();
    assert!(doc.document().render().blocks.is_empty());
    wait_until("buffer reported", || doc.pending_count() == 1).await;
    assert!(doc.document().render().blocks.is_empty());

    net.set_online(true);
    wait_until("buffered block visible after catch-up", || {
        doc.pending_count() == 0 && doc.document().render().blocks.len() == 1
    })
    .await;
    doc.close().await;
}
