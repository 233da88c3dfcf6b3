//! Transport abstractions and an in-memory implementation.
//!
//! A [`Transport`] is one bidirectional, ordered byte-message link. A
//! [`Connector`] dials new links on the client side, a [`Listener`] accepts
//! them on the hub side. The memory versions connect a client and a hub in
//! the same process and can be switched offline or severed at will.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Something that happened on a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(Vec<u8>),
    Closed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("link closed: {0}")]
    Closed(String),
}

/// A bidirectional message link.
///
/// `next_event` must be cancel safe: dropping the future before it completes
/// loses no message.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// `None` once the link has closed and the close was reported.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    async fn close(&mut self, reason: &str);
}

/// Dials links to the hub.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn connect(&self) -> Result<Self::Transport, TransportError>;
}

/// Accepts links from clients.
#[async_trait]
pub trait Listener: Send + 'static {
    type Transport: Transport;

    /// `None` when no more links will arrive.
    async fn accept(&mut self) -> Option<Self::Transport>;
}

/// Shared close flag of one memory link.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    closed: Arc<watch::Sender<Option<String>>>,
}

impl LinkHandle {
    /// Close both ends. The first reason wins.
    pub fn sever(&self, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
    }

    pub fn is_severed(&self) -> bool {
        self.closed.borrow().is_some()
    }
}

/// One end of an in-memory link.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: LinkHandle,
    closed_rx: watch::Receiver<Option<String>>,
    opened: bool,
    finished: bool,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (closed, _) = watch::channel(None);
        let link = LinkHandle {
            closed: Arc::new(closed),
        };
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let end = |tx, rx| MemoryTransport {
            tx,
            rx,
            closed_rx: link.closed.subscribe(),
            link: link.clone(),
            opened: false,
            finished: false,
        };
        (end(a_tx, a_rx), end(b_tx, b_rx))
    }

    pub fn link(&self) -> LinkHandle {
        self.link.clone()
    }

    fn finish(&mut self, reason: String) -> Option<TransportEvent> {
        self.finished = true;
        Some(TransportEvent::Closed(reason))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if let Some(reason) = self.closed_rx.borrow().clone() {
            return Err(TransportError::Closed(reason));
        }
        self.tx
            .send(bytes)
            .map_err(|_| TransportError::Closed("peer dropped".into()))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if !self.opened {
            self.opened = true;
            return Some(TransportEvent::Opened);
        }
        if self.finished {
            return None;
        }
        let severed = self.closed_rx.borrow().clone();
        if let Some(reason) = severed {
            return self.finish(reason);
        }

        tokio::select! {
            biased;
            changed = self.closed_rx.changed() => {
                let reason = match changed {
                    Ok(()) => self.closed_rx.borrow().clone(),
                    Err(_) => None,
                };
                self.finish(reason.unwrap_or_else(|| "link dropped".into()))
            }
            message = self.rx.recv() => match message {
                Some(bytes) => Some(TransportEvent::Message(bytes)),
                None => self.finish("peer dropped".into()),
            },
        }
    }

    async fn close(&mut self, reason: &str) {
        self.link.sever(reason);
    }
}

struct ConnectorShared {
    online: AtomicBool,
    accept_tx: mpsc::UnboundedSender<MemoryTransport>,
    links: Mutex<Vec<LinkHandle>>,
}

/// Client side of an in-memory network.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<ConnectorShared>,
}

impl MemoryConnector {
    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    /// Going offline severs every open link and refuses new ones.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
        if !online {
            self.sever_all("network offline");
        }
    }

    /// Drop every open link without going offline.
    pub fn sever_all(&self, reason: &str) {
        let mut links = self.shared.links.lock();
        for link in links.drain(..) {
            link.sever(reason);
        }
    }

    pub fn open_links(&self) -> usize {
        let mut links = self.shared.links.lock();
        links.retain(|l| !l.is_severed());
        links.len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(&self) -> Result<MemoryTransport, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Refused("network offline".into()));
        }
        let (client, server) = MemoryTransport::pair();
        let link = client.link();
        self.shared
            .accept_tx
            .send(server)
            .map_err(|_| TransportError::Refused("no listener".into()))?;

        let mut links = self.shared.links.lock();
        links.retain(|l| !l.is_severed());
        links.push(link);
        Ok(client)
    }
}

/// Hub side of an in-memory network.
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<MemoryTransport>,
}

#[async_trait]
impl Listener for MemoryListener {
    type Transport = MemoryTransport;

    async fn accept(&mut self) -> Option<MemoryTransport> {
        self.rx.recv().await
    }
}

/// A connector/listener pair wired to each other, initially online.
pub fn memory_network() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        shared: Arc::new(ConnectorShared {
            online: AtomicBool::new(true),
            accept_tx,
            links: Mutex::new(Vec::new()),
        }),
    };
    (connector, MemoryListener { rx })
}
