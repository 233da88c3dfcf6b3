//! Ephemeral presence: who is here, where their cursor is, whether they
//! are still around.
//!
//! Each client owns one entry per document and bumps its clock on every
//! change and every heartbeat. Remote entries are last-writer-wins by that
//! clock. Entries that stop hearing heartbeats go stale and are purged;
//! a purged client reappears with its next heartbeat. Nothing here is
//! persisted.

use parking_lot::RwLock;
use quire_doc::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// A cursor or selection inside one block, in visible character offsets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub block: BlockId,
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(block: BlockId, offset: usize) -> Self {
        Self {
            block,
            anchor: offset,
            head: offset,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// What a client shares about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub display_name: String,
    pub color: String,
    pub selection: Option<Selection>,
    pub status: PresenceStatus,
}

impl AwarenessState {
    /// A state named `display_name` with the client's palette colour.
    pub fn for_client(client_id: &str, display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: CursorColors::color_for(client_id).to_string(),
            selection: None,
            status: PresenceStatus::Active,
        }
    }
}

/// One client's entry as seen locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: String,
    pub document_id: String,
    pub state: AwarenessState,
    pub clock: u64,
    pub last_seen: Instant,
}

impl AwarenessEntry {
    pub fn to_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            client_id: self.client_id.clone(),
            document_id: self.document_id.clone(),
            clock: self.clock,
            state: self.state.clone(),
        }
    }
}

/// Wire form of an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: String,
    pub document_id: String,
    pub clock: u64,
    pub state: AwarenessState,
}

#[derive(Clone, Debug)]
pub enum AwarenessEvent {
    Changed { entry: AwarenessEntry, local: bool },
    Removed(Vec<String>),
}

struct Inner {
    entries: HashMap<String, AwarenessEntry>,
}

/// Awareness state of one document.
pub struct Awareness {
    document_id: String,
    local_client: String,
    timeout: Duration,
    inner: RwLock<Inner>,
    event_tx: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    /// `timeout` is the age after which a silent remote entry is stale.
    pub fn new(
        document_id: impl Into<String>,
        local_client: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            document_id: document_id.into(),
            local_client: local_client.into(),
            timeout,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
            }),
            event_tx,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn local_client(&self) -> &str {
        &self.local_client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the local entry's state and bump its clock.
    pub fn set_local_state(&self, state: AwarenessState) -> AwarenessUpdate {
        let entry = {
            let mut inner = self.inner.write();
            let clock = inner
                .entries
                .get(&self.local_client)
                .map_or(1, |e| e.clock + 1);
            let entry = AwarenessEntry {
                client_id: self.local_client.clone(),
                document_id: self.document_id.clone(),
                state,
                clock,
                last_seen: Instant::now(),
            };
            inner.entries.insert(self.local_client.clone(), entry.clone());
            entry
        };
        let update = entry.to_update();
        let _ = self.event_tx.send(AwarenessEvent::Changed { entry, local: true });
        update
    }

    /// Move the local selection, keeping the rest of the state.
    pub fn set_selection(&self, selection: Option<Selection>) -> Option<AwarenessUpdate> {
        let mut state = self.local_state()?;
        state.selection = selection;
        Some(self.set_local_state(state))
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.inner
            .read()
            .entries
            .get(&self.local_client)
            .map(|e| e.state.clone())
    }

    /// Bump the local clock without changing state. Returns the update to
    /// send, or `None` when no local state was ever set.
    pub fn heartbeat(&self, now: Instant) -> Option<AwarenessUpdate> {
        let mut inner = self.inner.write();
        let entry = inner.entries.get_mut(&self.local_client)?;
        entry.clock += 1;
        entry.last_seen = now;
        Some(entry.to_update())
    }

    /// Merge a peer's entry received at `timestamp`. Returns whether its
    /// state changed.
    pub fn apply_remote_state(&self, update: &AwarenessUpdate, timestamp: Instant) -> bool {
        if update.client_id == self.local_client || update.document_id != self.document_id {
            return false;
        }

        let entry = {
            let mut inner = self.inner.write();
            match inner.entries.get_mut(&update.client_id) {
                Some(existing) if update.clock < existing.clock => return false,
                Some(existing) if update.clock == existing.clock => {
                    existing.last_seen = existing.last_seen.max(timestamp);
                    return false;
                }
                _ => {}
            }
            let entry = AwarenessEntry {
                client_id: update.client_id.clone(),
                document_id: update.document_id.clone(),
                state: update.state.clone(),
                clock: update.clock,
                last_seen: timestamp,
            };
            inner.entries.insert(update.client_id.clone(), entry.clone());
            entry
        };
        let _ = self.event_tx.send(AwarenessEvent::Changed {
            entry,
            local: false,
        });
        true
    }

    /// Purge remote entries not heard from within the timeout.
    pub fn remove_stale(&self, now: Instant) -> Vec<String> {
        let removed: Vec<String> = {
            let mut inner = self.inner.write();
            let stale: Vec<String> = inner
                .entries
                .values()
                .filter(|e| e.client_id != self.local_client)
                .filter(|e| now.saturating_duration_since(e.last_seen) > self.timeout)
                .map(|e| e.client_id.clone())
                .collect();
            for id in &stale {
                inner.entries.remove(id);
            }
            stale
        };
        if !removed.is_empty() {
            debug!(document_id = %self.document_id, removed = removed.len(), "purged stale awareness entries");
            let _ = self.event_tx.send(AwarenessEvent::Removed(removed.clone()));
        }
        removed
    }

    /// Drop remote entries right away, e.g. when their session ends.
    pub fn remove(&self, client_ids: &[String]) -> Vec<String> {
        let removed: Vec<String> = {
            let mut inner = self.inner.write();
            client_ids
                .iter()
                .filter(|id| **id != self.local_client)
                .filter(|id| inner.entries.remove(id.as_str()).is_some())
                .cloned()
                .collect()
        };
        if !removed.is_empty() {
            let _ = self.event_tx.send(AwarenessEvent::Removed(removed.clone()));
        }
        removed
    }

    /// Every known entry, local included, ordered by client id.
    pub fn get_states(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<_> = self.inner.read().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        entries
    }

    pub fn get(&self, client_id: &str) -> Option<AwarenessEntry> {
        self.inner.read().entries.get(client_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.event_tx.subscribe()
    }
}

/// Color palette for user cursors.
pub struct CursorColors;

impl CursorColors {
    pub const COLORS: [&'static str; 12] = [
        "#E91E63", // Pink
        "#9C27B0", // Purple
        "#3F51B5", // Indigo
        "#2196F3", // Blue
        "#00BCD4", // Cyan
        "#009688", // Teal
        "#4CAF50", // Green
        "#8BC34A", // Light Green
        "#CDDC39", // Lime
        "#FF9800", // Orange
        "#FF5722", // Deep Orange
        "#795548", // Brown
    ];

    /// Stable colour for a client id.
    pub fn color_for(client_id: &str) -> &'static str {
        let hash: usize = client_id.bytes().map(|b| b as usize).sum();
        Self::COLORS[hash % Self::COLORS.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn remote(client: &str, clock: u64, name: &str) -> AwarenessUpdate {
        AwarenessUpdate {
            client_id: client.into(),
            document_id: "doc".into(),
            clock,
            state: AwarenessState::for_client(client, name),
        }
    }

    #[test]
    fn test_local_state_bumps_clock() {
        let awareness = Awareness::new("doc", "me", TIMEOUT);
        assert!(awareness.heartbeat(Instant::now()).is_none());

        let first = awareness.set_local_state(AwarenessState::for_client("me", "Me"));
        assert_eq!(first.clock, 1);
        let beat = awareness.heartbeat(Instant::now()).unwrap();
        assert_eq!(beat.clock, 2);

        let moved = awareness
            .set_selection(Some(Selection::caret(quire_core::OpId::new("r", 1), 3)))
            .unwrap();
        assert_eq!(moved.clock, 3);
        assert!(moved.state.selection.unwrap().is_caret());
    }

    #[test]
    fn test_remote_last_writer_wins() {
        let awareness = Awareness::new("doc", "me", TIMEOUT);
        let now = Instant::now();

        assert!(awareness.apply_remote_state(&remote("bob", 5, "Bob"), now));
        assert!(!awareness.apply_remote_state(&remote("bob", 3, "Old Bob"), now));
        assert_eq!(awareness.get("bob").unwrap().state.display_name, "Bob");

        assert!(awareness.apply_remote_state(&remote("bob", 6, "Robert"), now));
        assert_eq!(awareness.get("bob").unwrap().state.display_name, "Robert");
    }

    #[test]
    fn test_own_and_foreign_document_entries_ignored() {
        let awareness = Awareness::new("doc", "me", TIMEOUT);
        assert!(!awareness.apply_remote_state(&remote("me", 9, "Impostor"), Instant::now()));

        let mut other_doc = remote("bob", 1, "Bob");
        other_doc.document_id = "elsewhere".into();
        assert!(!awareness.apply_remote_state(&other_doc, Instant::now()));
        assert!(awareness.get_states().is_empty());
    }

    #[test]
    fn test_stale_entries_expire_and_reappear() {
        let awareness = Awareness::new("doc", "me", TIMEOUT);
        awareness.set_local_state(AwarenessState::for_client("me", "Me"));
        let start = Instant::now();
        awareness.apply_remote_state(&remote("bob", 1, "Bob"), start);

        // Same clock only refreshes liveness
        awareness.apply_remote_state(&remote("bob", 1, "Bob"), start + Duration::from_secs(10));
        assert!(awareness.remove_stale(start + Duration::from_secs(20)).is_empty());

        let removed = awareness.remove_stale(start + Duration::from_secs(26));
        assert_eq!(removed, vec!["bob".to_string()]);
        assert!(awareness.get("bob").is_none());
        // Local entry survives any amount of silence
        assert!(awareness.get("me").is_some());

        // Next heartbeat brings bob back
        let later = start + Duration::from_secs(30);
        assert!(awareness.apply_remote_state(&remote("bob", 2, "Bob"), later));
        assert_eq!(awareness.get_states().len(), 2);
    }

    #[test]
    fn test_events() {
        let awareness = Awareness::new("doc", "me", TIMEOUT);
        let mut events = awareness.subscribe();

        awareness.set_local_state(AwarenessState::for_client("me", "Me"));
        awareness.apply_remote_state(&remote("bob", 1, "Bob"), Instant::now());
        awareness.remove(&["bob".to_string(), "me".to_string()]);

        assert!(matches!(events.try_recv().unwrap(), AwarenessEvent::Changed { local: true, .. }));
        assert!(matches!(events.try_recv().unwrap(), AwarenessEvent::Changed { local: false, .. }));
        match events.try_recv().unwrap() {
            AwarenessEvent::Removed(ids) => assert_eq!(ids, vec!["bob".to_string()]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_color_assignment() {
        let color = CursorColors::color_for("client-1");
        assert!(CursorColors::COLORS.contains(&color));
        assert_eq!(color, CursorColors::color_for("client-1"));
    }
}
