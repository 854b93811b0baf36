//! Central session registry.
//!
//! The registry is the one contended structure: fan-out iterates it with a
//! read lease, admission and disconnection mutate it with a write lease.
//! It hands out `Arc<Session>` leases keyed by small integer ids; sessions
//! never hold references to one another.

use std::collections::BTreeMap;
use std::sync::Arc;

use relay_shared::wire::PlayerId;
use tokio::sync::RwLock;

use crate::session::Session;

#[derive(Default)]
pub struct Registry {
    slots: RwLock<BTreeMap<u8, Arc<Session>>>,
}

impl Registry {
    /// Allocates the lowest free id and inserts the session built for it.
    /// Returns `None` when the id space is exhausted.
    pub async fn register<F>(&self, build: F) -> Option<(Arc<Session>, tokio::net::tcp::OwnedReadHalf)>
    where
        F: FnOnce(PlayerId) -> (Session, tokio::net::tcp::OwnedReadHalf),
    {
        let mut slots = self.slots.write().await;
        let mut id = 0u8;
        while slots.contains_key(&id) {
            id = id.checked_add(1)?;
        }
        let (session, reader) = build(PlayerId(id));
        let session = Arc::new(session);
        slots.insert(id, session.clone());
        Some((session, reader))
    }

    pub async fn remove(&self, id: PlayerId) -> Option<Arc<Session>> {
        self.slots.write().await.remove(&id.0)
    }

    pub async fn get(&self, id: PlayerId) -> Option<Arc<Session>> {
        self.slots.read().await.get(&id.0).cloned()
    }

    /// All sessions, in id order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.slots.read().await.values().cloned().collect()
    }

    /// Broadcast-eligible sessions only.
    pub async fn synced(&self) -> Vec<Arc<Session>> {
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.is_synced())
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Current population and how many of them carry the capacity-exempt
    /// development role.
    pub async fn population(&self) -> (usize, usize) {
        let slots = self.slots.read().await;
        let devs = slots.values().filter(|s| s.role() == "MDEV").count();
        (slots.len(), devs)
    }

    pub async fn find_by_token(&self, token: &str) -> Option<Arc<Session>> {
        self.slots
            .read()
            .await
            .values()
            .find(|s| s.token() == token)
            .cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.slots
            .read()
            .await
            .values()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Snapshot for callers off the async runtime (plugin workers).
    pub fn blocking_snapshot(&self) -> Vec<Arc<Session>> {
        self.slots.blocking_read().values().cloned().collect()
    }

    /// Lookup for callers off the async runtime (plugin workers).
    pub fn blocking_get(&self, id: PlayerId) -> Option<Arc<Session>> {
        self.slots.blocking_read().get(&id.0).cloned()
    }
}
