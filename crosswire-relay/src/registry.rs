//! Channel registry: the single source of truth for "does this channel
//! exist".
//!
//! Maps channel identifiers to live channel state. Entries are created
//! lazily on first resolve and removed when their channel disposes; the
//! check-or-create step holds the registry write lock so two connections
//! racing on the same identifier always end up on the same channel.
//!
//! One registry instance exists per topology keyspace. Registries are
//! plain owned values inside the server state — no globals — so tests can
//! run any number of independent registries in one process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// A channel type the registry can own.
pub trait ChannelKind: Send + Sync + 'static {
    /// Registry-wide settings applied to every channel it creates.
    type Settings: Clone + Send + Sync + 'static;

    /// Creates an empty channel for `id`.
    fn open(id: &str, settings: &Self::Settings) -> Self;

    /// Whether the channel currently holds no participants.
    fn is_vacant(&self) -> bool;
}

/// In-memory directory of live channels for one topology keyspace.
pub struct ChannelRegistry<C: ChannelKind> {
    settings: C::Settings,
    channels: RwLock<HashMap<String, Arc<C>>>,
}

impl<C: ChannelKind> ChannelRegistry<C> {
    /// Creates an empty registry whose channels are built with `settings`.
    #[must_use]
    pub fn new(settings: C::Settings) -> Self {
        Self {
            settings,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the channel for `id`, creating it on first reference.
    ///
    /// Never fails; check-or-create is one atomic step under the registry
    /// write lock.
    pub async fn resolve(&self, id: &str) -> Arc<C> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(C::open(id, &self.settings)));
        Arc::clone(channel)
    }

    /// Deletes the entry for `id` if present; idempotent.
    pub async fn remove(&self, id: &str) -> bool {
        let mut channels = self.channels.write().await;
        channels.remove(id).is_some()
    }

    /// Deletes the entry for `id` only if its channel is vacant.
    ///
    /// The vacancy check runs under the registry write lock, so a
    /// concurrent join between "last member left" and "remove the entry"
    /// keeps the entry alive.
    pub async fn remove_if_vacant(&self, id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if channels.get(id).is_some_and(|c| c.is_vacant()) {
            channels.remove(id);
            return true;
        }
        false
    }

    /// Whether an entry exists for `id`.
    pub async fn contains(&self, id: &str) -> bool {
        self.channels.read().await.contains_key(id)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Whether the registry holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}
