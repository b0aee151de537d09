//! Shared client-side store of fetched resources.
//!
//! Every view reads resources from here by key. Writers publish a
//! `CacheEvent` after each change; subscribers re-read the key they care
//! about. A write is visible to every reader as soon as `write` returns.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ResourceId;

const EVENT_CAPACITY: usize = 256;

/// Change notification published by the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    /// A new value was stored for the key.
    Written(ResourceId),
    /// The stored value (if any) no longer reflects the server; re-fetch it.
    Invalidated(ResourceId),
}

impl CacheEvent {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Self::Written(id) | Self::Invalidated(id) => id,
        }
    }
}

struct Entry<T> {
    value: T,
    stale: bool,
}

/// Keyed resource store with explicit change events.
pub struct QueryCache<T> {
    entries: Arc<DashMap<ResourceId, Entry<T>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            events: self.events.clone(),
        }
    }
}

impl<T: Clone> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> QueryCache<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Returns a copy of the cached value.
    pub fn get(&self, id: &ResourceId) -> Option<T> {
        self.entries.get(id).map(|entry| entry.value.clone())
    }

    /// Returns true if the key was invalidated since its last write.
    pub fn is_stale(&self, id: &ResourceId) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.stale)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores `value` and notifies subscribers.
    pub fn write(&self, id: ResourceId, value: T) {
        self.entries.insert(id.clone(), Entry { value, stale: false });
        self.publish(CacheEvent::Written(id));
    }

    /// Mutates a cached value in place. Returns false if the key is absent.
    pub fn update(&self, id: &ResourceId, f: impl FnOnce(&mut T)) -> bool {
        let updated = match self.entries.get_mut(id) {
            Some(mut entry) => {
                f(&mut entry.value);
                true
            }
            None => false,
        };
        // The shard lock is released before subscribers are woken.
        if updated {
            self.publish(CacheEvent::Written(id.clone()));
        }
        updated
    }

    /// Marks the key stale and notifies subscribers so they re-fetch.
    pub fn invalidate(&self, id: &ResourceId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.stale = true;
        }
        self.publish(CacheEvent::Invalidated(id.clone()));
    }

    pub fn remove(&self, id: &ResourceId) -> Option<T> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry.value);
        if removed.is_some() {
            self.publish(CacheEvent::Invalidated(id.clone()));
        }
        removed
    }

    /// Subscribes to change events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
