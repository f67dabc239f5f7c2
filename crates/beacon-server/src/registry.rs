//! Live connection registry.
//!
//! Holds presence state only. Delivery goes through each entry's
//! [`ConnectionHandle`] after a [`ConnectionRegistry::snapshot`], so no map
//! shard is ever held across a send.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::geo::Coordinate;
use beacon_core::ids::{ConnectionId, SubscriberId};
use beacon_core::roles::Role;
use dashmap::DashMap;

use crate::connection::ConnectionHandle;

struct Entry {
    handle: Arc<ConnectionHandle>,
    role: Option<Role>,
    coordinate: Option<Coordinate>,
    subscriber_id: Option<SubscriberId>,
}

/// Point-in-time copy of one entry.
#[derive(Clone, Debug)]
pub struct EntrySnapshot {
    pub id: ConnectionId,
    pub handle: Arc<ConnectionHandle>,
    pub role: Option<Role>,
    pub coordinate: Option<Coordinate>,
    pub subscriber_id: Option<SubscriberId>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Entry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connected, unregistered entry.
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id().clone();
        self.entries.insert(
            id,
            Entry {
                handle,
                role: None,
                coordinate: None,
                subscriber_id: None,
            },
        );
    }

    /// Record a `register`. `None` for coordinate or subscriber keeps the
    /// previous value. Returns `false` (and does nothing) if `id` is gone.
    pub fn set_presence(
        &self,
        id: &ConnectionId,
        role: Role,
        coordinate: Option<Coordinate>,
        subscriber_id: Option<SubscriberId>,
    ) -> bool {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.role = Some(role);
        if coordinate.is_some() {
            entry.coordinate = coordinate;
        }
        if subscriber_id.is_some() {
            entry.subscriber_id = subscriber_id;
        }
        true
    }

    /// Record a `location-update`. No-op if `id` is gone.
    pub fn update_location(&self, id: &ConnectionId, coordinate: Coordinate) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.coordinate = Some(coordinate);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.entries.remove(id).map(|(_, entry)| entry.handle)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.entries.get(id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .map(|item| {
                let entry = item.value();
                EntrySnapshot {
                    id: item.key().clone(),
                    handle: entry.handle.clone(),
                    role: entry.role,
                    coordinate: entry.coordinate,
                    subscriber_id: entry.subscriber_id.clone(),
                }
            })
            .collect()
    }

    /// Handles whose last inbound activity is older than `timeout`.
    pub fn idle(&self, timeout: Duration) -> Vec<Arc<ConnectionHandle>> {
        self.entries
            .iter()
            .filter(|item| item.value().handle.idle_for() > timeout)
            .map(|item| item.value().handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
