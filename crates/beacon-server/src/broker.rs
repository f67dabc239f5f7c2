//! Call-room signaling.
//!
//! The broker keeps its own peer index, separate from the proximity registry,
//! plus a room index keyed by [`RoomId`]. A connection is in at most one room.
//!
//! Locking: a room's entry guard is held while members are notified, which
//! serializes `peer-joined`/`peer-left` per room. The `peers` map is never
//! locked while a `rooms` guard is being acquired, only the other way round.

use std::sync::Arc;

use beacon_core::ids::{ConnectionId, RoomId, SubscriberId};
use beacon_core::protocol::{OutboundEvent, SignalKind};
use beacon_core::roles::CallRole;
use beacon_settings::ServerSettings;
use beacon_telemetry::MetricsRecorder;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, SendOutcome};
use crate::metrics::{SIGNAL_DROPPED_TOTAL, SIGNAL_RELAYED_TOTAL};

struct Peer {
    handle: Arc<ConnectionHandle>,
    room: Option<RoomId>,
    role: Option<CallRole>,
    subscriber_id: Option<SubscriberId>,
}

#[derive(Clone)]
struct Member {
    id: ConnectionId,
    role: CallRole,
    handle: Arc<ConnectionHandle>,
}

#[derive(Default)]
struct Room {
    /// Join order.
    members: Vec<Member>,
}

impl Room {
    fn notify_others(&self, except: &ConnectionId, event: &OutboundEvent, max_drops: u64) {
        for member in self.members.iter().filter(|m| &m.id != except) {
            deliver(&member.handle, event, max_drops);
        }
    }
}

/// Current member of a room, as reported by [`SignalingBroker::members`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomMember {
    pub id: ConnectionId,
    pub role: CallRole,
}

/// Send to one member. A closed outbox, or a full one past `max_drops`
/// total drops, flags the connection for eviction.
fn deliver(handle: &ConnectionHandle, event: &OutboundEvent, max_drops: u64) -> bool {
    match handle.send_event(event) {
        SendOutcome::Sent => true,
        SendOutcome::Full => {
            let drops = handle.drop_count();
            if drops >= max_drops {
                warn!(connection_id = %handle.id(), drops, "evicting slow call peer");
                handle.request_eviction();
            }
            false
        }
        SendOutcome::Closed => {
            handle.request_eviction();
            false
        }
    }
}

pub struct SignalingBroker {
    peers: DashMap<ConnectionId, Peer>,
    rooms: DashMap<RoomId, Room>,
    max_send_drops: u64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SignalingBroker {
    pub fn new(metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self {
            peers: DashMap::new(),
            rooms: DashMap::new(),
            max_send_drops: ServerSettings::default().max_send_drops,
            metrics,
        }
    }

    /// Full-outbox drops a peer may accumulate before it is evicted.
    pub fn with_max_send_drops(mut self, max_send_drops: u64) -> Self {
        self.max_send_drops = max_send_drops;
        self
    }

    /// Make a connection addressable for relay. Starts idle.
    pub fn attach(&self, handle: Arc<ConnectionHandle>) {
        self.peers.insert(
            handle.id().clone(),
            Peer {
                handle,
                room: None,
                role: None,
                subscriber_id: None,
            },
        );
    }

    /// Implicit leave, then forget the connection.
    pub fn detach(&self, id: &ConnectionId) {
        self.leave(id);
        self.peers.remove(id);
    }

    /// Put `id` into `room_id` with `role`.
    ///
    /// Existing members get `peer-joined` for `id`; `id` gets one `peer-joined`
    /// per existing member, and an `invite` naming the first initiator when it
    /// joins as responder. Already in another room: that room is left first, with `peer-left`
    /// delivered there. Already in this room: only the role changes.
    pub fn join(
        &self,
        id: &ConnectionId,
        room_id: RoomId,
        role: CallRole,
        subscriber_id: Option<SubscriberId>,
    ) {
        let (handle, current) = match self.peers.get(id) {
            Some(peer) => (peer.handle.clone(), peer.room.clone()),
            None => {
                debug!(connection_id = %id, "join from unknown connection");
                return;
            }
        };

        if current.as_ref() == Some(&room_id) {
            if let Some(mut room) = self.rooms.get_mut(&room_id) {
                if let Some(member) = room.members.iter_mut().find(|m| &m.id == id) {
                    member.role = role;
                }
            }
            if let Some(mut peer) = self.peers.get_mut(id) {
                peer.role = Some(role);
            }
            return;
        }
        if current.is_some() {
            self.leave(id);
        }

        let members = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            room.notify_others(
                id,
                &OutboundEvent::PeerJoined {
                    connection_id: id.clone(),
                    role,
                },
                self.max_send_drops,
            );
            // The joiner learns the existing roster the same way.
            for member in room.members.iter().filter(|m| &m.id != id) {
                deliver(
                    &handle,
                    &OutboundEvent::PeerJoined {
                        connection_id: member.id.clone(),
                        role: member.role,
                    },
                    self.max_send_drops,
                );
            }
            room.members.push(Member {
                id: id.clone(),
                role,
                handle: handle.clone(),
            });

            if role == CallRole::Responder {
                if let Some(initiator) = room
                    .members
                    .iter()
                    .find(|m| m.role == CallRole::Initiator && &m.id != id)
                {
                    deliver(
                        &handle,
                        &OutboundEvent::Invite {
                            peer_id: initiator.id.clone(),
                        },
                        self.max_send_drops,
                    );
                }
            }
            room.members.len()
        };

        let attached = match self.peers.get_mut(id) {
            Some(mut peer) => {
                peer.room = Some(room_id.clone());
                peer.role = Some(role);
                if subscriber_id.is_some() {
                    peer.subscriber_id = subscriber_id;
                }
                true
            }
            None => false,
        };
        if !attached {
            // Detached while joining.
            self.remove_member(&room_id, id);
            return;
        }
        info!(connection_id = %id, room_id = %room_id, role = %role, members, "joined call room");
    }

    /// Forward a signaling payload verbatim with `from` attached. Returns
    /// `false` when the target is not a live connection; nothing is sent.
    pub fn relay(
        &self,
        from: &ConnectionId,
        to: &ConnectionId,
        kind: SignalKind,
        payload: Value,
    ) -> bool {
        let target = self.peers.get(to).map(|peer| peer.handle.clone());
        let Some(target) = target else {
            debug!(connection_id = %from, to = %to, kind = kind.wire_type(), "relay target gone, dropping");
            self.count(SIGNAL_DROPPED_TOTAL, kind);
            return false;
        };

        let delivered = deliver(
            &target,
            &OutboundEvent::signal(kind, from.clone(), payload),
            self.max_send_drops,
        );
        if delivered {
            self.count(SIGNAL_RELAYED_TOTAL, kind);
        } else {
            self.count(SIGNAL_DROPPED_TOTAL, kind);
        }
        delivered
    }

    /// Leave the current room, deleting it once empty. Remaining members get
    /// `peer-left`. Returns `false` when `id` was not in a room.
    pub fn leave(&self, id: &ConnectionId) -> bool {
        let room_id = match self.peers.get_mut(id) {
            Some(mut peer) => peer.room.take(),
            None => None,
        };
        let Some(room_id) = room_id else {
            return false;
        };

        let Some(remaining) = self.remove_member(&room_id, id) else {
            return false;
        };

        info!(connection_id = %id, room_id = %room_id, remaining, "left call room");
        true
    }

    /// Drop `id` from the room and tell the rest. `None` if it was not a member.
    fn remove_member(&self, room_id: &RoomId, id: &ConnectionId) -> Option<usize> {
        let Entry::Occupied(mut occupied) = self.rooms.entry(room_id.clone()) else {
            return None;
        };
        let room = occupied.get_mut();
        let pos = room.members.iter().position(|m| &m.id == id)?;
        let member = room.members.remove(pos);
        room.notify_others(
            id,
            &OutboundEvent::PeerLeft {
                connection_id: member.id,
                role: member.role,
            },
            self.max_send_drops,
        );
        let remaining = room.members.len();
        if remaining == 0 {
            occupied.remove();
        }
        Some(remaining)
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<RoomId> {
        self.peers.get(id).and_then(|peer| peer.room.clone())
    }

    pub fn subscriber_of(&self, id: &ConnectionId) -> Option<SubscriberId> {
        self.peers.get(id).and_then(|peer| peer.subscriber_id.clone())
    }

    pub fn role_of(&self, id: &ConnectionId) -> Option<CallRole> {
        self.peers.get(id).and_then(|peer| peer.role)
    }

    /// Members of `room_id` in join order. Empty if the room does not exist.
    pub fn members(&self, room_id: &RoomId) -> Vec<RoomMember> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .map(|m| RoomMember {
                        id: m.id.clone(),
                        role: m.role,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn count(&self, name: &str, kind: SignalKind) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[("kind", kind.wire_type())], 1);
        }
    }
}
