//! Frame dispatch and connection lifecycle.
//!
//! The gateway is the only component that creates or tears down
//! connections. The router and broker flag a failing handle for eviction;
//! the transport notices and calls [`Gateway::disconnect`].

use std::sync::Arc;
use std::time::Duration;

use beacon_core::errors::DecodeError;
use beacon_core::geo::Coordinate;
use beacon_core::ids::{ConnectionId, SubscriberId};
use beacon_core::protocol::{decode, InboundFrame, OutboundEvent};
use beacon_core::roles::Role;
use beacon_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::SignalingBroker;
use crate::collab::Authenticator;
use crate::connection::ConnectionHandle;
use crate::metrics::{
    FRAMES_REJECTED_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_IDLE_CLOSED_TOTAL,
};
use crate::registry::ConnectionRegistry;
use crate::router::FanoutRouter;

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    router: Arc<FanoutRouter>,
    broker: Arc<SignalingBroker>,
    auth: Option<Arc<dyn Authenticator>>,
    require_token: bool,
    max_send_queue: usize,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Gateway {
    pub fn new(
        router: Arc<FanoutRouter>,
        broker: Arc<SignalingBroker>,
        max_send_queue: usize,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            registry: router.registry().clone(),
            router,
            broker,
            auth: None,
            require_token: false,
            max_send_queue,
            metrics,
        }
    }

    /// Verify `register` tokens with `auth`. With `require_token`, a register
    /// frame without a valid token is dropped.
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>, require_token: bool) -> Self {
        self.auth = Some(auth);
        self.require_token = require_token;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<FanoutRouter> {
        &self.router
    }

    pub fn broker(&self) -> &Arc<SignalingBroker> {
        &self.broker
    }

    /// Create the registry and broker entries for a new transport and queue
    /// the `connected` greeting. The receiver feeds the transport's writer.
    pub fn connect(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<str>>) {
        let (handle, rx) = ConnectionHandle::channel(self.max_send_queue);
        self.registry.add(handle.clone());
        self.broker.attach(handle.clone());
        handle.send_event(&OutboundEvent::Connected {
            connection_id: handle.id().clone(),
        });

        if let Some(m) = &self.metrics {
            m.counter_inc(WS_CONNECTIONS_TOTAL, &[], 1);
            m.gauge_inc(WS_CONNECTIONS_ACTIVE, &[], 1.0);
        }
        info!(connection_id = %handle.id(), "connection opened");
        (handle, rx)
    }

    /// Handle one inbound text frame. Never fails; bad frames are logged and
    /// dropped with the connection left open.
    pub fn dispatch(&self, conn: &ConnectionHandle, raw: &str) {
        conn.touch();
        let frame = match decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(conn.id(), &e);
                return;
            }
        };
        debug!(connection_id = %conn.id(), kind = frame.kind(), "frame");

        match frame {
            InboundFrame::Register {
                role,
                coordinate,
                subscriber_id,
                token,
            } => self.register(conn.id(), role, coordinate, subscriber_id, token),
            InboundFrame::LocationUpdate { coordinate } => {
                self.registry.update_location(conn.id(), coordinate);
            }
            InboundFrame::Heartbeat => {
                conn.send_event(&OutboundEvent::HeartbeatAck);
            }
            InboundFrame::JoinCall {
                room_id,
                role,
                subscriber_id,
            } => self.broker.join(conn.id(), room_id, role, subscriber_id),
            InboundFrame::Signal { kind, to, payload } => {
                self.broker.relay(conn.id(), &to, kind, payload);
            }
            InboundFrame::LeaveCall => {
                self.broker.leave(conn.id());
            }
        }
    }

    fn register(
        &self,
        id: &ConnectionId,
        role: Role,
        coordinate: Option<Coordinate>,
        subscriber_id: Option<SubscriberId>,
        token: Option<String>,
    ) {
        let identity = match (&self.auth, token.as_deref()) {
            (Some(auth), Some(token)) => match auth.verify(token) {
                Some(identity) => Some(identity),
                None => {
                    warn!(connection_id = %id, "register with invalid token dropped");
                    self.count_rejected("invalid_token");
                    return;
                }
            },
            _ => None,
        };
        if self.require_token && identity.is_none() {
            warn!(connection_id = %id, "register without token dropped");
            self.count_rejected("missing_token");
            return;
        }

        let (role, subscriber_id) = match identity {
            Some(identity) => (identity.role, Some(identity.subscriber_id)),
            None => (role, subscriber_id),
        };
        if self.registry.set_presence(id, role, coordinate, subscriber_id) {
            info!(
                connection_id = %id,
                role = %role,
                located = coordinate.is_some(),
                "registered"
            );
        }
    }

    fn reject(&self, id: &ConnectionId, err: &DecodeError) {
        match err {
            DecodeError::UnknownKind(kind) => {
                debug!(connection_id = %id, kind = %kind, "ignoring unknown frame kind");
            }
            _ => warn!(connection_id = %id, error = %err, "dropping bad frame"),
        }
        self.count_rejected(err.reason());
    }

    fn count_rejected(&self, reason: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(FRAMES_REJECTED_TOTAL, &[("reason", reason)], 1);
        }
    }

    /// Tear down registry and room state. Runs once per connection however
    /// many paths (reader exit, eviction, sweep) reach it.
    pub fn disconnect(&self, conn: &ConnectionHandle) {
        if !conn.mark_disconnected() {
            return;
        }
        self.registry.remove(conn.id());
        self.broker.detach(conn.id());

        if let Some(m) = &self.metrics {
            m.gauge_inc(WS_CONNECTIONS_ACTIVE, &[], -1.0);
        }
        info!(connection_id = %conn.id(), dropped = conn.drop_count(), "connection closed");
    }

    /// Close and clean up connections silent for longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> usize {
        let idle = self.registry.idle(timeout);
        for conn in &idle {
            info!(connection_id = %conn.id(), idle_secs = conn.idle_for().as_secs(), "closing idle connection");
            conn.close();
            self.disconnect(conn);
        }
        if let Some(m) = &self.metrics {
            if !idle.is_empty() {
                m.counter_inc(WS_IDLE_CLOSED_TOTAL, &[], idle.len() as u64);
            }
        }
        idle.len()
    }

    /// Close every live connection. Transports run their own cleanup.
    pub fn close_all(&self) {
        for entry in self.registry.snapshot() {
            entry.handle.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn room_count(&self) -> usize {
        self.broker.room_count()
    }
}
