//! Per-connection send handle.
//!
//! The transport's writer task owns the socket sink and drains the bounded
//! outbox behind this handle, so every other component writes by enqueueing
//! and never blocks on a peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::ids::ConnectionId;
use beacon_core::protocol::OutboundEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Result of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Outbox at capacity; the message was dropped.
    Full,
    /// Writer has gone away; the transport is dead.
    Closed,
}

pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    dropped: AtomicU64,
    last_seen: Mutex<Instant>,
    /// Set by the gateway (idle sweep, shutdown) to end the transport.
    close: CancellationToken,
    /// Set by the router or broker after a failed write; the gateway reacts.
    evicted: CancellationToken,
    disconnected: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            tx,
            dropped: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            close: CancellationToken::new(),
            evicted: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Fresh id plus a bounded outbox of `capacity` messages.
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(ConnectionId::new(), tx)), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn send(&self, message: Arc<str>) -> SendOutcome {
        match self.tx.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Encode and enqueue a single event. An encode failure is reported as a
    /// dropped message.
    pub fn send_event(&self, event: &OutboundEvent) -> SendOutcome {
        match event.encode() {
            Ok(json) => self.send(Arc::from(json)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "failed to encode outbound event");
                SendOutcome::Full
            }
        }
    }

    /// Total messages dropped because the outbox was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    /// Ask the gateway to tear this connection down. Never touches the socket.
    pub fn request_eviction(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    pub fn eviction_token(&self) -> &CancellationToken {
        &self.evicted
    }

    /// Flip the one-shot disconnect flag. Returns `true` only for the first caller.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last = self.last_seen.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("dropped", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers() {
        let (conn, mut rx) = ConnectionHandle::channel(4);
        assert_eq!(conn.send(Arc::from("hello")), SendOutcome::Sent);
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn full_outbox_counts_drops() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        assert_eq!(conn.send(Arc::from("a")), SendOutcome::Sent);
        assert_eq!(conn.send(Arc::from("b")), SendOutcome::Full);
        assert_eq!(conn.send(Arc::from("c")), SendOutcome::Full);
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_outbox() {
        let (conn, rx) = ConnectionHandle::channel(4);
        drop(rx);
        assert_eq!(conn.send(Arc::from("a")), SendOutcome::Closed);
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn send_event_encodes_json() {
        let (conn, mut rx) = ConnectionHandle::channel(4);
        conn.send_event(&OutboundEvent::HeartbeatAck);
        assert_eq!(&*rx.try_recv().unwrap(), r#"{"type":"heartbeat-ack"}"#);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (conn, _rx) = ConnectionHandle::channel(0);
        assert_eq!(conn.send(Arc::from("a")), SendOutcome::Sent);
    }

    #[test]
    fn close_and_evict_are_independent() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        conn.request_eviction();
        assert!(conn.is_evicted());
        assert!(!conn.is_closed());
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn mark_disconnected_once() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        assert!(conn.mark_disconnected());
        assert!(!conn.mark_disconnected());
    }

    #[test]
    fn touch_resets_idle() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        conn.backdate(Duration::from_secs(5));
        assert!(conn.idle_for() >= Duration::from_secs(5));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
