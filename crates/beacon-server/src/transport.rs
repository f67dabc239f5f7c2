use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::connection::ConnectionHandle;
use crate::gateway::Gateway;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long teardown waits for the writer to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs [`Gateway::disconnect`] when the connection task ends, however it ends.
struct ConnectionGuard {
    gateway: Arc<Gateway>,
    handle: Arc<ConnectionHandle>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gateway.disconnect(&self.handle);
    }
}

/// Serve one upgraded socket until the peer leaves, the gateway closes it,
/// or a failed write gets it evicted.
pub async fn handle_ws_connection(socket: WebSocket, gateway: Arc<Gateway>) {
    let (handle, rx) = gateway.connect();
    let (ws_tx, ws_rx) = socket.split();
    serve_connection(gateway, handle, rx, ws_tx, ws_rx).await;
}

async fn serve_connection<S, R, E>(
    gateway: Arc<Gateway>,
    handle: Arc<ConnectionHandle>,
    rx: mpsc::Receiver<Arc<str>>,
    ws_tx: S,
    mut ws_rx: R,
) where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let guard = ConnectionGuard {
        gateway: gateway.clone(),
        handle: handle.clone(),
    };
    let mut writer = tokio::spawn(run_writer(ws_tx, rx, handle.clone()));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => gateway.dispatch(&handle, text.as_str()),
                    Some(Ok(WsMessage::Pong(_))) => handle.touch(),
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!(connection_id = %handle.id(), "ignoring binary frame");
                    }
                    // axum answers pings itself
                    Some(Ok(WsMessage::Ping(_))) => handle.touch(),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection_id = %handle.id(), error = %e, "socket read failed");
                        break;
                    }
                }
            }
            () = handle.close_token().cancelled() => break,
            () = handle.eviction_token().cancelled() => {
                info!(connection_id = %handle.id(), "evicted after failed write");
                break;
            }
        }
    }

    // Registry and room cleanup never wait on a peer that stopped reading.
    drop(guard);
    handle.close();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(connection_id = %handle.id(), "writer stalled, aborting");
        writer.abort();
    }
}

/// Sole owner of the socket sink. Drains the outbox and pings on an interval.
async fn run_writer<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Arc<str>>, handle: Arc<ConnectionHandle>)
where
    S: Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if !send_frame(&mut ws_tx, WsMessage::Text(text.as_ref().into()), &handle).await {
                    return;
                }
            }
            _ = ping.tick() => {
                if !send_frame(&mut ws_tx, WsMessage::Ping(axum::body::Bytes::new()), &handle).await {
                    return;
                }
                trace!(connection_id = %handle.id(), "sent ping");
            }
            () = handle.close_token().cancelled() => break,
        }
    }

    let _ = ws_tx.send(WsMessage::Close(None)).await;
}

/// One frame, abandoned if the connection closes while the peer is not
/// reading. `false` means the writer should stop.
async fn send_frame<S>(ws_tx: &mut S, msg: WsMessage, handle: &ConnectionHandle) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    tokio::select! {
        res = ws_tx.send(msg) => {
            if res.is_err() {
                handle.request_eviction();
                return false;
            }
            true
        }
        () = handle.close_token().cancelled() => false,
    }
}

/// Periodically close connections idle for longer than `timeout`.
pub fn start_sweep_task(
    gateway: Arc<Gateway>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = gateway.sweep_idle(timeout);
                    if closed > 0 {
                        info!(closed, "idle connection sweep");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SignalingBroker;
    use crate::registry::ConnectionRegistry;
    use crate::router::FanoutRouter;
    use beacon_core::ids::RoomId;
    use beacon_core::protocol::OutboundEvent;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A peer whose receive window never opens.
    struct StalledSink;

    impl Sink<WsMessage> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    fn gateway() -> Arc<Gateway> {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(FanoutRouter::new(registry, 10, None));
        Arc::new(Gateway::new(router, Arc::new(SignalingBroker::new(None)), 8, None))
    }

    #[test]
    fn guard_disconnects_on_drop() {
        let gw = gateway();
        let (handle, _rx) = gw.connect();
        assert_eq!(gw.connection_count(), 1);
        drop(ConnectionGuard {
            gateway: gw.clone(),
            handle: handle.clone(),
        });
        assert_eq!(gw.connection_count(), 0);
        assert_eq!(gw.broker().peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_closes_idle_and_stops_on_shutdown() {
        let gw = gateway();
        let (handle, _rx) = gw.connect();
        handle.backdate(Duration::from_secs(5));

        let shutdown = CancellationToken::new();
        let task = start_sweep_task(
            gw.clone(),
            Duration::from_secs(30),
            Duration::from_secs(2),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_closed());
        assert_eq!(gw.connection_count(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_forwards_outbox_then_closes() {
        let (handle, rx) = ConnectionHandle::channel(4);
        let (sink_tx, mut sink_rx) = futures::channel::mpsc::unbounded::<WsMessage>();
        let writer = tokio::spawn(run_writer(sink_tx, rx, handle.clone()));

        handle.send(Arc::from(r#"{"type":"heartbeat-ack"}"#));
        match sink_rx.next().await.unwrap() {
            WsMessage::Text(text) => assert_eq!(text.as_str(), r#"{"type":"heartbeat-ack"}"#),
            other => panic!("unexpected: {other:?}"),
        }

        handle.close();
        writer.await.unwrap();
        assert!(matches!(sink_rx.next().await, Some(WsMessage::Close(None))));
    }

    #[tokio::test]
    async fn writer_failure_requests_eviction() {
        let (handle, rx) = ConnectionHandle::channel(4);
        let (sink_tx, sink_rx) = futures::channel::mpsc::unbounded::<WsMessage>();
        drop(sink_rx);
        let writer = tokio::spawn(run_writer(sink_tx, rx, handle.clone()));

        handle.send(Arc::from("x"));
        writer.await.unwrap();
        assert!(handle.is_evicted());
    }

    #[tokio::test]
    async fn writer_stuck_in_send_stops_on_close() {
        let (handle, rx) = ConnectionHandle::channel(4);
        handle.send(Arc::from("x"));
        let writer = tokio::spawn(run_writer(StalledSink, rx, handle.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        handle.close();
        let finished = tokio::time::timeout(Duration::from_secs(2), writer).await;
        assert!(finished.is_ok(), "writer ignored close while the peer was stalled");
    }

    #[tokio::test]
    async fn stalled_peer_leaves_rooms_once_pruned() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(FanoutRouter::new(registry, 3, None));
        let broker = Arc::new(SignalingBroker::new(None).with_max_send_drops(3));
        let gw = Arc::new(Gateway::new(router, broker, 1, None));
        let room = RoomId::from_raw("inc_1");

        let (caller, mut caller_rx) = gw.connect();
        let (stalled, rx) = gw.connect();
        let task = tokio::spawn(serve_connection(
            gw.clone(),
            stalled.clone(),
            rx,
            StalledSink,
            futures::stream::pending::<Result<WsMessage, axum::Error>>(),
        ));

        gw.dispatch(&caller, r#"{"type":"join-call","roomId":"inc_1","role":"initiator"}"#);
        while caller_rx.try_recv().is_ok() {}
        gw.dispatch(&stalled, r#"{"type":"join-call","roomId":"inc_1","role":"responder"}"#);
        while caller_rx.try_recv().is_ok() {}
        assert_eq!(gw.broker().members(&room).len(), 2);

        for _ in 0..10 {
            gw.router().broadcast_all(&OutboundEvent::HeartbeatAck);
            while caller_rx.try_recv().is_ok() {}
            if stalled.is_evicted() {
                break;
            }
        }
        assert!(stalled.is_evicted());
        assert!(!gw.registry().contains(stalled.id()));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection task did not finish")
            .unwrap();
        assert_eq!(gw.broker().peer_count(), 1);
        let members = gw.broker().members(&room);
        assert_eq!(members.len(), 1);
        assert_eq!(&members[0].id, caller.id());
    }
}
