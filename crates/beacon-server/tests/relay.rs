//! End-to-end tests against a real server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use beacon_server::{start, Collaborators, ServerConfig, ServerHandle};
use beacon_store::{Database, IncidentRepo};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn boot() -> ServerHandle {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let store = Arc::new(IncidentRepo::new(Database::in_memory().unwrap()));
    start(config, Collaborators::new(store)).await.unwrap()
}

/// Connect and consume the greeting; returns the client and its connection id.
async fn connect(server: &ServerHandle) -> (Client, String) {
    let url = format!("ws://127.0.0.1:{}/ws", server.port);
    let (mut ws, _) = connect_async(url).await.unwrap();
    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "connected");
    let id = greeting["connectionId"].as_str().unwrap().to_string();
    (ws, id)
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Heartbeat round trip. Frames from one connection are handled in order, so
/// everything sent before this has been applied once it returns.
async fn sync(ws: &mut Client) {
    send(ws, json!({"type": "heartbeat"})).await;
    assert_eq!(next_json(ws).await["type"], "heartbeat-ack");
}

async fn health(server: &ServerHandle) -> Value {
    reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn greeting_carries_connection_id() {
    let server = boot().await;
    let (_ws, id) = connect(&server).await;
    assert!(id.starts_with("conn_"));
    assert_eq!(health(&server).await["connections"], 1);
    server.shutdown().await;
}

#[tokio::test]
async fn incident_reaches_nearby_members_and_responders_only() {
    let server = boot().await;
    let (mut near, _) = connect(&server).await;
    let (mut far, _) = connect(&server).await;
    let (mut medic, _) = connect(&server).await;

    send(&mut near, json!({"type": "register", "role": "community", "lat": 37.7750, "lng": -122.4194})).await;
    send(&mut far, json!({"type": "register", "role": "reporter", "lat": 37.80, "lng": -122.4194})).await;
    send(&mut medic, json!({"type": "register", "role": "responder"})).await;
    for ws in [&mut near, &mut far, &mut medic] {
        sync(ws).await;
    }

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/incidents", server.port))
        .json(&json!({"lat": 37.7749, "lng": -122.4194, "category": "medical", "note": "fall"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["nearby"], 1);
    assert_eq!(report["respondersNotified"], 1);

    let alert = next_json(&mut near).await;
    assert_eq!(alert["type"], "incident-new");
    assert_eq!(alert["event"]["category"], "medical");
    assert!(alert["distanceKm"].as_f64().unwrap() < 0.05);

    let alert = next_json(&mut medic).await;
    assert_eq!(alert["type"], "incident-new");
    assert!(alert.get("distanceKm").is_none());

    // Fan-out finished before the response; the far client's next frame is the ack.
    sync(&mut far).await;

    server.shutdown().await;
}

#[tokio::test]
async fn incident_update_is_broadcast() {
    let server = boot().await;
    let (mut ws, _) = connect(&server).await;
    let http = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", server.port);

    let report: Value = http
        .post(format!("{base}/incidents"))
        .json(&json!({"lat": 1.0, "lng": 1.0, "category": "flood"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = report["incident"]["id"].as_str().unwrap();

    let resp = http
        .patch(format!("{base}/incidents/{id}"))
        .json(&json!({"status": "in_progress"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "incident-updated");
    assert_eq!(msg["event"]["status"], "in_progress");

    server.shutdown().await;
}

#[tokio::test]
async fn call_room_relays_signaling() {
    let server = boot().await;
    let (mut caller, caller_id) = connect(&server).await;
    let (mut medic, medic_id) = connect(&server).await;

    send(&mut caller, json!({"type": "join-call", "roomId": "inc_1", "role": "initiator"})).await;
    sync(&mut caller).await;
    send(&mut medic, json!({"type": "join-call", "roomId": "inc_1", "role": "responder"})).await;

    let joined = next_json(&mut caller).await;
    assert_eq!(joined["type"], "peer-joined");
    assert_eq!(joined["connectionId"], medic_id.as_str());
    assert_eq!(joined["role"], "responder");

    let roster = next_json(&mut medic).await;
    assert_eq!(roster["type"], "peer-joined");
    assert_eq!(roster["connectionId"], caller_id.as_str());
    let invite = next_json(&mut medic).await;
    assert_eq!(invite["type"], "invite");
    assert_eq!(invite["peerId"], caller_id.as_str());

    let offer = json!({"sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1"});
    send(&mut caller, json!({"type": "signal-offer", "to": medic_id, "payload": offer})).await;
    let relayed = next_json(&mut medic).await;
    assert_eq!(relayed["type"], "signal-offer");
    assert_eq!(relayed["from"], caller_id.as_str());
    assert_eq!(relayed["payload"], offer);

    send(&mut medic, json!({"type": "signal-ice", "to": caller_id, "payload": {"candidate": "c"}})).await;
    let ice = next_json(&mut caller).await;
    assert_eq!(ice["type"], "signal-ice");
    assert_eq!(ice["from"], medic_id.as_str());

    assert_eq!(health(&server).await["rooms"], 1);

    send(&mut medic, json!({"type": "leave-call"})).await;
    let left = next_json(&mut caller).await;
    assert_eq!(left["type"], "peer-left");
    assert_eq!(left["connectionId"], medic_id.as_str());

    server.shutdown().await;
}

#[tokio::test]
async fn bad_frames_leave_the_connection_open() {
    let server = boot().await;
    let (mut ws, _) = connect(&server).await;

    send(&mut ws, json!({"type": "teleport"})).await;
    ws.send(Message::text("not json")).await.unwrap();
    send(&mut ws, json!({"type": "location-update", "lat": 200.0, "lng": 0.0})).await;
    sync(&mut ws).await;

    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_cleans_up_registry_and_rooms() {
    let server = boot().await;
    let (mut caller, _) = connect(&server).await;
    let (mut medic, medic_id) = connect(&server).await;

    send(&mut caller, json!({"type": "join-call", "roomId": "inc_2", "role": "initiator"})).await;
    sync(&mut caller).await;
    send(&mut medic, json!({"type": "join-call", "roomId": "inc_2", "role": "responder"})).await;
    assert_eq!(next_json(&mut caller).await["type"], "peer-joined");

    medic.close(None).await.unwrap();

    let left = next_json(&mut caller).await;
    assert_eq!(left["type"], "peer-left");
    assert_eq!(left["connectionId"], medic_id.as_str());

    let mut connections = Value::Null;
    for _ in 0..50 {
        connections = health(&server).await["connections"].clone();
        if connections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(connections, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let server = boot().await;
    let (mut ws, _) = connect(&server).await;
    server.shutdown().await;

    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok());
}
