//! Integration tests for the WebSocket chat core: handshake, presence,
//! online delivery, offline replay, typing, and sender spoofing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pulse_server::auth::JwtVerifier;
use pulse_server::chat::store::MessageStore;
use pulse_server::presence::PresenceRegistry;
use pulse_server::ws::frame::{kind, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start the server on a random port and return (addr, jwt_secret).
async fn start_test_server() -> (SocketAddr, Vec<u8>) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = pulse_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = pulse_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = pulse_server::state::AppState {
        store: MessageStore::new(db),
        registry: Arc::new(PresenceRegistry::new()),
        verifier: Arc::new(JwtVerifier::new(jwt_secret.clone())),
        jwt_secret: jwt_secret.clone(),
        read_deadline: Duration::from_secs(5),
    };

    let app = pulse_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    (addr, jwt_secret)
}

fn mint_token(secret: &[u8], user_id: i64) -> String {
    pulse_server::auth::jwt::issue_access_token(secret, user_id).expect("Failed to issue token")
}

async fn connect_ws(addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    ws
}

/// Connect and complete the in-band handshake for a user.
async fn handshake(addr: SocketAddr, token: &str) -> WsStream {
    let mut ws = connect_ws(addr).await;
    let connect = Frame {
        kind: kind::CONNECT.to_string(),
        token: Some(token.to_string()),
        ..Frame::default()
    };
    ws.send(Message::Text(connect.encode().unwrap().into()))
        .await
        .expect("Failed to send connect frame");
    ws
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) {
    ws.send(Message::Text(frame.encode().unwrap().into()))
        .await
        .expect("Failed to send frame");
}

/// Read the next text frame, skipping transport pings/pongs.
/// None if the connection closes or nothing arrives in time.
async fn next_frame(ws: &mut WsStream) -> Option<Frame> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(Frame::decode(text.as_str()).expect("server sent malformed frame"))
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// True if the connection closes (or stops responding) without ever
/// producing a text frame.
async fn closes_without_frames(ws: &mut WsStream) -> bool {
    next_frame(ws).await.is_none()
}

fn message_frame(sender: i64, receiver: i64, content: &str) -> Frame {
    Frame {
        kind: kind::MESSAGE.to_string(),
        sender_id: Some(sender),
        receiver_id: Some(receiver),
        content: Some(content.to_string()),
        ..Frame::default()
    }
}

async fn fetch_unread(
    addr: SocketAddr,
    token: &str,
) -> std::collections::HashMap<String, i64> {
    reqwest::Client::new()
        .get(format!("http://{}/api/chat/unread", addr))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn valid_handshake_shows_user_online() {
    let (addr, secret) = start_test_server().await;
    let token = mint_token(&secret, 1);

    let mut ws = handshake(addr, &token).await;

    // No handshake-success frame is emitted; the connection just stays open
    tokio::time::sleep(Duration::from_millis(100)).await;

    let online: std::collections::HashMap<String, bool> = reqwest::Client::new()
        .get(format!("http://{}/api/chat/online", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(online.get("1"), Some(&true));

    // With no pending messages, nothing is pushed to the client
    let quiet = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(quiet.is_err(), "Expected no traffic after clean handshake");
}

#[tokio::test]
async fn invalid_token_is_denied_silently() {
    let (addr, _secret) = start_test_server().await;

    let mut ws = handshake(addr, "not-a-real-token").await;
    assert!(
        closes_without_frames(&mut ws).await,
        "Expected silent drop on bad credential"
    );
}

#[tokio::test]
async fn ping_before_connect_does_not_fail_handshake() {
    let (addr, secret) = start_test_server().await;
    let token = mint_token(&secret, 1);

    // Some clients and proxies send keepalive pings before any protocol
    // traffic; the handshake must skip them, not die on them.
    let mut ws = connect_ws(addr).await;
    ws.send(Message::Ping(vec![1, 2].into()))
        .await
        .expect("Failed to send ping");

    let connect = Frame {
        kind: kind::CONNECT.to_string(),
        token: Some(token.clone()),
        ..Frame::default()
    };
    ws.send(Message::Text(connect.encode().unwrap().into()))
        .await
        .expect("Failed to send connect frame");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let online: std::collections::HashMap<String, bool> = reqwest::Client::new()
        .get(format!("http://{}/api/chat/online", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        online.get("1"),
        Some(&true),
        "Handshake should survive a pre-connect transport ping"
    );
}

#[tokio::test]
async fn malformed_first_frame_is_denied() {
    let (addr, _secret) = start_test_server().await;

    let mut ws = connect_ws(addr).await;
    ws.send(Message::Text("{nope".into()))
        .await
        .expect("Failed to send malformed frame");

    assert!(
        closes_without_frames(&mut ws).await,
        "Expected silent drop on malformed first frame"
    );
}

#[tokio::test]
async fn malformed_frame_during_active_closes_session() {
    let (addr, secret) = start_test_server().await;
    let token = mint_token(&secret, 1);

    let mut ws = handshake(addr, &token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws.send(Message::Text("{nope".into()))
        .await
        .expect("Failed to send malformed frame");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let online: std::collections::HashMap<String, bool> = reqwest::Client::new()
        .get(format!("http://{}/api/chat/online", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        online.is_empty(),
        "Malformed frame during Active must close the session"
    );
}

#[tokio::test]
async fn non_connect_first_frame_is_denied() {
    let (addr, secret) = start_test_server().await;
    let _token = mint_token(&secret, 1);

    let mut ws = connect_ws(addr).await;
    send_frame(&mut ws, &message_frame(1, 2, "too early")).await;

    assert!(
        closes_without_frames(&mut ws).await,
        "Expected drop when first frame is not connect"
    );
}

#[tokio::test]
async fn online_delivery_forwards_and_acks() {
    let (addr, secret) = start_test_server().await;
    let token1 = mint_token(&secret, 1);
    let token2 = mint_token(&secret, 2);

    let mut sender = handshake(addr, &token1).await;
    let mut receiver = handshake(addr, &token2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_frame(&mut sender, &message_frame(1, 2, "hi")).await;

    let forwarded = next_frame(&mut receiver).await.expect("receiver got nothing");
    assert_eq!(forwarded.kind, kind::MESSAGE);
    assert_eq!(forwarded.sender_id, Some(1));
    assert_eq!(forwarded.content.as_deref(), Some("hi"));
    assert!(forwarded.timestamp.is_some(), "forwarded frame carries server time");

    let ack = next_frame(&mut sender).await.expect("sender got no ack");
    assert_eq!(ack.kind, kind::DELIVERED);

    // Delivered online — nothing left queued for user 2
    assert!(fetch_unread(addr, &token2).await.is_empty());
}

#[tokio::test]
async fn offline_message_is_stored_and_replayed_on_reconnect() {
    let (addr, secret) = start_test_server().await;
    let token1 = mint_token(&secret, 1);
    let token2 = mint_token(&secret, 2);

    // User 2 has no active connection
    let mut sender = handshake(addr, &token1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_frame(&mut sender, &message_frame(1, 2, "hi")).await;

    // No ack for an offline receiver
    let quiet = tokio::time::timeout(Duration::from_millis(300), sender.next()).await;
    assert!(quiet.is_err(), "Expected no delivered ack for offline receiver");

    // Stored undelivered, counted against the sender
    let unread = fetch_unread(addr, &token2).await;
    assert_eq!(unread.get("1"), Some(&1));

    // On reconnect, the stored message is replayed before anything else
    let mut receiver = handshake(addr, &token2).await;
    let replayed = next_frame(&mut receiver).await.expect("no replayed message");
    assert_eq!(replayed.kind, kind::MESSAGE);
    assert_eq!(replayed.sender_id, Some(1));
    assert_eq!(replayed.content.as_deref(), Some("hi"));

    // Replay marked it delivered
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fetch_unread(addr, &token2).await.is_empty());
}

#[tokio::test]
async fn replay_is_ordered_oldest_first() {
    let (addr, secret) = start_test_server().await;
    let token1 = mint_token(&secret, 1);
    let token2 = mint_token(&secret, 2);

    let mut sender = handshake(addr, &token1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for text in ["first", "second", "third"] {
        send_frame(&mut sender, &message_frame(1, 2, text)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut receiver = handshake(addr, &token2).await;
    for expected in ["first", "second", "third"] {
        let frame = next_frame(&mut receiver).await.expect("missing replayed message");
        assert_eq!(frame.content.as_deref(), Some(expected));
    }
}

#[tokio::test]
async fn typing_is_relayed_but_never_persisted() {
    let (addr, secret) = start_test_server().await;
    let token1 = mint_token(&secret, 1);
    let token2 = mint_token(&secret, 2);

    let mut sender = handshake(addr, &token1).await;
    let mut receiver = handshake(addr, &token2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let typing = Frame {
        kind: kind::TYPING.to_string(),
        sender_id: Some(1),
        receiver_id: Some(2),
        status: Some("started".to_string()),
        ..Frame::default()
    };
    send_frame(&mut sender, &typing).await;

    let relayed = next_frame(&mut receiver).await.expect("typing not relayed");
    assert_eq!(relayed.kind, kind::TYPING);
    assert_eq!(relayed.sender_id, Some(1));
    assert_eq!(relayed.status.as_deref(), Some("started"));

    // Nothing persisted
    assert!(fetch_unread(addr, &token2).await.is_empty());

    // Typing to an offline receiver is a silent no-op
    send_frame(&mut sender, &Frame::typing(1, 99, None)).await;
    let quiet = tokio::time::timeout(Duration::from_millis(300), sender.next()).await;
    assert!(quiet.is_err(), "Expected no error for typing to offline user");
}

#[tokio::test]
async fn spoofed_sender_is_dropped_and_session_survives() {
    let (addr, secret) = start_test_server().await;
    let token5 = mint_token(&secret, 5);
    let token7 = mint_token(&secret, 7);

    let mut spoofer = handshake(addr, &token5).await;
    let mut receiver = handshake(addr, &token7).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Claimed sender 6 does not match authenticated identity 5
    send_frame(&mut spoofer, &message_frame(6, 7, "x")).await;

    let quiet = tokio::time::timeout(Duration::from_millis(300), receiver.next()).await;
    assert!(quiet.is_err(), "Spoofed message must not be forwarded");
    assert!(fetch_unread(addr, &token7).await.is_empty());

    // Session remains Active: an honest message still goes through
    send_frame(&mut spoofer, &message_frame(5, 7, "legit")).await;
    let frame = next_frame(&mut receiver).await.expect("honest message lost");
    assert_eq!(frame.content.as_deref(), Some("legit"));
}

#[tokio::test]
async fn disconnect_frame_takes_user_offline() {
    let (addr, secret) = start_test_server().await;
    let token = mint_token(&secret, 1);

    let mut ws = handshake(addr, &token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let disconnect = Frame {
        kind: kind::DISCONNECT.to_string(),
        ..Frame::default()
    };
    send_frame(&mut ws, &disconnect).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let online: std::collections::HashMap<String, bool> = reqwest::Client::new()
        .get(format!("http://{}/api/chat/online", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(online.is_empty(), "User should be offline after disconnect");
}

#[tokio::test]
async fn second_handshake_supersedes_first_connection() {
    let (addr, secret) = start_test_server().await;
    let token1 = mint_token(&secret, 1);
    let token3 = mint_token(&secret, 3);

    let mut first = handshake(addr, &token1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = handshake(addr, &token1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Traffic for identity 1 lands on the superseding connection only
    let mut peer = handshake(addr, &token3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_frame(&mut peer, &message_frame(3, 1, "which one")).await;

    let frame = next_frame(&mut second).await.expect("superseding connection got nothing");
    assert_eq!(frame.content.as_deref(), Some("which one"));

    let quiet = tokio::time::timeout(Duration::from_millis(300), first.next()).await;
    assert!(quiet.is_err(), "Superseded connection must not receive traffic");
}
