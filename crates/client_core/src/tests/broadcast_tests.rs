use std::time::Duration;

use reqwest::Client;

use super::*;
use crate::{
    endpoints::Endpoints,
    test_support::{spawn_silent_server, FakeServer, Push},
};

struct Harness {
    controller: Arc<BroadcastController>,
    presence: Arc<PresencePoller>,
    hub: Arc<EventHub>,
}

fn harness(server_url: &str, heartbeat_interval: Duration, reconnect_delay: Duration) -> Harness {
    let endpoints = Endpoints::new(server_url).expect("endpoints");
    let device_id = DeviceId::from("dev-abc123");
    let hub = Arc::new(EventHub::new());
    let presence = Arc::new(PresencePoller::new(
        Client::new(),
        endpoints.presence().expect("presence url"),
        device_id.clone(),
        Arc::clone(&hub),
    ));
    let controller = Arc::new(BroadcastController::new(
        endpoints.broadcast(&device_id).expect("broadcast url"),
        device_id,
        BroadcastTiming {
            heartbeat_interval,
            reconnect_delay,
        },
        Arc::clone(&presence),
        Arc::clone(&hub),
    ));
    Harness {
        controller,
        presence,
        hub,
    }
}

async fn public_texts(hub: &EventHub) -> Vec<String> {
    hub.public_transcript()
        .await
        .into_iter()
        .map(|entry| entry.text)
        .collect()
}

#[test]
fn heartbeat_is_only_built_for_open_connections() {
    assert_eq!(
        heartbeat_frame(ConnectionState::Open),
        Some(ChannelMessage::Ping)
    );
    for state in [
        ConnectionState::Connecting,
        ConnectionState::Closing,
        ConnectionState::Closed,
    ] {
        assert_eq!(heartbeat_frame(state), None, "state {state}");
    }
}

#[tokio::test]
async fn connects_with_device_id_and_pings_while_open() {
    let server = FakeServer::spawn().await;
    let h = harness(
        &server.url,
        Duration::from_millis(50),
        Duration::from_secs(30),
    );
    assert_eq!(h.controller.state().await, BroadcastState::Idle);
    let task = h.controller.spawn();

    eventually!("public open", server.public_open_count().await == 1);
    assert_eq!(server.public_opens.lock().await[0].0, "dev-abc123");
    eventually!("two pings", server.public_pings().await >= 2);
    assert!(h.controller.heartbeats_sent() >= 2);
    assert_eq!(
        h.controller.state().await,
        BroadcastState::Connection(ConnectionState::Open)
    );
    assert_eq!(
        public_texts(&h.hub).await.first().map(String::as_str),
        Some("Connected to public chat")
    );

    task.abort();
}

#[tokio::test]
async fn skips_heartbeats_while_connecting() {
    let silent = spawn_silent_server().await;
    let h = harness(&silent, Duration::from_millis(20), Duration::from_secs(30));
    let task = h.controller.spawn();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.controller.state().await,
        BroadcastState::Connection(ConnectionState::Connecting)
    );
    assert_eq!(h.controller.heartbeats_sent(), 0);
    assert!(matches!(
        h.controller.send_text("hello").await,
        Err(SessionError::BroadcastNotConnected)
    ));

    task.abort();
}

#[tokio::test]
async fn first_ping_waits_a_full_interval_after_a_slow_handshake() {
    let server = FakeServer::spawn().await;
    *server.public_handshake_delay.lock().await = Duration::from_millis(250);
    let h = harness(&server.url, Duration::from_millis(300), Duration::from_secs(30));
    let task = h.controller.spawn();

    eventually!(
        "client open",
        h.controller.state().await == BroadcastState::Connection(ConnectionState::Open)
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.public_pings().await, 0);
    assert_eq!(h.controller.heartbeats_sent(), 0);

    eventually!("first ping", server.public_pings().await == 1);

    task.abort();
}

#[tokio::test]
async fn send_before_start_fails_visibly() {
    let server = FakeServer::spawn().await;
    let h = harness(&server.url, Duration::from_secs(15), Duration::from_secs(2));
    assert!(matches!(
        h.controller.send_text("hello").await,
        Err(SessionError::BroadcastNotConnected)
    ));
}

#[tokio::test]
async fn reconnects_exactly_once_after_the_fixed_delay() {
    let server = FakeServer::spawn().await;
    let delay = Duration::from_millis(300);
    let h = harness(&server.url, Duration::from_secs(60), delay);
    let task = h.controller.spawn();

    eventually!("first open", server.public_open_count().await == 1);
    server.push_public(Push::Close);
    eventually!("second open", server.public_open_count().await == 2);

    let closed_at = server.public_closes.lock().await[0];
    let reopened_at = server.public_opens.lock().await[1].1;
    assert!(
        reopened_at.duration_since(closed_at) >= delay,
        "reconnected after {:?}",
        reopened_at.duration_since(closed_at)
    );

    tokio::time::sleep(delay + Duration::from_millis(200)).await;
    assert_eq!(server.public_open_count().await, 2);
    assert_eq!(h.controller.connect_attempts(), 2);

    let texts = public_texts(&h.hub).await;
    assert_eq!(
        texts,
        vec![
            "Connected to public chat",
            "Public socket closed",
            "Connected to public chat",
        ]
    );

    task.abort();
}

#[tokio::test]
async fn keeps_retrying_while_server_is_down() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let h = harness(
        &format!("http://{addr}"),
        Duration::from_secs(60),
        Duration::from_millis(50),
    );
    let task = h.controller.spawn();

    eventually!("several attempts", h.controller.connect_attempts() >= 3);
    assert_ne!(
        h.controller.state().await,
        BroadcastState::Connection(ConnectionState::Open)
    );

    task.abort();
}

#[tokio::test]
async fn join_and_leave_post_notices_and_refresh_presence() {
    let server = FakeServer::spawn().await;
    let h = harness(&server.url, Duration::from_secs(60), Duration::from_secs(30));
    let polling = h.presence.spawn_polling(Duration::from_secs(3600));
    let task = h.controller.spawn();

    eventually!("startup presence fetch", server.presence_hits() == 1);
    eventually!("public open", server.public_open_count().await == 1);

    server
        .set_online(&["dev-abc123", "dev-new1"])
        .await;
    server.push_public(Push::Text(
        r#"{"type":"join","device_id":"dev-new1","online":["dev-abc123","dev-new1"]}"#.into(),
    ));
    eventually!(
        "join notice",
        public_texts(&h.hub)
            .await
            .contains(&"User dev-new1 joined".to_string())
    );
    eventually!("refresh after join", server.presence_hits() == 2);
    eventually!(
        "snapshot with newcomer",
        h.presence
            .snapshot()
            .await
            .contains(&DeviceId::from("dev-new1"))
    );

    server.push_public(Push::Text(
        r#"{"type":"leave","device_id":"dev-new1"}"#.into(),
    ));
    eventually!(
        "leave notice",
        public_texts(&h.hub)
            .await
            .contains(&"User dev-new1 left".to_string())
    );
    eventually!("refresh after leave", server.presence_hits() == 3);

    task.abort();
    polling.abort();
}

#[tokio::test]
async fn bad_frames_are_discarded_and_the_connection_survives() {
    let server = FakeServer::spawn().await;
    let h = harness(&server.url, Duration::from_secs(60), Duration::from_millis(50));
    let task = h.controller.spawn();
    eventually!("public open", server.public_open_count().await == 1);

    for frame in [
        "{not json",
        r#"{"type":7}"#,
        r#"{"type":"typing","from":"dev-x"}"#,
        r#"{"type":"pong","ts":1.0}"#,
        r#"{"type":"error","message":"You're sending messages too quickly."}"#,
        r#"{"type":"public_message","from":"dev-xyz999","text":"hi all","ts":2.0}"#,
    ] {
        server.push_public(Push::Text(frame.into()));
    }

    eventually!("public message", h.hub.public_transcript().await.len() == 3);
    let transcript = h.hub.public_transcript().await;
    assert_eq!(transcript[1].author, Author::System);
    assert_eq!(
        transcript[1].text,
        "ERROR: You're sending messages too quickly."
    );
    assert_eq!(
        transcript[2].author,
        Author::Peer(DeviceId::from("dev-xyz999"))
    );
    assert_eq!(transcript[2].text, "hi all");

    assert_eq!(h.controller.connect_attempts(), 1);
    h.controller.send_text("still here").await.expect("send");
    eventually!(
        "frame after garbage",
        server
            .public_frames
            .lock()
            .await
            .contains(&r#"{"type":"message","text":"still here"}"#.to_string())
    );

    task.abort();
}
