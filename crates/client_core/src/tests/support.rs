//! In-process chat server used by the client tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub enum Push {
    Text(String),
    Close,
}

#[derive(Clone)]
pub struct FakeServer {
    pub url: String,
    /// `None` makes `/online-users` answer 500.
    pub online: Arc<Mutex<Option<Vec<String>>>>,
    pub presence_hits: Arc<AtomicUsize>,
    /// Held after the online list is read and before it is answered.
    pub presence_delay: Arc<Mutex<Duration>>,
    /// Held before the public websocket upgrade is accepted.
    pub public_handshake_delay: Arc<Mutex<Duration>>,
    pub public_opens: Arc<Mutex<Vec<(String, Instant)>>>,
    pub public_closes: Arc<Mutex<Vec<Instant>>>,
    pub public_frames: Arc<Mutex<Vec<String>>>,
    pub private_opens: Arc<Mutex<Vec<(String, String)>>>,
    pub private_frames: Arc<Mutex<Vec<(String, String)>>>,
    public_push: broadcast::Sender<Push>,
    private_push: broadcast::Sender<(String, Push)>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (public_push, _) = broadcast::channel(64);
        let (private_push, _) = broadcast::channel(64);
        let server = Self {
            url: format!("http://{addr}"),
            online: Arc::new(Mutex::new(Some(Vec::new()))),
            presence_hits: Arc::new(AtomicUsize::new(0)),
            presence_delay: Arc::new(Mutex::new(Duration::ZERO)),
            public_handshake_delay: Arc::new(Mutex::new(Duration::ZERO)),
            public_opens: Arc::new(Mutex::new(Vec::new())),
            public_closes: Arc::new(Mutex::new(Vec::new())),
            public_frames: Arc::new(Mutex::new(Vec::new())),
            private_opens: Arc::new(Mutex::new(Vec::new())),
            private_frames: Arc::new(Mutex::new(Vec::new())),
            public_push,
            private_push,
        };
        let app = Router::new()
            .route("/online-users", get(online_users))
            .route("/ws/public", get(public_ws))
            .route("/ws/private/:peer", get(private_ws))
            .with_state(server.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        server
    }

    pub async fn set_online(&self, ids: &[&str]) {
        *self.online.lock().await = Some(ids.iter().map(|id| id.to_string()).collect());
    }

    pub async fn fail_presence(&self) {
        *self.online.lock().await = None;
    }

    pub fn presence_hits(&self) -> usize {
        self.presence_hits.load(Ordering::SeqCst)
    }

    pub fn push_public(&self, push: Push) {
        let _ = self.public_push.send(push);
    }

    pub fn push_private(&self, peer: &str, push: Push) {
        let _ = self.private_push.send((peer.to_string(), push));
    }

    pub async fn public_open_count(&self) -> usize {
        self.public_opens.lock().await.len()
    }

    pub async fn private_open_count(&self) -> usize {
        self.private_opens.lock().await.len()
    }

    pub async fn public_pings(&self) -> usize {
        self.public_frames
            .lock()
            .await
            .iter()
            .filter(|frame| frame.contains(r#""type":"ping""#))
            .count()
    }
}

async fn online_users(State(server): State<FakeServer>) -> impl IntoResponse {
    server.presence_hits.fetch_add(1, Ordering::SeqCst);
    let online = server.online.lock().await.clone();
    let delay = *server.presence_delay.lock().await;
    tokio::time::sleep(delay).await;
    match online {
        Some(ids) => Json(ids).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn public_ws(
    ws: WebSocketUpgrade,
    State(server): State<FakeServer>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let device_id = query.get("device_id").cloned().unwrap_or_default();
    let delay = *server.public_handshake_delay.lock().await;
    tokio::time::sleep(delay).await;
    ws.on_upgrade(move |socket| public_connection(server, socket, device_id))
}

async fn public_connection(server: FakeServer, socket: WebSocket, device_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut pushes = server.public_push.subscribe();
    server
        .public_opens
        .lock()
        .await
        .push((device_id, Instant::now()));

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => server.public_frames.lock().await.push(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok(Push::Text(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close) | Err(_) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    server.public_closes.lock().await.push(Instant::now());
}

async fn private_ws(
    ws: WebSocketUpgrade,
    State(server): State<FakeServer>,
    Path(peer): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let from = query.get("from").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| private_connection(server, socket, peer, from))
}

async fn private_connection(server: FakeServer, socket: WebSocket, peer: String, from: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut pushes = server.private_push.subscribe();
    server
        .private_opens
        .lock()
        .await
        .push((peer.clone(), from));

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    server.private_frames.lock().await.push((peer.clone(), text));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok((target, _)) if target != peer => {}
                Ok((_, Push::Text(text))) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok((_, Push::Close)) | Err(_) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Accepts TCP connections and never answers, so handshakes and requests hang.
pub async fn spawn_silent_server() -> String {
    spawn_counting_silent_server().await.0
}

/// Like [`spawn_silent_server`], also counting accepted connections.
pub async fn spawn_counting_silent_server() -> (String, Arc<AtomicUsize>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });
    (format!("http://{addr}"), accepted)
}

/// Re-evaluates `$cond` until it holds, panicking after a few seconds.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !($cond) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
