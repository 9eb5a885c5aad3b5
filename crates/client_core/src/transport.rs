//! One websocket connection driven by its own task.
//!
//! The task owns the socket; callers hold a [`ConnectionHandle`] that exposes
//! the current [`ConnectionState`] and queues outbound frames in call order.
//! Inbound frames are delivered, undecoded and in arrival order, on the
//! receiver returned by [`ConnectionHandle::connect`].

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use futures::{SinkExt, StreamExt};
use shared::protocol::{encode, ChannelMessage};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through [`ConnectionHandle::close`] or by dropping every handle.
    Local,
    Remote,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed(CloseReason),
}

enum Outbound {
    Frame(String),
    Close,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    url: Url,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Starts connecting in the background. There is no connect timeout: a
    /// handshake that never resolves stays `Connecting` until closed.
    pub fn connect(url: Url) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            id,
            url.clone(),
            state_tx,
            outbound_rx,
            events_tx,
        ));

        (
            Self {
                id,
                url,
                state: state_rx,
                outbound: outbound_tx,
            },
            events_rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queues a frame. Only an `Open` connection accepts frames; nothing is
    /// buffered for later delivery.
    pub fn send(&self, message: &ChannelMessage) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen(self.state()));
        }
        let text = encode(message).map_err(SessionError::from)?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| SendError::NotOpen(ConnectionState::Closed))
    }

    /// Frames queued before this call are still written before the close frame.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is {0}")]
    NotOpen(ConnectionState),
    #[error(transparent)]
    Session(#[from] SessionError),
}

async fn run_connection(
    id: u64,
    url: Url,
    state: watch::Sender<ConnectionState>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = outbound.recv() => {
            debug!(connection = id, %url, "ws: closed before handshake completed");
            let _ = state.send(ConnectionState::Closed);
            let _ = events.send(TransportEvent::Closed(CloseReason::Local));
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(err) => {
            warn!(connection = id, %url, "ws: connect failed: {err}");
            let _ = state.send(ConnectionState::Closed);
            let _ = events.send(TransportEvent::Closed(CloseReason::Failed(err.to_string())));
            return;
        }
    };

    info!(connection = id, %url, "ws: open");
    let _ = state.send(ConnectionState::Open);
    let _ = events.send(TransportEvent::Opened);

    let (mut writer, mut reader) = ws_stream.split();
    let reason = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        break CloseReason::Failed(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = state.send(ConnectionState::Closing);
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    break CloseReason::Local;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame(text));
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::Remote,
                Some(Ok(_)) => {}
                Some(Err(err)) => break CloseReason::Failed(err.to_string()),
            },
        }
    };

    info!(connection = id, %url, ?reason, "ws: closed");
    let _ = state.send(ConnectionState::Closed);
    let _ = events.send(TransportEvent::Closed(reason));
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
