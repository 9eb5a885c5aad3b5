//! Supervisor for the single public channel connection.
//!
//! `idle -> connecting -> open -> closed -> (after reconnect_delay) connecting`.
//! The loop never gives up; it only stops when the session aborts its task.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::DeviceId,
    protocol::{decode, ChannelMessage},
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    error::SessionError,
    events::{Author, EventHub, SessionEvent},
    presence::PresencePoller,
    transport::{ConnectionHandle, ConnectionState, SendError, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Idle,
    Connection(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct BroadcastTiming {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

pub struct BroadcastController {
    url: Url,
    device_id: DeviceId,
    timing: BroadcastTiming,
    current: Mutex<Option<ConnectionHandle>>,
    presence: Arc<PresencePoller>,
    hub: Arc<EventHub>,
    connect_attempts: AtomicU64,
    heartbeats_sent: AtomicU64,
}

impl BroadcastController {
    pub fn new(
        url: Url,
        device_id: DeviceId,
        timing: BroadcastTiming,
        presence: Arc<PresencePoller>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            url,
            device_id,
            timing,
            current: Mutex::new(None),
            presence,
            hub,
            connect_attempts: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run().await })
    }

    pub async fn state(&self) -> BroadcastState {
        match self.current.lock().await.as_ref() {
            Some(handle) => BroadcastState::Connection(handle.state()),
            None => BroadcastState::Idle,
        }
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::SeqCst)
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let current = self.current.lock().await;
        let handle = current.as_ref().ok_or(SessionError::BroadcastNotConnected)?;
        handle
            .send(&ChannelMessage::text(text))
            .map_err(|err| match err {
                SendError::NotOpen(_) => SessionError::BroadcastNotConnected,
                SendError::Session(err) => err,
            })
    }

    /// Closes the live connection, if any. The supervisor task must be aborted
    /// separately or it will reconnect.
    pub async fn close(&self) {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.close();
        }
    }

    async fn run(&self) {
        loop {
            let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(attempt, device_id = %self.device_id, "broadcast: connecting");
            let (handle, mut events) = ConnectionHandle::connect(self.url.clone());
            *self.current.lock().await = Some(handle);
            self.hub
                .emit(SessionEvent::BroadcastStateChanged(ConnectionState::Connecting));

            let period = self.timing.heartbeat_interval;
            let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(TransportEvent::Opened) => {
                            heartbeat.reset();
                            self.hub
                                .emit(SessionEvent::BroadcastStateChanged(ConnectionState::Open));
                            self.hub.notice("Connected to public chat").await;
                        }
                        Some(TransportEvent::Frame(text)) => self.dispatch(&text).await,
                        Some(TransportEvent::Closed(reason)) => {
                            info!(attempt, ?reason, "broadcast: connection closed");
                            break;
                        }
                        None => break,
                    },
                    _ = heartbeat.tick() => self.heartbeat().await,
                }
            }

            self.hub
                .emit(SessionEvent::BroadcastStateChanged(ConnectionState::Closed));
            self.hub.notice("Public socket closed").await;
            debug!(
                delay_ms = self.timing.reconnect_delay.as_millis() as u64,
                "broadcast: reconnect scheduled"
            );
            tokio::time::sleep(self.timing.reconnect_delay).await;
        }
    }

    async fn heartbeat(&self) {
        let current = self.current.lock().await;
        let Some(handle) = current.as_ref() else {
            return;
        };
        let Some(ping) = heartbeat_frame(handle.state()) else {
            trace!(state = %handle.state(), "broadcast: heartbeat skipped");
            return;
        };
        match handle.send(&ping) {
            Ok(()) => {
                self.heartbeats_sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => trace!("broadcast: heartbeat dropped: {err}"),
        }
    }

    async fn dispatch(&self, text: &str) {
        let message = match decode(text) {
            Ok(message) => message,
            Err(err) if err.is_unrecognized() => {
                debug!("broadcast: ignoring frame: {err}");
                return;
            }
            Err(err) => {
                warn!("broadcast: discarding bad frame: {err}");
                return;
            }
        };

        match message {
            ChannelMessage::Join { device_id } => {
                self.hub.notice(format!("User {device_id} joined")).await;
                self.presence.request_refresh();
            }
            ChannelMessage::Leave { device_id } => {
                self.hub.notice(format!("User {device_id} left")).await;
                self.presence.request_refresh();
            }
            ChannelMessage::PublicMessage { text, from } => {
                self.hub.post_public(Author::Peer(from), text).await;
            }
            ChannelMessage::Error { message } => {
                self.hub.notice(format!("ERROR: {message}")).await;
            }
            ChannelMessage::Pong { .. } => trace!("broadcast: pong"),
            other => debug!(kind = other.kind(), "broadcast: ignoring frame type"),
        }
    }
}

/// A ping goes out only on an open connection; otherwise the tick is dropped.
pub fn heartbeat_frame(state: ConnectionState) -> Option<ChannelMessage> {
    (state == ConnectionState::Open).then_some(ChannelMessage::Ping)
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
