//! Registry of private conversations, one connection per peer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Deserialize;
use shared::{
    domain::DeviceId,
    protocol::{decode, ChannelMessage},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    endpoints::Endpoints,
    error::SessionError,
    events::{Author, ChannelScope, EventHub, SessionEvent, Transcript, TranscriptEntry},
    transport::{ConnectionHandle, ConnectionState, SendError, TransportEvent},
};

/// What `open` does when the peer's previous connection was closed by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleEntryPolicy {
    /// A closed entry still blocks `open` until `close` clears it.
    #[default]
    RejectUntilClosed,
    /// A closed entry is evicted and replaced by the new conversation.
    EvictClosed,
}

struct PrivateConversation {
    conversation_id: u64,
    handle: ConnectionHandle,
    transcript: Transcript,
    dispatcher: JoinHandle<()>,
}

pub struct PrivateChannelRegistry {
    local: DeviceId,
    endpoints: Endpoints,
    policy: StaleEntryPolicy,
    hub: Arc<EventHub>,
    entries: Mutex<HashMap<DeviceId, PrivateConversation>>,
    next_conversation_id: AtomicU64,
}

impl PrivateChannelRegistry {
    pub fn new(
        local: DeviceId,
        endpoints: Endpoints,
        policy: StaleEntryPolicy,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            local,
            endpoints,
            policy,
            hub,
            entries: Mutex::new(HashMap::new()),
            next_conversation_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> StaleEntryPolicy {
        self.policy
    }

    pub async fn open(self: &Arc<Self>, peer: &DeviceId) -> Result<ConnectionHandle, SessionError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(peer) {
            let stale = existing.handle.state() == ConnectionState::Closed;
            if !(stale && self.policy == StaleEntryPolicy::EvictClosed) {
                return Err(SessionError::ConversationAlreadyOpen(peer.clone()));
            }
            if let Some(evicted) = entries.remove(peer) {
                evicted.dispatcher.abort();
                info!(%peer, "private: evicted closed conversation");
            }
        }

        let url = self.endpoints.private(peer, &self.local)?;
        let (handle, events) = ConnectionHandle::connect(url);
        let conversation_id = self.next_conversation_id.fetch_add(1, Ordering::Relaxed);
        let dispatcher = self.spawn_dispatcher(conversation_id, peer.clone(), events);
        entries.insert(
            peer.clone(),
            PrivateConversation {
                conversation_id,
                handle: handle.clone(),
                transcript: Transcript::default(),
                dispatcher,
            },
        );
        drop(entries);

        info!(%peer, conversation_id, "private: conversation opened");
        self.hub.emit(SessionEvent::ConversationOpened(peer.clone()));
        Ok(handle)
    }

    /// Sends and locally echoes `text`; the server never echoes our own message back.
    pub async fn send(&self, peer: &DeviceId, text: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(peer)
            .ok_or_else(|| SessionError::NoConversation(peer.clone()))?;
        entry
            .handle
            .send(&ChannelMessage::private_text(text, peer.clone()))
            .map_err(|err| match err {
                SendError::NotOpen(_) => SessionError::ConversationNotConnected(peer.clone()),
                SendError::Session(err) => err,
            })?;
        let echo = TranscriptEntry::new(Author::You, text);
        entry.transcript.push(echo.clone());
        drop(entries);

        self.hub.emit(SessionEvent::Appended {
            scope: ChannelScope::Private(peer.clone()),
            entry: echo,
        });
        Ok(())
    }

    /// Idempotent: closing an unknown peer does nothing.
    pub async fn close(&self, peer: &DeviceId) {
        let Some(entry) = self.entries.lock().await.remove(peer) else {
            debug!(%peer, "private: close for unknown conversation ignored");
            return;
        };
        entry.handle.close();
        entry.dispatcher.abort();
        info!(%peer, "private: conversation closed");
        self.hub.emit(SessionEvent::ConversationClosed(peer.clone()));
    }

    pub async fn close_all(&self) {
        let drained: Vec<(DeviceId, PrivateConversation)> =
            self.entries.lock().await.drain().collect();
        for (peer, entry) in drained {
            entry.handle.close();
            entry.dispatcher.abort();
            self.hub.emit(SessionEvent::ConversationClosed(peer));
        }
    }

    pub async fn state(&self, peer: &DeviceId) -> Option<ConnectionState> {
        self.entries
            .lock()
            .await
            .get(peer)
            .map(|entry| entry.handle.state())
    }

    pub async fn transcript(&self, peer: &DeviceId) -> Option<Vec<TranscriptEntry>> {
        self.entries
            .lock()
            .await
            .get(peer)
            .map(|entry| entry.transcript.entries().to_vec())
    }

    pub async fn peers(&self) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self.entries.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        conversation_id: u64,
        peer: DeviceId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Opened => {
                        registry.emit_state(&peer, ConnectionState::Open);
                        registry
                            .append(conversation_id, &peer, Author::System, "Private socket open")
                            .await;
                    }
                    TransportEvent::Frame(text) => {
                        registry.dispatch(conversation_id, &peer, &text).await;
                    }
                    TransportEvent::Closed(reason) => {
                        info!(%peer, ?reason, "private: connection closed");
                        registry.emit_state(&peer, ConnectionState::Closed);
                        registry
                            .append(conversation_id, &peer, Author::System, "Private socket closed")
                            .await;
                        break;
                    }
                }
            }
        })
    }

    async fn dispatch(&self, conversation_id: u64, peer: &DeviceId, text: &str) {
        let message = match decode(text) {
            Ok(message) => message,
            Err(err) if err.is_unrecognized() => {
                debug!(%peer, "private: ignoring frame: {err}");
                return;
            }
            Err(err) => {
                warn!(%peer, "private: discarding bad frame: {err}");
                return;
            }
        };

        match message {
            ChannelMessage::PrivateRequest { from } => {
                self.append(
                    conversation_id,
                    peer,
                    Author::System,
                    format!("{from} requested private chat"),
                )
                .await;
            }
            ChannelMessage::PrivateMessage { text, from } => {
                self.append(conversation_id, peer, Author::Peer(from), text)
                    .await;
            }
            ChannelMessage::Error { message } => {
                self.hub.notice(format!("Private ERROR: {message}")).await;
            }
            ChannelMessage::Info { message } => {
                self.hub.notice(format!("Info: {message}")).await;
            }
            other => debug!(%peer, kind = other.kind(), "private: ignoring frame type"),
        }
    }

    /// Appends to the conversation only if it is still the one the event came from.
    async fn append(
        &self,
        conversation_id: u64,
        peer: &DeviceId,
        author: Author,
        text: impl Into<String>,
    ) {
        let entry = TranscriptEntry::new(author, text);
        {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(peer) {
                Some(conversation) if conversation.conversation_id == conversation_id => {
                    conversation.transcript.push(entry.clone());
                }
                _ => return,
            }
        }
        self.hub.emit(SessionEvent::Appended {
            scope: ChannelScope::Private(peer.clone()),
            entry,
        });
    }

    fn emit_state(&self, peer: &DeviceId, state: ConnectionState) {
        self.hub.emit(SessionEvent::PrivateStateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

#[cfg(test)]
#[path = "tests/private_tests.rs"]
mod tests;
