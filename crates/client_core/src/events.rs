//! Session events and per-channel transcripts consumed by the rendering layer.

use chrono::{DateTime, Utc};
use shared::domain::DeviceId;
use tokio::sync::{broadcast, Mutex};

use crate::{presence::PresenceSnapshot, transport::ConnectionState};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    System,
    You,
    Peer(DeviceId),
}

impl Author {
    /// Label shown above a rendered entry.
    pub fn label(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::You => "you".to_string(),
            Self::Peer(id) => format!("from: {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub author: Author,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(author: Author, text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            author,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Broadcast,
    Private(DeviceId),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Appended {
        scope: ChannelScope,
        entry: TranscriptEntry,
    },
    BroadcastStateChanged(ConnectionState),
    PrivateStateChanged {
        peer: DeviceId,
        state: ConnectionState,
    },
    ConversationOpened(DeviceId),
    ConversationClosed(DeviceId),
    PresenceUpdated(PresenceSnapshot),
}

/// Fan-out point for session events; also owns the public transcript.
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
    public: Mutex<Transcript>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sender,
            public: Mutex::new(Transcript::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; transcripts still hold the history.
        let _ = self.sender.send(event);
    }

    pub async fn post_public(&self, author: Author, text: impl Into<String>) {
        let entry = TranscriptEntry::new(author, text);
        self.public.lock().await.push(entry.clone());
        self.emit(SessionEvent::Appended {
            scope: ChannelScope::Broadcast,
            entry,
        });
    }

    pub async fn notice(&self, text: impl Into<String>) {
        self.post_public(Author::System, text).await;
    }

    pub async fn public_transcript(&self) -> Vec<TranscriptEntry> {
        self.public.lock().await.entries().to_vec()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
