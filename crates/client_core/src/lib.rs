use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::domain::DeviceId;
use storage::KeyValueStore;
use tokio::{
    sync::{broadcast as event_channel, Mutex},
    task::JoinHandle,
};
use tracing::info;

#[cfg(test)]
#[macro_use]
#[path = "tests/support.rs"]
mod test_support;

pub mod broadcast;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod identity;
pub mod presence;
pub mod private;
pub mod transport;

pub use broadcast::{BroadcastController, BroadcastState, BroadcastTiming};
pub use config::{load_config, ClientConfig};
pub use endpoints::Endpoints;
pub use error::SessionError;
pub use events::{Author, ChannelScope, EventHub, SessionEvent, TranscriptEntry};
pub use identity::DeviceIdentityProvider;
pub use presence::{PresenceEntry, PresencePoller, PresenceSnapshot};
pub use private::{PrivateChannelRegistry, StaleEntryPolicy};
pub use transport::{ConnectionHandle, ConnectionState};

/// The operations a rendering layer drives.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    fn device_id(&self) -> &DeviceId;
    async fn send_broadcast(&self, text: &str) -> Result<(), SessionError>;
    async fn open_private(&self, peer: &DeviceId) -> Result<(), SessionError>;
    async fn send_private(&self, peer: &DeviceId, text: &str) -> Result<(), SessionError>;
    async fn close_private(&self, peer: &DeviceId);
    async fn refresh_presence(&self) -> PresenceSnapshot;
    async fn reset_identity(&self) -> Result<()>;
    fn subscribe_events(&self) -> event_channel::Receiver<SessionEvent>;
}

/// One running chat session: the public channel, private conversations and
/// presence polling, all tied to a single device id.
///
/// Call [`Session::shutdown`] to tear it down; dropping only stops the timers.
pub struct Session {
    config: ClientConfig,
    identity: DeviceIdentityProvider,
    device_id: DeviceId,
    hub: Arc<EventHub>,
    broadcast: Arc<BroadcastController>,
    registry: Arc<PrivateChannelRegistry>,
    presence: Arc<PresencePoller>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Resolves the device id, connects the public channel and starts polling presence.
    pub async fn start(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let identity = DeviceIdentityProvider::new(store);
        let device_id = identity.get().await?;
        let endpoints = Endpoints::new(&config.server_url)
            .with_context(|| format!("invalid server url '{}'", config.server_url))?;
        let hub = Arc::new(EventHub::new());

        let presence = Arc::new(
            PresencePoller::new(
                Client::new(),
                endpoints.presence()?,
                device_id.clone(),
                Arc::clone(&hub),
            )
            .with_fetch_timeout(config.presence_interval),
        );
        let broadcast = Arc::new(BroadcastController::new(
            endpoints.broadcast(&device_id)?,
            device_id.clone(),
            BroadcastTiming {
                heartbeat_interval: config.heartbeat_interval,
                reconnect_delay: config.reconnect_delay,
            },
            Arc::clone(&presence),
            Arc::clone(&hub),
        ));
        let registry = Arc::new(PrivateChannelRegistry::new(
            device_id.clone(),
            endpoints,
            config.stale_entry_policy,
            Arc::clone(&hub),
        ));

        let tasks = vec![
            broadcast.spawn(),
            presence.spawn_polling(config.presence_interval),
        ];
        info!(%device_id, server_url = %config.server_url, "session: started");

        Ok(Self {
            config,
            identity,
            device_id,
            hub,
            broadcast,
            registry,
            presence,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn subscribe_events(&self) -> event_channel::Receiver<SessionEvent> {
        self.hub.subscribe()
    }

    pub async fn send_broadcast(&self, text: &str) -> Result<(), SessionError> {
        let text = non_empty(text)?;
        self.broadcast.send_text(text).await
    }

    /// Rejects the local device; self-conversations are never opened.
    pub async fn open_private(&self, peer: &DeviceId) -> Result<ConnectionHandle, SessionError> {
        if peer == &self.device_id {
            return Err(SessionError::SelfConversation);
        }
        self.registry.open(peer).await
    }

    pub async fn send_private(&self, peer: &DeviceId, text: &str) -> Result<(), SessionError> {
        let text = non_empty(text)?;
        self.registry.send(peer, text).await
    }

    pub async fn close_private(&self, peer: &DeviceId) {
        self.registry.close(peer).await;
    }

    pub async fn refresh_presence(&self) -> PresenceSnapshot {
        self.presence.refresh().await
    }

    pub async fn presence(&self) -> PresenceSnapshot {
        self.presence.snapshot().await
    }

    pub async fn broadcast_state(&self) -> BroadcastState {
        self.broadcast.state().await
    }

    pub async fn public_transcript(&self) -> Vec<TranscriptEntry> {
        self.hub.public_transcript().await
    }

    pub async fn private_transcript(&self, peer: &DeviceId) -> Option<Vec<TranscriptEntry>> {
        self.registry.transcript(peer).await
    }

    pub async fn private_state(&self, peer: &DeviceId) -> Option<ConnectionState> {
        self.registry.state(peer).await
    }

    pub async fn open_conversations(&self) -> Vec<DeviceId> {
        self.registry.peers().await
    }

    /// Stops reconnects and polling, then closes every connection.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.broadcast.close().await;
        self.registry.close_all().await;
        info!(device_id = %self.device_id, "session: shut down");
    }

    /// Shuts the session down and forgets the device id. The caller starts a
    /// new session afterwards; nothing here is reusable.
    pub async fn reset_identity(&self) -> Result<()> {
        self.shutdown().await;
        self.identity.reset().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl ChatHandle for Session {
    fn device_id(&self) -> &DeviceId {
        Session::device_id(self)
    }

    async fn send_broadcast(&self, text: &str) -> Result<(), SessionError> {
        Session::send_broadcast(self, text).await
    }

    async fn open_private(&self, peer: &DeviceId) -> Result<(), SessionError> {
        Session::open_private(self, peer).await.map(|_| ())
    }

    async fn send_private(&self, peer: &DeviceId, text: &str) -> Result<(), SessionError> {
        Session::send_private(self, peer, text).await
    }

    async fn close_private(&self, peer: &DeviceId) {
        Session::close_private(self, peer).await
    }

    async fn refresh_presence(&self) -> PresenceSnapshot {
        Session::refresh_presence(self).await
    }

    async fn reset_identity(&self) -> Result<()> {
        Session::reset_identity(self).await
    }

    fn subscribe_events(&self) -> event_channel::Receiver<SessionEvent> {
        Session::subscribe_events(self)
    }
}

fn non_empty(text: &str) -> Result<&str, SessionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SessionError::EmptyMessage);
    }
    Ok(trimmed)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
