use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::Client;
use shared::domain::DeviceId;
use tokio::{
    sync::{Mutex, Notify, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};
use url::Url;

use crate::events::{EventHub, SessionEvent};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub device_id: DeviceId,
    pub is_self: bool,
}

/// Connected device ids in server order; the local device is flagged, not removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    entries: Vec<PresenceEntry>,
}

impl PresenceSnapshot {
    pub fn new(ids: Vec<DeviceId>, local: &DeviceId) -> Self {
        let entries = ids
            .into_iter()
            .map(|device_id| PresenceEntry {
                is_self: &device_id == local,
                device_id,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[PresenceEntry] {
        &self.entries
    }

    pub fn peers(&self) -> impl Iterator<Item = &DeviceId> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_self)
            .map(|entry| &entry.device_id)
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.entries
            .iter()
            .any(|entry| &entry.device_id == device_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PresencePoller {
    http: Client,
    url: Url,
    local: DeviceId,
    fetch_timeout: Duration,
    snapshot: RwLock<PresenceSnapshot>,
    /// Held for a whole fetch-and-store so snapshots land in request order.
    in_flight: Mutex<()>,
    wake: Notify,
    hub: Arc<EventHub>,
}

impl PresencePoller {
    pub fn new(http: Client, url: Url, local: DeviceId, hub: Arc<EventHub>) -> Self {
        Self {
            http,
            url,
            local,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            snapshot: RwLock::new(PresenceSnapshot::default()),
            in_flight: Mutex::new(()),
            wake: Notify::new(),
            hub,
        }
    }

    /// Bounds each fetch, so a server that never answers cannot stall polling.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub async fn snapshot(&self) -> PresenceSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Fetches the online list. On failure the previous snapshot is kept and returned.
    ///
    /// Refreshes run one at a time in call order; a later caller waits for the
    /// fetch ahead of it instead of racing it.
    pub async fn refresh(&self) -> PresenceSnapshot {
        let _turn = self.in_flight.lock().await;
        match self.fetch().await {
            Ok(ids) => {
                let snapshot = PresenceSnapshot::new(ids, &self.local);
                *self.snapshot.write().await = snapshot.clone();
                debug!(online = snapshot.len(), "presence: refreshed");
                self.hub
                    .emit(SessionEvent::PresenceUpdated(snapshot.clone()));
                snapshot
            }
            Err(err) => {
                warn!(url = %self.url, "presence: refresh failed, keeping previous list: {err:#}");
                self.snapshot().await
            }
        }
    }

    /// Asks the polling task for an out-of-band refresh. Requests made while a
    /// refresh is running coalesce into one more fetch.
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }

    /// Refreshes immediately, then every `interval` and whenever
    /// [`Self::request_refresh`] is called.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = poller.wake.notified() => {}
                }
                poller.refresh().await;
            }
        })
    }

    async fn fetch(&self) -> Result<Vec<DeviceId>> {
        let ids = self
            .http
            .get(self.url.clone())
            .timeout(self.fetch_timeout)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?
            .error_for_status()?
            .json::<Vec<DeviceId>>()
            .await
            .context("online list is not a json array of ids")?;
        Ok(ids)
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
