use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::DeviceId;
use storage::KeyValueStore;
use tracing::info;
use uuid::Uuid;

pub const DEVICE_ID_KEY: &str = "ephemeral_device_id";
pub const DEVICE_ID_PREFIX: &str = "dev-";
const DEVICE_ID_SUFFIX_LEN: usize = 8;

/// Hands out the persisted device id, minting one on first use.
#[derive(Clone)]
pub struct DeviceIdentityProvider {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceIdentityProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<DeviceId> {
        if let Some(existing) = self
            .store
            .get(DEVICE_ID_KEY)
            .await
            .context("failed to load device id")?
            .filter(|value| !value.trim().is_empty())
        {
            return Ok(DeviceId::new(existing));
        }

        let device_id = generate_device_id();
        self.store
            .set(DEVICE_ID_KEY, device_id.as_str())
            .await
            .context("failed to persist device id")?;
        info!(%device_id, "identity: generated new device id");
        Ok(device_id)
    }

    /// Forgets the stored id. Whatever session used it must be rebuilt by the caller.
    pub async fn reset(&self) -> Result<()> {
        self.store
            .remove(DEVICE_ID_KEY)
            .await
            .context("failed to clear device id")?;
        info!("identity: device id cleared");
        Ok(())
    }
}

pub fn generate_device_id() -> DeviceId {
    let random = Uuid::new_v4().simple().to_string();
    DeviceId::new(format!(
        "{DEVICE_ID_PREFIX}{}",
        &random[..DEVICE_ID_SUFFIX_LEN]
    ))
}
