use crate::channels::types::{ChannelBinding, ConnectionStatus};
use crate::core::config_store::ConfigStore;
use anyhow::Result;
use async_trait::async_trait;

/// Source of truth for channel credentials and connection state.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelBinding>>;

    async fn connection_status(&self, channel_id: &str) -> Result<Option<ConnectionStatus>>;
}

pub struct ConfigChannelDirectory {
    config_store: ConfigStore,
}

impl ConfigChannelDirectory {
    pub fn new(config_store: ConfigStore) -> Self {
        Self { config_store }
    }
}

#[async_trait]
impl ChannelDirectory for ConfigChannelDirectory {
    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelBinding>> {
        Ok(self
            .config_store
            .read(|config| {
                config.find_binding(channel_id).map(|binding| ChannelBinding {
                    channel_id: binding.channel_id.trim().to_string(),
                    credential: binding.credential.clone(),
                    display_name: binding.display_name.clone(),
                    tenant_id: binding.tenant_id.trim().to_string(),
                    status: binding.status,
                })
            })
            .await)
    }

    async fn connection_status(&self, channel_id: &str) -> Result<Option<ConnectionStatus>> {
        Ok(self
            .config_store
            .read(|config| config.find_binding(channel_id).map(|binding| binding.status))
            .await)
    }
}
