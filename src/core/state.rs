// Application state: production collaborators wired into the relay hub.
use crate::channels::directory::ConfigChannelDirectory;
use crate::channels::sender::GraphSender;
use crate::channels::{RelayCollaborators, RelayHub};
use crate::core::clock::SystemClock;
use crate::core::config::Config;
use crate::core::config_store::ConfigStore;
use crate::core::scheduler::TokioScheduler;
use crate::services::dedup::MemoryDedupStore;
use crate::services::generator::{ContentGenerator, DisabledGenerator, HttpContentGenerator};
use crate::services::publish::BroadcastSink;
use crate::services::tenant_policy::ConfigPolicySource;
use crate::storage::{MemoryMessageStore, MessageStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config_store: ConfigStore,
    pub hub: RelayHub,
    pub sink: BroadcastSink,
    pub store: Arc<dyn MessageStore>,
}

impl AppState {
    pub fn new(config_store: ConfigStore, config: &Config) -> Result<Self> {
        let sender = GraphSender::new(
            &config.outbound.base_url,
            &config.outbound.api_version,
            Duration::from_secs(config.outbound.timeout_s.max(1)),
        )
        .context("build outbound sender failed")?;
        let generator = build_generator(config)?;
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let sink = BroadcastSink::new(EVENT_BUFFER);
        let hub = RelayHub::new(
            config,
            RelayCollaborators {
                directory: Arc::new(ConfigChannelDirectory::new(config_store.clone())),
                policy_source: Arc::new(ConfigPolicySource::new(config_store.clone())),
                store: store.clone(),
                sender: Arc::new(sender),
                generator,
                sink: Arc::new(sink.clone()),
                dedup_store: Arc::new(MemoryDedupStore::new()),
                clock: Arc::new(SystemClock),
                scheduler: Arc::new(TokioScheduler),
            },
        );
        Ok(Self::from_parts(config_store, hub, sink, store))
    }

    pub fn from_parts(
        config_store: ConfigStore,
        hub: RelayHub,
        sink: BroadcastSink,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config_store,
            hub,
            sink,
            store,
        }
    }
}

fn build_generator(config: &Config) -> Result<Arc<dyn ContentGenerator>> {
    let endpoint = config
        .generator
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(endpoint) = endpoint else {
        warn!("generator endpoint not configured, automated replies will fail as config_missing");
        return Ok(Arc::new(DisabledGenerator));
    };
    let generator = HttpContentGenerator::new(
        endpoint,
        config.generator.api_key.clone(),
        Duration::from_secs(config.generator.timeout_s.max(1)),
    )
    .context("build content generator failed")?;
    Ok(Arc::new(generator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn builds_with_default_config() {
        let config = Config::default();
        let store = ConfigStore::with_config(
            config.clone(),
            PathBuf::from("missing.yaml"),
            PathBuf::from("missing.override.yaml"),
        );
        let state = AppState::new(store, &config).expect("state");
        assert_eq!(state.hub.queue().sender_count(), 0);
        assert_eq!(state.config_store.version(), 0);
    }
}
