// Channel resolver: TTL cache over the channel directory.
// A cached "connected" entry is re-validated on every call; "disconnected" is never served from cache.

use crate::channels::directory::ChannelDirectory;
use crate::channels::types::{ChannelBinding, ConnectionStatus};
use crate::core::clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedBinding {
    binding: ChannelBinding,
    cached_at: i64,
}

struct ResolverInner {
    directory: Arc<dyn ChannelDirectory>,
    clock: Arc<dyn Clock>,
    cache: DashMap<String, CachedBinding>,
    ttl_ms: i64,
}

#[derive(Clone)]
pub struct ChannelResolver {
    inner: Arc<ResolverInner>,
}

impl ChannelResolver {
    pub fn new(directory: Arc<dyn ChannelDirectory>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                directory,
                clock,
                cache: DashMap::new(),
                ttl_ms: ttl.as_millis() as i64,
            }),
        }
    }

    pub async fn resolve(&self, channel_id: &str) -> Option<ChannelBinding> {
        let cleaned = channel_id.trim();
        if cleaned.is_empty() {
            return None;
        }
        let now = self.inner.clock.now_ms();
        let cached = self
            .inner
            .cache
            .get(cleaned)
            .map(|entry| entry.clone())
            .filter(|entry| now - entry.cached_at <= self.inner.ttl_ms);

        if let Some(cached) = cached {
            return match self.inner.directory.connection_status(cleaned).await {
                Ok(Some(ConnectionStatus::Connected)) => Some(cached.binding),
                Ok(Some(ConnectionStatus::Disconnected)) | Ok(None) => {
                    debug!("channel no longer connected, evicting: channel_id={cleaned}");
                    self.inner.cache.remove(cleaned);
                    None
                }
                Err(err) => {
                    warn!(
                        "channel status check failed, trusting cached binding: channel_id={cleaned}, error={err}"
                    );
                    Some(cached.binding)
                }
            };
        }

        let binding = match self.inner.directory.lookup(cleaned).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                self.inner.cache.remove(cleaned);
                return None;
            }
            Err(err) => {
                warn!("channel lookup failed: channel_id={cleaned}, error={err}");
                return None;
            }
        };
        if !binding.is_connected() {
            self.inner.cache.remove(cleaned);
            return None;
        }
        self.inner.cache.insert(
            cleaned.to_string(),
            CachedBinding {
                binding: binding.clone(),
                cached_at: now,
            },
        );
        Some(binding)
    }

    pub fn invalidate(&self, channel_id: &str) {
        self.inner.cache.remove(channel_id.trim());
    }

    pub fn prune_expired(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let ttl_ms = self.inner.ttl_ms;
        let before = self.inner.cache.len();
        self.inner
            .cache
            .retain(|_, entry| now - entry.cached_at <= ttl_ms);
        before.saturating_sub(self.inner.cache.len())
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }
}
