// Tenant policy cache: stale-while-refresh lookups with push invalidation.

use crate::core::clock::Clock;
use crate::core::config_store::ConfigStore;
use crate::core::scheduler::Scheduler;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Entries this many TTLs old are dropped by `prune`.
const PRUNE_TTL_FACTOR: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TenantPolicy {
    #[serde(default)]
    pub automation_enabled: bool,
    #[serde(default)]
    pub batch_wait_ms: u64,
}

impl TenantPolicy {
    /// Whether inbound messages go straight to processing with no debounce.
    pub fn is_passthrough(&self) -> bool {
        !self.automation_enabled || self.batch_wait_ms == 0
    }
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_policy(&self, tenant_id: &str) -> Result<Option<TenantPolicy>>;
}

pub struct ConfigPolicySource {
    config_store: ConfigStore,
}

impl ConfigPolicySource {
    pub fn new(config_store: ConfigStore) -> Self {
        Self { config_store }
    }
}

#[async_trait]
impl PolicySource for ConfigPolicySource {
    async fn load_policy(&self, tenant_id: &str) -> Result<Option<TenantPolicy>> {
        Ok(self
            .config_store
            .read(|config| {
                config.find_policy(tenant_id).map(|policy| TenantPolicy {
                    automation_enabled: policy.automation_enabled,
                    batch_wait_ms: policy.batch_wait_ms,
                })
            })
            .await)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPolicy {
    policy: TenantPolicy,
    fetched_at: i64,
}

struct PolicyCacheInner {
    entries: DashMap<String, CachedPolicy>,
    epochs: DashMap<String, u64>,
    refreshing: DashMap<String, u64>,
    source: Arc<dyn PolicySource>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    ttl_ms: i64,
}

#[derive(Clone)]
pub struct TenantPolicyCache {
    inner: Arc<PolicyCacheInner>,
}

impl TenantPolicyCache {
    pub fn new(
        source: Arc<dyn PolicySource>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PolicyCacheInner {
                entries: DashMap::new(),
                epochs: DashMap::new(),
                refreshing: DashMap::new(),
                source,
                clock,
                scheduler,
                ttl_ms: ttl.as_millis() as i64,
            }),
        }
    }

    /// Never waits on the source. A stale entry is returned as is and a miss
    /// returns the passthrough default; both schedule a background refresh.
    pub fn get_policy(&self, tenant_id: &str) -> TenantPolicy {
        let now = self.inner.clock.now_ms();
        let cached = self.inner.entries.get(tenant_id).map(|entry| *entry);
        match cached {
            Some(cached) => {
                if now - cached.fetched_at > self.inner.ttl_ms {
                    self.refresh_in_background(tenant_id);
                }
                cached.policy
            }
            None => {
                self.refresh_in_background(tenant_id);
                TenantPolicy::default()
            }
        }
    }

    /// Cache-or-fetch. Used where the answer must come from the source when the cache is cold.
    pub async fn load(&self, tenant_id: &str) -> TenantPolicy {
        let now = self.inner.clock.now_ms();
        if let Some(cached) = self.inner.entries.get(tenant_id).map(|entry| *entry) {
            if now - cached.fetched_at <= self.inner.ttl_ms {
                return cached.policy;
            }
        }
        let epoch = self.current_epoch(tenant_id);
        match self.fetch(tenant_id).await {
            Some(policy) => {
                self.store(tenant_id, policy, epoch);
                policy
            }
            None => self
                .inner
                .entries
                .get(tenant_id)
                .map(|entry| entry.policy)
                .unwrap_or_default(),
        }
    }

    pub fn prime(&self, tenant_id: &str, policy: TenantPolicy) {
        let epoch = self.current_epoch(tenant_id);
        self.store(tenant_id, policy, epoch);
    }

    /// Drops the cached entry and fetches the new value in the background.
    pub fn invalidate(&self, tenant_id: &str) {
        let cleaned = tenant_id.trim();
        if cleaned.is_empty() {
            return;
        }
        *self.inner.epochs.entry(cleaned.to_string()).or_insert(0) += 1;
        self.inner.entries.remove(cleaned);
        self.inner.refreshing.remove(cleaned);
        debug!("tenant policy invalidated: tenant_id={cleaned}");
        self.refresh_in_background(cleaned);
    }

    pub fn prune(&self) -> usize {
        let cutoff = self.inner.clock.now_ms() - self.inner.ttl_ms * PRUNE_TTL_FACTOR;
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, cached| cached.fetched_at >= cutoff);
        before.saturating_sub(self.inner.entries.len())
    }

    pub fn cached(&self, tenant_id: &str) -> Option<TenantPolicy> {
        self.inner.entries.get(tenant_id).map(|entry| entry.policy)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn current_epoch(&self, tenant_id: &str) -> u64 {
        self.inner
            .epochs
            .get(tenant_id)
            .map(|epoch| *epoch)
            .unwrap_or(0)
    }

    fn store(&self, tenant_id: &str, policy: TenantPolicy, epoch: u64) {
        // A fetch started before an invalidation must not overwrite newer data.
        if self.current_epoch(tenant_id) != epoch {
            return;
        }
        self.inner.entries.insert(
            tenant_id.to_string(),
            CachedPolicy {
                policy,
                fetched_at: self.inner.clock.now_ms(),
            },
        );
    }

    async fn fetch(&self, tenant_id: &str) -> Option<TenantPolicy> {
        match self.inner.source.load_policy(tenant_id).await {
            Ok(Some(policy)) => Some(policy),
            Ok(None) => {
                warn!("tenant policy missing, using passthrough default: tenant_id={tenant_id}");
                Some(TenantPolicy::default())
            }
            Err(err) => {
                warn!("tenant policy fetch failed: tenant_id={tenant_id}, error={err}");
                None
            }
        }
    }

    fn refresh_in_background(&self, tenant_id: &str) {
        let cleaned = tenant_id.trim();
        if cleaned.is_empty() {
            return;
        }
        let epoch = self.current_epoch(cleaned);
        if self
            .inner
            .refreshing
            .insert(cleaned.to_string(), epoch)
            .is_some_and(|running| running == epoch)
        {
            return;
        }
        let cache = self.clone();
        let tenant_id = cleaned.to_string();
        self.inner.scheduler.spawn(Box::pin(async move {
            if let Some(policy) = cache.fetch(&tenant_id).await {
                cache.store(&tenant_id, policy, epoch);
            }
            cache
                .inner
                .refreshing
                .remove_if(&tenant_id, |_, running| *running == epoch);
        }));
    }
}
