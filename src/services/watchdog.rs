use crate::channels::resolver::ChannelResolver;
use crate::core::config::WatchdogSettings;
use crate::services::batch_queue::BatchQueue;
use crate::services::reconcile::EchoReconciler;
use crate::services::tenant_policy::TenantPolicyCache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub queue_idle: Duration,
    pub lock_ceiling: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            queue_idle: Duration::from_secs(300),
            lock_ceiling: Duration::from_secs(300),
        }
    }
}

impl From<&WatchdogSettings> for WatchdogConfig {
    fn from(settings: &WatchdogSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_s.max(1)),
            queue_idle: Duration::from_secs(settings.queue_idle_s.max(1)),
            lock_ceiling: Duration::from_secs(settings.lock_ceiling_s.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted_queues: usize,
    pub released_locks: usize,
    pub expired_generation_tags: usize,
    pub pruned_channels: usize,
    pub pruned_policies: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Watchdog {
    queue: BatchQueue,
    reconciler: Arc<EchoReconciler>,
    resolver: ChannelResolver,
    policies: TenantPolicyCache,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(
        queue: BatchQueue,
        reconciler: Arc<EchoReconciler>,
        resolver: ChannelResolver,
        policies: TenantPolicyCache,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            queue,
            reconciler,
            resolver,
            policies,
            config,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            released_locks: self.queue.release_stuck_locks(self.config.lock_ceiling),
            evicted_queues: self.queue.evict_stale(self.config.queue_idle),
            expired_generation_tags: self.reconciler.sweep(),
            pruned_channels: self.resolver.prune_expired(),
            pruned_policies: self.policies.prune(),
        };
        if !report.is_empty() {
            info!(
                "watchdog sweep: evicted_queues={}, released_locks={}, expired_generation_tags={}, pruned_channels={}, pruned_policies={}",
                report.evicted_queues,
                report.released_locks,
                report.expired_generation_tags,
                report.pruned_channels,
                report.pruned_policies
            );
        }
        report
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                watchdog.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::directory::ChannelDirectory;
    use crate::channels::types::{ChannelBinding, ConnectionStatus};
    use crate::core::clock::{Clock, TokioClock};
    use crate::core::scheduler::{Scheduler, TokioScheduler};
    use crate::services::batch_queue::{BatchProcessor, QueueConfig, QueuedMessage, WorkUnit};
    use crate::services::publish::BroadcastSink;
    use crate::services::reconcile::ReconcileConfig;
    use crate::services::tenant_policy::{PolicySource, TenantPolicy};
    use crate::storage::{GenerationMeta, MemoryMessageStore};
    use anyhow::Result;
    use async_trait::async_trait;

    struct Hanging;

    #[async_trait]
    impl BatchProcessor for Hanging {
        async fn process(&self, _unit: WorkUnit) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Policies;

    #[async_trait]
    impl PolicySource for Policies {
        async fn load_policy(&self, _tenant_id: &str) -> Result<Option<TenantPolicy>> {
            Ok(Some(TenantPolicy::default()))
        }
    }

    struct Directory;

    #[async_trait]
    impl ChannelDirectory for Directory {
        async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelBinding>> {
            Ok(Some(ChannelBinding {
                channel_id: channel_id.to_string(),
                credential: "token".to_string(),
                display_name: String::new(),
                tenant_id: "t1".to_string(),
                status: ConnectionStatus::Connected,
            }))
        }

        async fn connection_status(&self, _channel_id: &str) -> Result<Option<ConnectionStatus>> {
            Ok(Some(ConnectionStatus::Connected))
        }
    }

    fn message(content: &str) -> QueuedMessage {
        QueuedMessage {
            channel_id: "page-1".to_string(),
            conversation_id: "conv-1".to_string(),
            message_id: content.to_string(),
            external_id: None,
            content: content.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            referral: None,
            received_at: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_releases_locks_and_expires_side_state() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::anchored_at(0));
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
        let policies = TenantPolicyCache::new(
            Arc::new(Policies),
            clock.clone(),
            scheduler.clone(),
            Duration::from_secs(60),
        );
        policies.prime("t1", TenantPolicy::default());
        let queue = BatchQueue::new(
            Arc::new(Hanging),
            policies.clone(),
            clock.clone(),
            scheduler,
            QueueConfig {
                hard_timeout: Duration::from_secs(3600),
                ..QueueConfig::default()
            },
        );
        let reconciler = Arc::new(EchoReconciler::new(
            Arc::new(MemoryMessageStore::new()),
            Arc::new(BroadcastSink::default()),
            clock.clone(),
            ReconcileConfig::default(),
        ));
        let resolver =
            ChannelResolver::new(Arc::new(Directory), clock.clone(), Duration::from_secs(300));
        resolver.resolve("page-1").await.expect("binding");
        reconciler.generations().tag(
            "mid.1",
            GenerationMeta {
                generation_id: "g1".to_string(),
                model: None,
                batch_size: 1,
                extra: serde_json::Value::Null,
            },
        );
        let watchdog = Watchdog::new(
            queue.clone(),
            reconciler,
            resolver,
            policies,
            WatchdogConfig::default(),
        );

        queue.enqueue("user-1", message("stuck"), "t1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watchdog.sweep().is_empty());

        tokio::time::sleep(Duration::from_secs(301)).await;
        let report = watchdog.sweep();
        assert_eq!(
            report,
            SweepReport {
                evicted_queues: 1,
                released_locks: 1,
                expired_generation_tags: 0,
                pruned_channels: 1,
                pruned_policies: 1,
            }
        );
        assert!(queue.snapshot("user-1").is_none());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(watchdog.sweep().expired_generation_tags, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_watchdog_sweeps_on_interval() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::anchored_at(0));
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
        let policies = TenantPolicyCache::new(
            Arc::new(Policies),
            clock.clone(),
            scheduler.clone(),
            Duration::from_secs(60),
        );
        let queue = BatchQueue::new(
            Arc::new(Hanging),
            policies.clone(),
            clock.clone(),
            scheduler,
            QueueConfig::default(),
        );
        let reconciler = Arc::new(EchoReconciler::new(
            Arc::new(MemoryMessageStore::new()),
            Arc::new(BroadcastSink::default()),
            clock.clone(),
            ReconcileConfig {
                generation_ttl_ms: 1_000,
                ..ReconcileConfig::default()
            },
        ));
        reconciler.generations().tag(
            "mid.2",
            GenerationMeta {
                generation_id: "g2".to_string(),
                model: None,
                batch_size: 1,
                extra: serde_json::Value::Null,
            },
        );
        let resolver =
            ChannelResolver::new(Arc::new(Directory), clock, Duration::from_secs(300));
        let watchdog = Watchdog::new(
            queue,
            reconciler.clone(),
            resolver,
            policies,
            WatchdogConfig::default(),
        );
        let handle = watchdog.spawn();
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.abort();
        assert!(reconciler.generations().is_empty());
    }
}
