use crate::channels::directory::ChannelDirectory;
use crate::channels::resolver::ChannelResolver;
use crate::channels::sender::ChannelSender;
use crate::channels::types::{ChannelEvent, EchoEvent, InboundEvent, MessageType};
use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::core::scheduler::Scheduler;
use crate::services::batch_queue::{BatchQueue, EnqueueDecision, QueueConfig, QueuedMessage};
use crate::services::dedup::{DedupGate, DedupStore};
use crate::services::generator::ContentGenerator;
use crate::services::processor::ReplyProcessor;
use crate::services::publish::{EventSink, RealtimeEvent, EVENT_MESSAGE_CREATED};
use crate::services::reconcile::{EchoReconciler, ReconcileConfig, ReconcileOutcome};
use crate::services::tenant_policy::{PolicySource, TenantPolicy, TenantPolicyCache};
use crate::services::watchdog::{Watchdog, WatchdogConfig};
use crate::storage::{
    DeliveryStatus, MessageDirection, MessageOrigin, MessageRecord, MessageStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DROP_CHANNEL_UNAVAILABLE: &str = "channel_unavailable";
pub const DROP_STORE_ERROR: &str = "store_error";
pub const DROP_RECONCILE_ERROR: &str = "reconcile_error";
pub const DROP_MISSING_SENDER: &str = "missing_sender";

/// External collaborators the relay is wired to.
pub struct RelayCollaborators {
    pub directory: Arc<dyn ChannelDirectory>,
    pub policy_source: Arc<dyn PolicySource>,
    pub store: Arc<dyn MessageStore>,
    pub sender: Arc<dyn ChannelSender>,
    pub generator: Arc<dyn ContentGenerator>,
    pub sink: Arc<dyn EventSink>,
    pub dedup_store: Arc<dyn DedupStore>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Duplicate,
    Dropped(&'static str),
    Enqueued(EnqueueDecision),
    Reconciled(ReconcileOutcome),
}

#[derive(Clone)]
pub struct RelayHub {
    dedup: DedupGate,
    resolver: ChannelResolver,
    policies: TenantPolicyCache,
    queue: BatchQueue,
    reconciler: Arc<EchoReconciler>,
    watchdog: Watchdog,
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    dedup_sweep_interval: Duration,
}

impl RelayHub {
    pub fn new(config: &Config, deps: RelayCollaborators) -> Self {
        let dedup = DedupGate::new(
            deps.dedup_store,
            deps.clock.clone(),
            config.dedup_retention(),
        );
        let resolver = ChannelResolver::new(
            deps.directory,
            deps.clock.clone(),
            Duration::from_secs(config.channels.cache_ttl_s),
        );
        let policies = TenantPolicyCache::new(
            deps.policy_source,
            deps.clock.clone(),
            deps.scheduler.clone(),
            Duration::from_secs(config.tenants.cache_ttl_s),
        );
        let reconciler = Arc::new(EchoReconciler::new(
            deps.store.clone(),
            deps.sink.clone(),
            deps.clock.clone(),
            ReconcileConfig::from(&config.reconcile),
        ));
        let processor = Arc::new(ReplyProcessor::new(
            policies.clone(),
            resolver.clone(),
            deps.sender,
            deps.generator,
            reconciler.clone(),
            deps.store.clone(),
            config.queue.history_limit,
        ));
        let queue = BatchQueue::new(
            processor,
            policies.clone(),
            deps.clock.clone(),
            deps.scheduler,
            QueueConfig::from(&config.queue),
        );
        let watchdog = Watchdog::new(
            queue.clone(),
            reconciler.clone(),
            resolver.clone(),
            policies.clone(),
            WatchdogConfig::from(&config.watchdog),
        );
        let hub = Self {
            dedup,
            resolver,
            policies,
            queue,
            reconciler,
            watchdog,
            store: deps.store,
            sink: deps.sink,
            clock: deps.clock,
            dedup_sweep_interval: config.dedup_sweep_interval(),
        };
        hub.prime_policies(config);
        hub
    }

    /// Warms the policy cache with every tenant policy present in config.
    pub fn prime_policies(&self, config: &Config) {
        for policy in &config.tenants.policies {
            let tenant_id = policy.tenant_id.trim();
            if tenant_id.is_empty() {
                continue;
            }
            self.policies.prime(
                tenant_id,
                TenantPolicy {
                    automation_enabled: policy.automation_enabled,
                    batch_wait_ms: policy.batch_wait_ms,
                },
            );
        }
    }

    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.dedup.spawn_sweeper(self.dedup_sweep_interval),
            self.watchdog.spawn(),
        ]
    }

    pub async fn dispatch(&self, event: ChannelEvent) -> IngestOutcome {
        match event {
            ChannelEvent::Message(event) | ChannelEvent::Postback(event) => self.ingest(event).await,
            ChannelEvent::Echo(echo) => self.ingest_echo(echo).await,
        }
    }

    /// Accepts one inbound message. Never fails: problems are logged and reported in the outcome.
    pub async fn ingest(&self, event: InboundEvent) -> IngestOutcome {
        if !self.dedup.should_process(event.external_id()) {
            return IngestOutcome::Duplicate;
        }
        let sender_id = event.sender_id.trim().to_string();
        if sender_id.is_empty() {
            warn!("inbound event without sender dropped: channel_id={}", event.channel_id);
            return IngestOutcome::Dropped(DROP_MISSING_SENDER);
        }
        let Some(binding) = self.resolver.resolve(&event.channel_id).await else {
            warn!(
                "no connected channel binding, inbound dropped: channel_id={}, sender_id={sender_id}",
                event.channel_id
            );
            return IngestOutcome::Dropped(DROP_CHANNEL_UNAVAILABLE);
        };
        let now = self.clock.now_ms();
        let conversation = match self
            .store
            .ensure_conversation(&binding.tenant_id, &binding.channel_id, &sender_id, now)
            .await
        {
            Ok(conversation) => conversation,
            Err(err) => {
                error!(
                    "ensure conversation failed: channel_id={}, sender_id={sender_id}, error={err}",
                    binding.channel_id
                );
                return IngestOutcome::Dropped(DROP_STORE_ERROR);
            }
        };

        let message_type = if event.content.trim().is_empty() {
            event
                .attachments
                .first()
                .map(|attachment| MessageType::from_attachment_kind(&attachment.kind))
                .unwrap_or_default()
        } else {
            MessageType::Text
        };
        let received_at = event.ts.filter(|ts| *ts > 0).unwrap_or(now);
        let record = MessageRecord {
            message_id: Uuid::new_v4().simple().to_string(),
            conversation_id: conversation.conversation_id.clone(),
            tenant_id: binding.tenant_id.clone(),
            channel_id: binding.channel_id.clone(),
            direction: MessageDirection::Inbound,
            origin: MessageOrigin::Contact,
            message_type,
            content: event.content.clone(),
            attachments: event.attachments.clone(),
            external_id: event.external_id().map(str::to_string),
            reply_to: event.reply_to.clone(),
            referral: event.referral.clone(),
            status: DeliveryStatus::Received,
            generation: None,
            failure_reason: None,
            created_at: received_at,
            updated_at: now,
            reconciled_at: None,
        };
        let candidate_id = record.message_id.clone();
        let stored = match self.store.create_message(record).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(
                    "persist inbound failed: channel_id={}, sender_id={sender_id}, error={err}",
                    binding.channel_id
                );
                return IngestOutcome::Dropped(DROP_STORE_ERROR);
            }
        };
        if stored.message_id != candidate_id {
            debug!(
                "inbound already persisted: external_id={}",
                stored.external_id.as_deref().unwrap_or("")
            );
            return IngestOutcome::Duplicate;
        }
        self.sink.publish(RealtimeEvent::new(
            &binding.tenant_id,
            EVENT_MESSAGE_CREATED,
            serde_json::to_value(&stored).unwrap_or_else(|_| json!({})),
            now,
        ));

        let decision = self.queue.enqueue(
            &sender_id,
            QueuedMessage {
                channel_id: binding.channel_id.clone(),
                conversation_id: conversation.conversation_id,
                message_id: stored.message_id,
                external_id: stored.external_id,
                content: event.content,
                attachments: event.attachments,
                reply_to: event.reply_to,
                referral: event.referral,
                received_at,
            },
            &binding.tenant_id,
        );
        IngestOutcome::Enqueued(decision)
    }

    pub async fn ingest_echo(&self, echo: EchoEvent) -> IngestOutcome {
        if !self.dedup.should_process(Some(echo.message_id.as_str())) {
            return IngestOutcome::Duplicate;
        }
        let Some(binding) = self.resolver.resolve(&echo.channel_id).await else {
            warn!(
                "no connected channel binding, echo dropped: channel_id={}, external_id={}",
                echo.channel_id, echo.message_id
            );
            return IngestOutcome::Dropped(DROP_CHANNEL_UNAVAILABLE);
        };
        match self.reconciler.reconcile_echo(&echo, &binding).await {
            Ok(outcome) => IngestOutcome::Reconciled(outcome),
            Err(err) => {
                error!(
                    "echo reconciliation failed: channel_id={}, external_id={}, error={err:#}",
                    echo.channel_id, echo.message_id
                );
                IngestOutcome::Dropped(DROP_RECONCILE_ERROR)
            }
        }
    }

    pub fn notify_policy_changed(&self, tenant_id: &str) {
        info!("tenant policy changed: tenant_id={tenant_id}");
        self.policies.invalidate(tenant_id);
    }

    pub fn notify_channel_disconnected(&self, channel_id: &str) {
        info!("channel disconnected: channel_id={channel_id}");
        self.resolver.invalidate(channel_id);
    }

    pub fn queue(&self) -> &BatchQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &EchoReconciler {
        &self.reconciler
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn policies(&self) -> &TenantPolicyCache {
        &self.policies
    }
}
