// Downstream processing of a work unit: policy check, generation, and outbound send.

use crate::channels::resolver::ChannelResolver;
use crate::channels::sender::ChannelSender;
use crate::channels::types::{ChannelBinding, MessageType};
use crate::core::error::{classify, ErrorClass};
use crate::services::batch_queue::{BatchProcessor, WorkUnit};
use crate::services::generator::{
    ContentGenerator, GeneratedReply, GenerationOutcome, GenerationRequest, HistoryTurn,
};
use crate::services::reconcile::{EchoReconciler, OutboundDraft};
use crate::services::tenant_policy::TenantPolicyCache;
use crate::storage::{GenerationMeta, MessageDirection, MessageOrigin, MessageStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ReplyProcessor {
    policies: TenantPolicyCache,
    resolver: ChannelResolver,
    sender: Arc<dyn ChannelSender>,
    generator: Arc<dyn ContentGenerator>,
    reconciler: Arc<EchoReconciler>,
    store: Arc<dyn MessageStore>,
    history_limit: usize,
}

impl ReplyProcessor {
    pub fn new(
        policies: TenantPolicyCache,
        resolver: ChannelResolver,
        sender: Arc<dyn ChannelSender>,
        generator: Arc<dyn ContentGenerator>,
        reconciler: Arc<EchoReconciler>,
        store: Arc<dyn MessageStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            policies,
            resolver,
            sender,
            generator,
            reconciler,
            store,
            history_limit,
        }
    }

    async fn load_history(&self, unit: &WorkUnit) -> Vec<HistoryTurn> {
        if self.history_limit == 0 {
            return Vec::new();
        }
        let in_unit: HashSet<&str> = unit
            .entries
            .iter()
            .map(|entry| entry.payload.message_id.as_str())
            .collect();
        match self
            .store
            .recent_messages(&unit.conversation_id, self.history_limit + in_unit.len())
            .await
        {
            Ok(records) => records
                .into_iter()
                .filter(|record| !in_unit.contains(record.message_id.as_str()))
                .map(|record| HistoryTurn {
                    role: match record.direction {
                        MessageDirection::Inbound => "user".to_string(),
                        MessageDirection::Outbound => "assistant".to_string(),
                    },
                    content: record.content,
                    ts: record.created_at,
                })
                .collect(),
            Err(err) => {
                warn!(
                    "load conversation history failed: conversation_id={}, error={err}",
                    unit.conversation_id
                );
                Vec::new()
            }
        }
    }

    async fn deliver(
        &self,
        unit: &WorkUnit,
        binding: &ChannelBinding,
        reply: GeneratedReply,
    ) -> Result<()> {
        let meta = GenerationMeta {
            generation_id: reply.generation_id.clone(),
            model: reply.model.clone(),
            batch_size: unit.len(),
            extra: json!({ "relief": unit.relief }),
        };
        let mut parts = Vec::new();
        if let Some(text) = reply.text {
            parts.push((MessageType::Text, text));
        }
        parts.extend(reply.images.into_iter().map(|url| (MessageType::Image, url)));

        for (message_type, content) in parts {
            let record = self
                .reconciler
                .record_provisional(OutboundDraft {
                    tenant_id: unit.tenant_id.clone(),
                    channel_id: unit.channel_id.clone(),
                    conversation_id: unit.conversation_id.clone(),
                    content: content.clone(),
                    message_type,
                    attachments: Vec::new(),
                    origin: MessageOrigin::Agent,
                    generation: Some(meta.clone()),
                    reply_to: None,
                })
                .await?;
            match self
                .sender
                .send(binding, &unit.sender_id, &content, message_type)
                .await
            {
                Ok(receipt) if receipt.success => {
                    self.reconciler
                        .confirm_send(&record, receipt.external_id.as_deref())
                        .await?;
                }
                Ok(_) => {
                    self.reconciler
                        .mark_failed(&record, "channel reported send failure")
                        .await?;
                    return Err(anyhow!(
                        "send rejected by channel: channel_id={}, sender_id={}",
                        unit.channel_id,
                        unit.sender_id
                    ));
                }
                Err(err) => {
                    if let Err(mark_err) = self.reconciler.mark_failed(&record, &err.to_string()).await
                    {
                        warn!(
                            "mark outbound failed did not persist: message_id={}, error={mark_err}",
                            record.message_id
                        );
                    }
                    return Err(err).with_context(|| {
                        format!(
                            "send reply failed: channel_id={}, sender_id={}",
                            unit.channel_id, unit.sender_id
                        )
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BatchProcessor for ReplyProcessor {
    async fn process(&self, unit: WorkUnit) -> Result<()> {
        let policy = self.policies.load(&unit.tenant_id).await;
        if !policy.automation_enabled {
            debug!(
                "automation disabled, no reply: tenant_id={}, sender_id={}",
                unit.tenant_id, unit.sender_id
            );
            return Ok(());
        }
        let Some(binding) = self.resolver.resolve(&unit.channel_id).await else {
            info!(
                "channel unavailable, dropping unit: channel_id={}, sender_id={}, count={}",
                unit.channel_id,
                unit.sender_id,
                unit.len()
            );
            return Ok(());
        };

        if let Err(err) = self.sender.mark_seen(&binding, &unit.sender_id).await {
            match classify(&err) {
                ErrorClass::PermissionDenied => {
                    debug!("mark_seen not permitted: channel_id={}", binding.channel_id)
                }
                _ => warn!(
                    "mark_seen failed: channel_id={}, error={err}",
                    binding.channel_id
                ),
            }
        }

        let history = self.load_history(&unit).await;
        let request = GenerationRequest {
            tenant_id: unit.tenant_id.clone(),
            channel_id: unit.channel_id.clone(),
            conversation_id: unit.conversation_id.clone(),
            sender_id: unit.sender_id.clone(),
            content: unit.content.clone(),
            attachments: unit.attachments.clone(),
            history,
            reply_to: unit.reply_to.clone(),
            referral: unit.referral.clone(),
            batch_size: unit.len(),
        };
        match self.generator.generate(request).await? {
            GenerationOutcome::Silent => {
                debug!(
                    "generator chose silence: conversation_id={}",
                    unit.conversation_id
                );
                Ok(())
            }
            GenerationOutcome::Reply(reply) => self.deliver(&unit, &binding, reply).await,
        }
    }
}
