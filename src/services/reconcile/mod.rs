// Outbound/echo reconciliation.
//
// Outbound sends are recorded optimistically as provisional records. The channel later echoes
// each send back without saying who produced it; the reconciler matches the echo to a local
// record (by external id, then exact content, then fuzzy content) or records it as a manual
// reply. One external id never owns more than one record.

mod generation_index;
mod matcher;

use crate::channels::types::{ChannelAttachment, ChannelBinding, EchoEvent, MessageType};
use crate::core::clock::Clock;
use crate::core::config::ReconcileSettings;
use crate::services::publish::{
    EventSink, RealtimeEvent, EVENT_MESSAGE_CREATED, EVENT_MESSAGE_UPDATED,
};
use crate::storage::{
    DeliveryStatus, GenerationMeta, MessageDirection, MessageOrigin, MessagePatch, MessageRecord,
    MessageStore,
};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use generation_index::GenerationIndex;
pub use matcher::{normalize_whitespace, ContainmentMatcher, EchoMatcher, NormalizedEqualityMatcher};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub exact_window_ms: i64,
    pub fuzzy_window_ms: i64,
    pub generation_ttl_ms: i64,
    pub fuzzy_min_len: usize,
    pub strict_matching: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            exact_window_ms: 10_000,
            fuzzy_window_ms: 60_000,
            generation_ttl_ms: 600_000,
            fuzzy_min_len: 4,
            strict_matching: false,
        }
    }
}

impl From<&ReconcileSettings> for ReconcileConfig {
    fn from(settings: &ReconcileSettings) -> Self {
        Self {
            exact_window_ms: settings.exact_window_ms.max(0),
            fuzzy_window_ms: settings.fuzzy_window_ms.max(settings.exact_window_ms),
            generation_ttl_ms: settings.generation_ttl_ms.max(0),
            fuzzy_min_len: settings.fuzzy_min_len,
            strict_matching: settings.strict_matching,
        }
    }
}

impl ReconcileConfig {
    pub fn build_matcher(&self) -> Arc<dyn EchoMatcher> {
        if self.strict_matching {
            Arc::new(NormalizedEqualityMatcher)
        } else {
            Arc::new(ContainmentMatcher {
                min_len: self.fuzzy_min_len,
            })
        }
    }
}

/// An outbound message about to be sent.
#[derive(Debug, Clone)]
pub struct OutboundDraft {
    pub tenant_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: Vec<ChannelAttachment>,
    pub origin: MessageOrigin,
    pub generation: Option<GenerationMeta>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactId,
    ExactContent,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Promoted { message_id: String, kind: MatchKind },
    Created { message_id: String, origin: MessageOrigin },
    Duplicate,
    Ignored,
}

/// Holds an echo id while it is being reconciled; released on drop.
struct EchoClaim<'a> {
    claims: &'a DashMap<String, ()>,
    external_id: String,
}

impl Drop for EchoClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.external_id);
    }
}

pub struct EchoReconciler {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    matcher: Arc<dyn EchoMatcher>,
    generations: GenerationIndex,
    in_flight: DashMap<String, ()>,
    config: ReconcileConfig,
}

impl EchoReconciler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: ReconcileConfig,
    ) -> Self {
        let matcher = config.build_matcher();
        Self::with_matcher(store, sink, clock, matcher, config)
    }

    pub fn with_matcher(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        matcher: Arc<dyn EchoMatcher>,
        config: ReconcileConfig,
    ) -> Self {
        let generations = GenerationIndex::new(clock.clone(), config.generation_ttl_ms);
        Self {
            store,
            sink,
            clock,
            matcher,
            generations,
            in_flight: DashMap::new(),
            config,
        }
    }

    pub fn generations(&self) -> &GenerationIndex {
        &self.generations
    }

    pub async fn record_provisional(&self, draft: OutboundDraft) -> Result<MessageRecord> {
        let now = self.clock.now_ms();
        let record = MessageRecord {
            message_id: Uuid::new_v4().simple().to_string(),
            conversation_id: draft.conversation_id,
            tenant_id: draft.tenant_id,
            channel_id: draft.channel_id,
            direction: MessageDirection::Outbound,
            origin: draft.origin,
            message_type: draft.message_type,
            content: draft.content,
            attachments: draft.attachments,
            external_id: None,
            reply_to: draft.reply_to,
            referral: None,
            status: DeliveryStatus::Provisional,
            generation: draft.generation,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            reconciled_at: None,
        };
        let record = self.store.create_message(record).await?;
        self.publish(EVENT_MESSAGE_CREATED, &record);
        Ok(record)
    }

    /// Binds the id returned by the send call to the provisional record. When the echo already
    /// created a record for that id, the provisional one is superseded and the owner inherits
    /// its authorship.
    pub async fn confirm_send(
        &self,
        record: &MessageRecord,
        external_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let Some(external_id) = external_id.map(str::trim).filter(|value| !value.is_empty())
        else {
            return self
                .patch(
                    &record.message_id,
                    MessagePatch {
                        status: Some(DeliveryStatus::Sent),
                        ..MessagePatch::default()
                    },
                )
                .await;
        };
        if let Some(owner) = self.store.find_by_external_id(external_id).await? {
            if owner.message_id != record.message_id {
                if let Some(meta) = record.generation.clone() {
                    self.generations.tag(external_id, meta);
                }
                return self.supersede(record, owner).await;
            }
            if owner.is_confirmed() {
                // The echo already matched this record; the receipt adds nothing.
                debug!(
                    "send receipt after echo confirmation: message_id={}, external_id={external_id}",
                    owner.message_id
                );
                return Ok(owner);
            }
        }
        if let Some(meta) = record.generation.clone() {
            self.generations.tag(external_id, meta);
        }
        let patch = MessagePatch {
            external_id: Some(external_id.to_string()),
            status: Some(DeliveryStatus::Sent),
            ..MessagePatch::default()
        };
        match self.store.update_message(&record.message_id, patch).await {
            Ok(Some(updated)) => {
                self.publish(EVENT_MESSAGE_UPDATED, &updated);
                Ok(updated)
            }
            Ok(None) => Err(anyhow!("provisional message vanished: {}", record.message_id)),
            Err(err) => {
                // The echo won the race for this id between the lookup and the update.
                let Some(owner) = self.store.find_by_external_id(external_id).await? else {
                    return Err(err);
                };
                self.supersede(record, owner).await
            }
        }
    }

    pub async fn mark_failed(&self, record: &MessageRecord, reason: &str) -> Result<MessageRecord> {
        self.patch(
            &record.message_id,
            MessagePatch {
                status: Some(DeliveryStatus::Failed),
                failure_reason: Some(reason.to_string()),
                ..MessagePatch::default()
            },
        )
        .await
    }

    /// Remembers which generation produced `external_id`. If the echo already landed as a
    /// manual reply, that record is re-attributed now.
    pub async fn tag_generation(&self, external_id: &str, meta: GenerationMeta) -> Result<()> {
        self.generations.tag(external_id, meta.clone());
        let Some(owner) = self.store.find_by_external_id(external_id).await? else {
            return Ok(());
        };
        if owner.generation.is_some() || owner.origin != MessageOrigin::Manual {
            return Ok(());
        }
        self.patch(
            &owner.message_id,
            MessagePatch {
                origin: Some(MessageOrigin::Agent),
                generation: Some(meta),
                ..MessagePatch::default()
            },
        )
        .await?;
        Ok(())
    }

    pub async fn reconcile_echo(
        &self,
        echo: &EchoEvent,
        binding: &ChannelBinding,
    ) -> Result<ReconcileOutcome> {
        let external_id = echo.message_id.trim();
        if external_id.is_empty() || echo.recipient_id.trim().is_empty() {
            return Ok(ReconcileOutcome::Ignored);
        }
        if self
            .in_flight
            .insert(external_id.to_string(), ())
            .is_some()
        {
            debug!("echo already being reconciled: external_id={external_id}");
            return Ok(ReconcileOutcome::Duplicate);
        }
        let _claim = EchoClaim {
            claims: &self.in_flight,
            external_id: external_id.to_string(),
        };

        if let Some(existing) = self.store.find_by_external_id(external_id).await? {
            if existing.is_confirmed() {
                return Ok(ReconcileOutcome::Duplicate);
            }
            return self.promote(existing, external_id, MatchKind::ExactId).await;
        }

        let now = self.clock.now_ms();
        let echo_ts = if echo.ts > 0 { echo.ts } else { now };
        let conversation = self
            .store
            .ensure_conversation(
                &binding.tenant_id,
                &binding.channel_id,
                &echo.recipient_id,
                now,
            )
            .await?;
        let since = echo_ts - self.config.fuzzy_window_ms;
        let candidates: Vec<MessageRecord> = self
            .store
            .find_unconfirmed_outbound(&conversation.conversation_id, since)
            .await?
            .into_iter()
            .filter(|record| {
                record
                    .external_id
                    .as_deref()
                    .map_or(true, |bound| bound == external_id)
            })
            .collect();

        let echo_body = echo_body(echo);
        let exact = closest(
            candidates.iter().filter(|record| {
                record.message_type == echo.message_type
                    && !echo_body.is_empty()
                    && record.content.trim() == echo_body
                    && (record.created_at - echo_ts).abs() <= self.config.exact_window_ms
            }),
            echo_ts,
        );
        if let Some(record) = exact {
            return self
                .promote(record.clone(), external_id, MatchKind::ExactContent)
                .await;
        }

        if echo.message_type == MessageType::Text {
            let fuzzy = closest(
                candidates.iter().filter(|record| {
                    record.message_type == MessageType::Text
                        && (record.created_at - echo_ts).abs() <= self.config.fuzzy_window_ms
                        && self.matcher.matches(&record.content, &echo.content)
                }),
                echo_ts,
            );
            if let Some(record) = fuzzy {
                debug!(
                    "echo matched fuzzily: external_id={external_id}, matcher={}, message_id={}",
                    self.matcher.name(),
                    record.message_id
                );
                return self
                    .promote(record.clone(), external_id, MatchKind::Fuzzy)
                    .await;
            }
        }

        self.create_from_echo(echo, binding, &conversation.conversation_id, external_id, echo_ts)
            .await
    }

    pub fn sweep(&self) -> usize {
        self.generations.sweep()
    }

    async fn promote(
        &self,
        record: MessageRecord,
        external_id: &str,
        kind: MatchKind,
    ) -> Result<ReconcileOutcome> {
        let now = self.clock.now_ms();
        let mut patch = MessagePatch {
            external_id: Some(external_id.to_string()),
            status: Some(DeliveryStatus::Confirmed),
            reconciled_at: Some(now),
            ..MessagePatch::default()
        };
        if let Some(meta) = self.generations.take(external_id) {
            if record.generation.is_none() {
                patch.origin = Some(MessageOrigin::Agent);
                patch.generation = Some(meta);
            }
        }
        let updated = self.patch(&record.message_id, patch).await?;
        info!(
            "echo reconciled: external_id={external_id}, message_id={}, kind={kind:?}",
            updated.message_id
        );
        Ok(ReconcileOutcome::Promoted {
            message_id: updated.message_id,
            kind,
        })
    }

    async fn create_from_echo(
        &self,
        echo: &EchoEvent,
        binding: &ChannelBinding,
        conversation_id: &str,
        external_id: &str,
        echo_ts: i64,
    ) -> Result<ReconcileOutcome> {
        let now = self.clock.now_ms();
        let generation = self.generations.take(external_id);
        let origin = if generation.is_some() {
            MessageOrigin::Agent
        } else {
            MessageOrigin::Manual
        };
        let record = MessageRecord {
            message_id: Uuid::new_v4().simple().to_string(),
            conversation_id: conversation_id.to_string(),
            tenant_id: binding.tenant_id.clone(),
            channel_id: binding.channel_id.clone(),
            direction: MessageDirection::Outbound,
            origin,
            message_type: echo.message_type,
            content: echo.content.clone(),
            attachments: echo.attachments.clone(),
            external_id: Some(external_id.to_string()),
            reply_to: None,
            referral: None,
            status: DeliveryStatus::Confirmed,
            generation,
            failure_reason: None,
            created_at: echo_ts,
            updated_at: now,
            reconciled_at: Some(now),
        };
        let candidate_id = record.message_id.clone();
        let stored = self.store.create_message(record).await?;
        if stored.message_id != candidate_id {
            return Ok(ReconcileOutcome::Duplicate);
        }
        info!(
            "echo had no local match, recorded as {origin:?}: external_id={external_id}, channel_id={}",
            binding.channel_id
        );
        self.publish(EVENT_MESSAGE_CREATED, &stored);
        Ok(ReconcileOutcome::Created {
            message_id: stored.message_id,
            origin,
        })
    }

    async fn supersede(&self, record: &MessageRecord, owner: MessageRecord) -> Result<MessageRecord> {
        self.patch(
            &record.message_id,
            MessagePatch {
                status: Some(DeliveryStatus::Superseded),
                ..MessagePatch::default()
            },
        )
        .await?;
        let mut patch = MessagePatch::default();
        if owner.generation.is_none() && record.generation.is_some() {
            patch.generation = record.generation.clone();
        }
        if owner.origin == MessageOrigin::Manual && record.origin != MessageOrigin::Manual {
            patch.origin = Some(record.origin);
        }
        warn!(
            "provisional message superseded by echo record: message_id={}, owner_id={}",
            record.message_id, owner.message_id
        );
        self.patch(&owner.message_id, patch).await
    }

    async fn patch(&self, message_id: &str, patch: MessagePatch) -> Result<MessageRecord> {
        let updated = self
            .store
            .update_message(message_id, patch)
            .await?
            .ok_or_else(|| anyhow!("message not found: {message_id}"))?;
        self.publish(EVENT_MESSAGE_UPDATED, &updated);
        Ok(updated)
    }

    fn publish(&self, event: &str, record: &MessageRecord) {
        let payload = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
        self.sink.publish(RealtimeEvent::new(
            &record.tenant_id,
            event,
            payload,
            self.clock.now_ms(),
        ));
    }
}

fn echo_body(echo: &EchoEvent) -> String {
    let text = echo.content.trim();
    if !text.is_empty() || echo.message_type == MessageType::Text {
        return text.to_string();
    }
    echo.attachments
        .first()
        .map(|attachment| attachment.url.trim().to_string())
        .unwrap_or_default()
}

fn closest<'a>(
    candidates: impl Iterator<Item = &'a MessageRecord>,
    echo_ts: i64,
) -> Option<&'a MessageRecord> {
    candidates.min_by_key(|record| (record.created_at - echo_ts).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::types::ConnectionStatus;
    use crate::core::clock::ManualClock;
    use crate::services::publish::BroadcastSink;
    use crate::storage::MemoryMessageStore;
    use serde_json::Value;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        store: Arc<MemoryMessageStore>,
        clock: Arc<ManualClock>,
        reconciler: EchoReconciler,
        binding: ChannelBinding,
        conversation_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryMessageStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let reconciler = EchoReconciler::new(
            store.clone(),
            Arc::new(BroadcastSink::default()),
            clock.clone(),
            ReconcileConfig::default(),
        );
        let binding = ChannelBinding {
            channel_id: "page-1".to_string(),
            credential: "token".to_string(),
            display_name: "Shop".to_string(),
            tenant_id: "t1".to_string(),
            status: ConnectionStatus::Connected,
        };
        let conversation = store
            .ensure_conversation("t1", "page-1", "user-1", T0)
            .await
            .expect("conversation");
        Fixture {
            store,
            clock,
            reconciler,
            binding,
            conversation_id: conversation.conversation_id,
        }
    }

    impl Fixture {
        fn draft(&self, content: &str, generation: Option<GenerationMeta>) -> OutboundDraft {
            OutboundDraft {
                tenant_id: "t1".to_string(),
                channel_id: "page-1".to_string(),
                conversation_id: self.conversation_id.clone(),
                content: content.to_string(),
                message_type: MessageType::Text,
                attachments: Vec::new(),
                origin: if generation.is_some() {
                    MessageOrigin::Agent
                } else {
                    MessageOrigin::Operator
                },
                generation,
                reply_to: None,
            }
        }

        fn echo(&self, external_id: &str, content: &str) -> EchoEvent {
            EchoEvent {
                message_id: external_id.to_string(),
                channel_id: "page-1".to_string(),
                recipient_id: "user-1".to_string(),
                content: content.to_string(),
                message_type: MessageType::Text,
                attachments: Vec::new(),
                ts: self.clock.now_ms(),
                app_id: None,
            }
        }
    }

    fn meta(id: &str) -> GenerationMeta {
        GenerationMeta {
            generation_id: id.to_string(),
            model: Some("test-model".to_string()),
            batch_size: 1,
            extra: Value::Null,
        }
    }

    #[tokio::test]
    async fn echo_promotes_provisional_record_in_place() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Hello", None))
            .await
            .expect("provisional");
        fx.clock.advance(Duration::from_secs(2));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.1", "Hello"), &fx.binding)
            .await
            .expect("reconcile");
        assert_eq!(
            outcome,
            ReconcileOutcome::Promoted {
                message_id: provisional.message_id.clone(),
                kind: MatchKind::ExactContent,
            }
        );
        let messages = fx.store.all_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].external_id.as_deref(), Some("mid.1"));
        assert_eq!(messages[0].status, DeliveryStatus::Confirmed);
        assert!(messages[0].is_confirmed());
    }

    #[tokio::test]
    async fn unmatched_echo_becomes_manual_reply() {
        let fx = fixture().await;
        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.7", "Sent from the page inbox"), &fx.binding)
            .await
            .expect("reconcile");
        let ReconcileOutcome::Created { origin, .. } = outcome else {
            panic!("expected created, got {outcome:?}");
        };
        assert_eq!(origin, MessageOrigin::Manual);
        let messages = fx.store.all_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].origin, MessageOrigin::Manual);
        assert_eq!(messages[0].conversation_id, fx.conversation_id);
    }

    #[tokio::test]
    async fn redelivered_echo_is_a_no_op() {
        let fx = fixture().await;
        let echo = fx.echo("mid.7", "manual");
        fx.reconciler
            .reconcile_echo(&echo, &fx.binding)
            .await
            .expect("first");
        let second = fx
            .reconciler
            .reconcile_echo(&echo, &fx.binding)
            .await
            .expect("second");
        assert_eq!(second, ReconcileOutcome::Duplicate);
        assert_eq!(fx.store.all_messages().len(), 1);
    }

    #[tokio::test]
    async fn send_receipt_id_gives_exact_id_match() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Your order is on its way", Some(meta("g1"))))
            .await
            .expect("provisional");
        fx.reconciler
            .confirm_send(&provisional, Some("mid.3"))
            .await
            .expect("confirm");
        fx.clock.advance(Duration::from_secs(30));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.3", "different text"), &fx.binding)
            .await
            .expect("reconcile");
        assert_eq!(
            outcome,
            ReconcileOutcome::Promoted {
                message_id: provisional.message_id,
                kind: MatchKind::ExactId,
            }
        );
        assert_eq!(fx.store.all_messages().len(), 1);
    }

    #[tokio::test]
    async fn formatting_drift_matches_fuzzily_within_wide_window() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Thanks!  We will  call you back.", None))
            .await
            .expect("provisional");
        fx.clock.advance(Duration::from_secs(20));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.4", "Thanks! We will call you back."), &fx.binding)
            .await
            .expect("reconcile");
        assert_eq!(
            outcome,
            ReconcileOutcome::Promoted {
                message_id: provisional.message_id,
                kind: MatchKind::Fuzzy,
            }
        );
    }

    #[tokio::test]
    async fn candidates_outside_fuzzy_window_are_ignored() {
        let fx = fixture().await;
        fx.reconciler
            .record_provisional(fx.draft("Hello", None))
            .await
            .expect("provisional");
        fx.clock.advance(Duration::from_secs(90));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.5", "Hello"), &fx.binding)
            .await
            .expect("reconcile");
        assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
        assert_eq!(fx.store.all_messages().len(), 2);
    }

    #[tokio::test]
    async fn record_bound_to_other_id_is_not_a_candidate() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Hello", None))
            .await
            .expect("provisional");
        fx.reconciler
            .confirm_send(&provisional, Some("mid.a"))
            .await
            .expect("confirm");
        fx.clock.advance(Duration::from_secs(1));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.b", "Hello"), &fx.binding)
            .await
            .expect("reconcile");
        assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn closest_candidate_wins_exact_match() {
        let fx = fixture().await;
        fx.reconciler
            .record_provisional(fx.draft("ok thanks", None))
            .await
            .expect("first");
        fx.clock.advance(Duration::from_secs(5));
        let second = fx
            .reconciler
            .record_provisional(fx.draft("ok thanks", None))
            .await
            .expect("second");
        fx.clock.advance(Duration::from_secs(1));

        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.6", "ok thanks"), &fx.binding)
            .await
            .expect("reconcile");
        assert_eq!(
            outcome,
            ReconcileOutcome::Promoted {
                message_id: second.message_id,
                kind: MatchKind::ExactContent,
            }
        );
    }

    #[tokio::test]
    async fn generation_tag_marks_echo_as_agent_authored() {
        let fx = fixture().await;
        fx.reconciler.generations().tag("mid.8", meta("g8"));
        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.8", "automated answer"), &fx.binding)
            .await
            .expect("reconcile");
        let ReconcileOutcome::Created { origin, .. } = outcome else {
            panic!("expected created, got {outcome:?}");
        };
        assert_eq!(origin, MessageOrigin::Agent);
        assert_eq!(
            fx.store.all_messages()[0]
                .generation
                .as_ref()
                .map(|meta| meta.generation_id.as_str()),
            Some("g8")
        );
    }

    #[tokio::test]
    async fn late_tag_reattributes_manual_record() {
        let fx = fixture().await;
        fx.reconciler
            .reconcile_echo(&fx.echo("mid.9", "quick reply"), &fx.binding)
            .await
            .expect("reconcile");
        fx.reconciler
            .tag_generation("mid.9", meta("g9"))
            .await
            .expect("tag");
        let record = fx
            .store
            .find_by_external_id("mid.9")
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(record.origin, MessageOrigin::Agent);
    }

    #[tokio::test]
    async fn echo_before_send_receipt_supersedes_provisional() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Here is the link", Some(meta("g2"))))
            .await
            .expect("provisional");
        // Echo carries a media type, so it cannot content-match the text record.
        let mut echo = fx.echo("mid.2", "");
        echo.message_type = MessageType::Image;
        fx.reconciler
            .reconcile_echo(&echo, &fx.binding)
            .await
            .expect("reconcile");

        let owner = fx
            .reconciler
            .confirm_send(&provisional, Some("mid.2"))
            .await
            .expect("confirm");
        assert_eq!(owner.origin, MessageOrigin::Agent);
        assert_eq!(owner.external_id.as_deref(), Some("mid.2"));
        let superseded = fx
            .store
            .get_message(&provisional.message_id)
            .expect("provisional kept");
        assert_eq!(superseded.status, DeliveryStatus::Superseded);
        assert!(superseded.external_id.is_none());
    }

    #[tokio::test]
    async fn receipt_after_matching_echo_keeps_confirmation() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("Hello", Some(meta("g5"))))
            .await
            .expect("provisional");
        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.1", "Hello"), &fx.binding)
            .await
            .expect("reconcile");
        assert!(matches!(outcome, ReconcileOutcome::Promoted { .. }));
        let confirmed = fx
            .store
            .get_message(&provisional.message_id)
            .expect("record");
        assert_eq!(confirmed.status, DeliveryStatus::Confirmed);
        let tags_before = fx.reconciler.generations().len();

        let after = fx
            .reconciler
            .confirm_send(&provisional, Some("mid.1"))
            .await
            .expect("confirm");
        assert_eq!(after.status, DeliveryStatus::Confirmed);
        assert_eq!(after.reconciled_at, confirmed.reconciled_at);
        let stored = fx
            .store
            .get_message(&provisional.message_id)
            .expect("record");
        assert_eq!(stored.status, DeliveryStatus::Confirmed);
        assert_eq!(fx.reconciler.generations().len(), tags_before);
        assert!(fx.reconciler.generations().get("mid.1").is_none());
    }

    #[tokio::test]
    async fn concurrent_claim_on_same_echo_is_duplicate() {
        let fx = fixture().await;
        fx.reconciler.in_flight.insert("mid.10".to_string(), ());
        let outcome = fx
            .reconciler
            .reconcile_echo(&fx.echo("mid.10", "x"), &fx.binding)
            .await
            .expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Duplicate);
    }

    #[tokio::test]
    async fn failed_send_is_recorded() {
        let fx = fixture().await;
        let provisional = fx
            .reconciler
            .record_provisional(fx.draft("retry later", None))
            .await
            .expect("provisional");
        let failed = fx
            .reconciler
            .mark_failed(&provisional, "graph send failed")
            .await
            .expect("mark failed");
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("graph send failed"));
    }
}
