use super::{
    ConversationRecord, DeliveryStatus, MessageDirection, MessagePatch, MessageRecord,
    MessageStore,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<(String, String), ConversationRecord>,
    messages: HashMap<String, MessageRecord>,
    order: Vec<String>,
    by_external_id: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    state: RwLock<MemoryState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_messages(&self) -> Vec<MessageRecord> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect()
    }

    pub fn get_message(&self, message_id: &str) -> Option<MessageRecord> {
        self.state.read().messages.get(message_id).cloned()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn ensure_conversation(
        &self,
        tenant_id: &str,
        channel_id: &str,
        participant_id: &str,
        now: i64,
    ) -> Result<ConversationRecord> {
        let key = (channel_id.trim().to_string(), participant_id.trim().to_string());
        if key.0.is_empty() || key.1.is_empty() {
            return Err(anyhow!("conversation key missing channel or participant"));
        }
        let mut state = self.state.write();
        let record = state
            .conversations
            .entry(key)
            .or_insert_with(|| ConversationRecord {
                conversation_id: Uuid::new_v4().simple().to_string(),
                tenant_id: tenant_id.to_string(),
                channel_id: channel_id.trim().to_string(),
                participant_id: participant_id.trim().to_string(),
                created_at: now,
                updated_at: now,
            });
        record.updated_at = record.updated_at.max(now);
        Ok(record.clone())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<MessageRecord>> {
        let cleaned = external_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let state = self.state.read();
        Ok(state
            .by_external_id
            .get(cleaned)
            .and_then(|id| state.messages.get(id))
            .cloned())
    }

    async fn find_unconfirmed_outbound(
        &self,
        conversation_id: &str,
        since: i64,
    ) -> Result<Vec<MessageRecord>> {
        let state = self.state.read();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|record| {
                record.conversation_id == conversation_id
                    && record.direction == MessageDirection::Outbound
                    && record.reconciled_at.is_none()
                    && matches!(
                        record.status,
                        DeliveryStatus::Provisional | DeliveryStatus::Sent
                    )
                    && record.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let state = self.state.read();
        let mut items: Vec<MessageRecord> = state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|record| record.conversation_id == conversation_id)
            .cloned()
            .collect();
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
        Ok(items)
    }

    async fn create_message(&self, record: MessageRecord) -> Result<MessageRecord> {
        let mut state = self.state.write();
        if let Some(external_id) = record.external_id.as_deref() {
            if let Some(existing) = state
                .by_external_id
                .get(external_id)
                .and_then(|id| state.messages.get(id))
            {
                return Ok(existing.clone());
            }
        }
        if state.messages.contains_key(&record.message_id) {
            return Err(anyhow!("message {} already exists", record.message_id));
        }
        if let Some(external_id) = record.external_id.clone() {
            state
                .by_external_id
                .insert(external_id, record.message_id.clone());
        }
        state.order.push(record.message_id.clone());
        state
            .messages
            .insert(record.message_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_message(
        &self,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Option<MessageRecord>> {
        let mut state = self.state.write();
        if let Some(external_id) = patch.external_id.as_deref() {
            if let Some(owner) = state.by_external_id.get(external_id) {
                if owner != message_id {
                    return Err(anyhow!(
                        "external id {external_id} already owned by message {owner}"
                    ));
                }
            }
        }
        let Some(record) = state.messages.get_mut(message_id) else {
            return Ok(None);
        };
        let now = record.updated_at.max(patch.reconciled_at.unwrap_or(0));
        let previous_external = record.external_id.clone();
        patch.apply(record, now);
        let updated = record.clone();
        if updated.external_id != previous_external {
            if let Some(previous) = previous_external {
                state.by_external_id.remove(&previous);
            }
            if let Some(external_id) = updated.external_id.clone() {
                state
                    .by_external_id
                    .insert(external_id, updated.message_id.clone());
            }
        }
        Ok(Some(updated))
    }
}
