// Storage: conversation and message records plus the persistence contract the relay needs.

mod memory;

use crate::channels::types::{ChannelAttachment, MessageType};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryMessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Contact,
    Agent,
    Operator,
    /// Sent from outside this system, e.g. the channel's own console.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Received,
    Provisional,
    Sent,
    Confirmed,
    Failed,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub generation_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub tenant_id: String,
    pub channel_id: String,
    pub participant_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub tenant_id: String,
    pub channel_id: String,
    pub direction: MessageDirection,
    pub origin: MessageOrigin,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<ChannelAttachment>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub referral: Option<Value>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub generation: Option<GenerationMeta>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub reconciled_at: Option<i64>,
}

impl MessageRecord {
    pub fn is_confirmed(&self) -> bool {
        self.reconciled_at.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub external_id: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub origin: Option<MessageOrigin>,
    pub generation: Option<GenerationMeta>,
    pub failure_reason: Option<String>,
    pub reconciled_at: Option<i64>,
}

impl MessagePatch {
    pub fn apply(self, record: &mut MessageRecord, now: i64) {
        if let Some(external_id) = self.external_id {
            record.external_id = Some(external_id);
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(origin) = self.origin {
            record.origin = origin;
        }
        if let Some(generation) = self.generation {
            record.generation = Some(generation);
        }
        if let Some(reason) = self.failure_reason {
            record.failure_reason = Some(reason);
        }
        if let Some(reconciled_at) = self.reconciled_at {
            record.reconciled_at = Some(reconciled_at);
        }
        record.updated_at = now;
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns the conversation for `(channel_id, participant_id)`, creating it when absent.
    async fn ensure_conversation(
        &self,
        tenant_id: &str,
        channel_id: &str,
        participant_id: &str,
        now: i64,
    ) -> Result<ConversationRecord>;

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<MessageRecord>>;

    /// Outbound records in the conversation created at or after `since` that no echo confirmed yet.
    async fn find_unconfirmed_outbound(
        &self,
        conversation_id: &str,
        since: i64,
    ) -> Result<Vec<MessageRecord>>;

    /// Newest `limit` messages in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    /// Inserts the record. When another record already owns its external id, that one is returned.
    async fn create_message(&self, record: MessageRecord) -> Result<MessageRecord>;

    async fn update_message(
        &self,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Option<MessageRecord>>;
}
