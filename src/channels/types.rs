use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAttachment {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    File,
}

impl MessageType {
    pub fn from_attachment_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" | "sticker" => Self::Image,
            "audio" | "voice" => Self::Audio,
            "video" => Self::Video,
            "file" | "document" => Self::File,
            _ => Self::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel_id: String,
    pub credential: String,
    #[serde(default)]
    pub display_name: String,
    pub tenant_id: String,
    #[serde(default)]
    pub status: ConnectionStatus,
}

impl ChannelBinding {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    #[default]
    Message,
    Postback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub message_id: Option<String>,
    pub sender_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<ChannelAttachment>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub referral: Option<Value>,
    #[serde(default)]
    pub kind: InboundKind,
    #[serde(default)]
    pub ts: Option<i64>,
}

impl InboundEvent {
    pub fn external_id(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// A copy of a message sent from the channel, delivered back through the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoEvent {
    pub message_id: String,
    pub channel_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub attachments: Vec<ChannelAttachment>,
    pub ts: i64,
    #[serde(default)]
    pub app_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(InboundEvent),
    Postback(InboundEvent),
    Echo(EchoEvent),
}
