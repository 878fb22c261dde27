use crate::channels::types::{ChannelBinding, MessageType};
use crate::core::error::RelayError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

/// Graph error codes that mean the token lacks a permission rather than a transient fault.
const PERMISSION_ERROR_CODES: [i64; 3] = [10, 200, 230];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub success: bool,
    pub external_id: Option<String>,
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        binding: &ChannelBinding,
        recipient_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<SendReceipt>;

    /// Read receipt towards the sender. Best effort.
    async fn mark_seen(&self, _binding: &ChannelBinding, _recipient_id: &str) -> Result<()> {
        Ok(())
    }
}

pub struct GraphSender {
    http: Client,
    base_url: String,
    api_version: String,
}

impl GraphSender {
    pub fn new(base_url: &str, api_version: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_version: api_version.trim().to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}/me/messages", self.base_url, self.api_version)
    }

    async fn post(&self, binding: &ChannelBinding, payload: Value) -> Result<Value> {
        let credential = binding.credential.trim();
        if credential.is_empty() {
            return Err(RelayError::config_missing(format!(
                "channel credential missing: channel_id={}",
                binding.channel_id
            ))
            .into());
        }
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("access_token", credential)])
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        let code = body
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(Value::as_i64);
        let message = body
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if status == StatusCode::FORBIDDEN
            || code.is_some_and(|code| PERMISSION_ERROR_CODES.contains(&code))
        {
            return Err(RelayError::permission_denied(format!(
                "graph permission denied: status={status}, message={message}"
            ))
            .into());
        }
        Err(anyhow!("graph send failed: status={status}, message={message}"))
    }
}

#[async_trait]
impl ChannelSender for GraphSender {
    async fn send(
        &self,
        binding: &ChannelBinding,
        recipient_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<SendReceipt> {
        let message = match message_type {
            MessageType::Text => json!({ "text": content }),
            other => json!({
                "attachment": {
                    "type": other.as_str(),
                    "payload": { "url": content, "is_reusable": true }
                }
            }),
        };
        let payload = json!({
            "recipient": { "id": recipient_id },
            "messaging_type": "RESPONSE",
            "message": message,
        });
        let body = self.post(binding, payload).await?;
        let external_id = body
            .get("message_id")
            .and_then(Value::as_str)
            .map(|value| value.to_string());
        Ok(SendReceipt {
            success: true,
            external_id,
        })
    }

    async fn mark_seen(&self, binding: &ChannelBinding, recipient_id: &str) -> Result<()> {
        let payload = json!({
            "recipient": { "id": recipient_id },
            "sender_action": "mark_seen",
        });
        self.post(binding, payload).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_and_version() {
        let sender = GraphSender::new("https://graph.example.com/", "v20.0", Duration::from_secs(5))
            .expect("client");
        assert_eq!(sender.endpoint(), "https://graph.example.com/v20.0/me/messages");
    }
}
