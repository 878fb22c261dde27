use crate::channels::types::ChannelAttachment;
use crate::core::error::RelayError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub tenant_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub attachments: Vec<ChannelAttachment>,
    pub history: Vec<HistoryTurn>,
    pub reply_to: Option<String>,
    pub referral: Option<Value>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    pub text: Option<String>,
    pub images: Vec<String>,
    pub generation_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Silent,
    Reply(GeneratedReply),
}

/// Produces the automated reply for a work unit. Opaque to the relay.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome>;
}

#[derive(Debug, Default, Deserialize)]
struct GeneratorResponse {
    #[serde(default)]
    silent: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    generation_id: Option<String>,
}

impl GeneratorResponse {
    fn into_outcome(self) -> GenerationOutcome {
        let text = self
            .text
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let images: Vec<String> = self
            .images
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        if self.silent || (text.is_none() && images.is_empty()) {
            return GenerationOutcome::Silent;
        }
        GenerationOutcome::Reply(GeneratedReply {
            text,
            images,
            generation_id: self
                .generation_id
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            model: self.model,
        })
    }
}

pub struct HttpContentGenerator {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpContentGenerator {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim().to_string(),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(api_key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(RelayError::permission_denied(format!(
                    "generator rejected credentials: {status}"
                ))
                .into());
            }
            return Err(anyhow!("generator request failed: {status} {body}"));
        }
        let payload: GeneratorResponse = response.json().await?;
        Ok(payload.into_outcome())
    }
}

/// Stand-in when no generator endpoint is configured. Every unit fails as configuration-missing.
pub struct DisabledGenerator;

#[async_trait]
impl ContentGenerator for DisabledGenerator {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationOutcome> {
        Err(RelayError::config_missing("generator endpoint not configured").into())
    }
}
