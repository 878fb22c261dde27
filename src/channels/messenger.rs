use crate::channels::types::{
    ChannelAttachment, ChannelEvent, EchoEvent, InboundEvent, InboundKind, MessageType,
};
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub fn is_page_payload(payload: &Value) -> bool {
    payload
        .get("object")
        .and_then(Value::as_str)
        .map(|value| value.eq_ignore_ascii_case("page"))
        .unwrap_or(false)
}

/// Flattens a page webhook into channel events. Delivery and read receipts are skipped.
pub fn extract_events(payload: &Value) -> Result<Vec<ChannelEvent>> {
    if !is_page_payload(payload) {
        return Err(anyhow!("unsupported webhook object"));
    }
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("invalid page payload: missing entry"))?;

    let mut events = Vec::new();
    for entry in entries {
        let page_id = string_field(entry, "id");
        let Some(messaging) = entry.get("messaging").and_then(Value::as_array) else {
            continue;
        };
        for item in messaging {
            let sender = item
                .get("sender")
                .and_then(|value| value.get("id"))
                .and_then(Value::as_str)
                .map(|value| value.trim().to_string())
                .unwrap_or_default();
            let recipient = item
                .get("recipient")
                .and_then(|value| value.get("id"))
                .and_then(Value::as_str)
                .map(|value| value.trim().to_string())
                .unwrap_or_default();
            let ts = item.get("timestamp").and_then(Value::as_i64);

            if let Some(message) = item.get("message") {
                let is_echo = message
                    .get("is_echo")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_echo {
                    // Echo: the page is the sender and the user is the recipient.
                    let channel_id = page_id.clone().unwrap_or_else(|| sender.clone());
                    match parse_echo(message, &channel_id, &recipient, ts) {
                        Some(echo) => events.push(ChannelEvent::Echo(echo)),
                        None => debug!("skip echo without mid: channel_id={channel_id}"),
                    }
                    continue;
                }
                if sender.is_empty() {
                    continue;
                }
                let channel_id = page_id.clone().unwrap_or_else(|| recipient.clone());
                events.push(ChannelEvent::Message(parse_message(
                    message,
                    &sender,
                    &channel_id,
                    item.get("referral").cloned(),
                    ts,
                )));
                continue;
            }

            if let Some(postback) = item.get("postback") {
                if sender.is_empty() {
                    continue;
                }
                let channel_id = page_id.clone().unwrap_or_else(|| recipient.clone());
                let content = string_field(postback, "title")
                    .or_else(|| string_field(postback, "payload"))
                    .unwrap_or_default();
                let referral = postback
                    .get("referral")
                    .or_else(|| item.get("referral"))
                    .cloned();
                events.push(ChannelEvent::Postback(InboundEvent {
                    message_id: string_field(postback, "mid"),
                    sender_id: sender,
                    channel_id,
                    content,
                    attachments: Vec::new(),
                    reply_to: None,
                    referral,
                    kind: InboundKind::Postback,
                    ts,
                }));
                continue;
            }

            if item.get("delivery").is_some() || item.get("read").is_some() {
                continue;
            }
            debug!("skip unsupported messaging item: sender_id={sender}");
        }
    }
    Ok(events)
}

fn parse_message(
    message: &Value,
    sender: &str,
    channel_id: &str,
    referral: Option<Value>,
    ts: Option<i64>,
) -> InboundEvent {
    let reply_to = message
        .get("reply_to")
        .and_then(|value| value.get("mid"))
        .and_then(Value::as_str)
        .map(|value| value.to_string());
    InboundEvent {
        message_id: string_field(message, "mid"),
        sender_id: sender.to_string(),
        channel_id: channel_id.to_string(),
        content: string_field(message, "text").unwrap_or_default(),
        attachments: parse_attachments(message),
        reply_to,
        referral,
        kind: InboundKind::Message,
        ts,
    }
}

fn parse_echo(
    message: &Value,
    channel_id: &str,
    recipient: &str,
    ts: Option<i64>,
) -> Option<EchoEvent> {
    let message_id = string_field(message, "mid")?;
    let attachments = parse_attachments(message);
    let content = string_field(message, "text").unwrap_or_default();
    let message_type = if content.trim().is_empty() {
        attachments
            .first()
            .map(|attachment| MessageType::from_attachment_kind(&attachment.kind))
            .unwrap_or_default()
    } else {
        MessageType::Text
    };
    Some(EchoEvent {
        message_id,
        channel_id: channel_id.to_string(),
        recipient_id: recipient.to_string(),
        content,
        message_type,
        attachments,
        ts: ts.unwrap_or_default(),
        app_id: message
            .get("app_id")
            .and_then(|value| match value {
                Value::String(text) => Some(text.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            }),
    })
}

fn parse_attachments(message: &Value) -> Vec<ChannelAttachment> {
    let Some(items) = message.get("attachments").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let kind = string_field(item, "type").unwrap_or_else(|| "file".to_string());
            let url = item
                .get("payload")
                .and_then(|payload| payload.get("url"))
                .and_then(Value::as_str)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())?;
            Some(ChannelAttachment {
                kind,
                url,
                mime: None,
                name: item
                    .get("payload")
                    .and_then(|payload| payload.get("title"))
                    .and_then(Value::as_str)
                    .map(|value| value.to_string()),
            })
        })
        .collect()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn verify_signature_any(body: &[u8], signature: &str, secrets: &[String]) -> bool {
    let signature = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    secrets
        .iter()
        .filter(|secret| !secret.trim().is_empty())
        .any(|secret| verify_signature(body, secret, &expected))
}

fn verify_signature(body: &[u8], secret: &str, expected: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(expected).is_ok()
}
