// Page webhook: subscription handshake and event intake.
use crate::api::errors::error_response;
use crate::channels::messenger::{
    extract_events, is_page_payload, verify_signature_any, SIGNATURE_HEADER,
};
use crate::core::state::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const EVENT_RECEIVED: &str = "EVENT_RECEIVED";

#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    #[serde(rename = "hub.mode", default)]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    challenge: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", get(verify_subscription).post(receive_webhook))
}

async fn verify_subscription(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    let expected = state
        .config_store
        .read(|config| config.webhook.verify_token.clone())
        .await
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let Some(expected) = expected else {
        return error_response(StatusCode::FORBIDDEN, "webhook verify token not configured");
    };
    let mode_ok = query.mode.as_deref() == Some("subscribe");
    let token_ok = query.verify_token.as_deref().map(str::trim) == Some(expected.as_str());
    if !mode_ok || !token_ok {
        warn!("webhook subscription rejected: mode={:?}", query.mode);
        return error_response(StatusCode::FORBIDDEN, "webhook verification failed");
    }
    (StatusCode::OK, query.challenge.unwrap_or_default()).into_response()
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secrets: Vec<String> = state
        .config_store
        .read(|config| {
            config
                .webhook
                .app_secrets
                .iter()
                .map(|secret| secret.trim().to_string())
                .filter(|secret| !secret.is_empty())
                .collect()
        })
        .await;
    if !secrets.is_empty() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !verify_signature_any(&body, signature, &secrets) {
            warn!("webhook signature mismatch, payload rejected");
            return error_response(StatusCode::UNAUTHORIZED, "invalid webhook signature");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid json: {err}"));
        }
    };
    if !is_page_payload(&payload) {
        return error_response(StatusCode::NOT_FOUND, "unsupported webhook object");
    }
    let events = match extract_events(&payload) {
        Ok(events) => events,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    debug!("webhook accepted: events={}", events.len());
    for event in events {
        let hub = state.hub.clone();
        tokio::spawn(async move {
            hub.dispatch(event).await;
        });
    }
    (StatusCode::OK, EVENT_RECEIVED).into_response()
}
