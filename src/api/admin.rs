// Admin endpoints: tenant policy and channel connection changes, pushed into live caches.
use crate::api::errors::error_response;
use crate::channels::types::ConnectionStatus;
use crate::core::config::TenantPolicyConfig;
use crate::core::state::AppState;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Deserialize)]
struct PolicyUpdate {
    automation_enabled: bool,
    #[serde(default)]
    batch_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: ConnectionStatus,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/tenants/{tenant_id}/policy", put(update_tenant_policy))
        .route("/admin/channels/{channel_id}/status", put(update_channel_status))
}

async fn update_tenant_policy(
    State(state): State<Arc<AppState>>,
    AxumPath(tenant_id): AxumPath<String>,
    Json(payload): Json<PolicyUpdate>,
) -> Result<Json<Value>, Response> {
    let tenant_id = tenant_id.trim().to_string();
    if tenant_id.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "missing tenant_id"));
    }
    let updated = TenantPolicyConfig {
        tenant_id: tenant_id.clone(),
        automation_enabled: payload.automation_enabled,
        batch_wait_ms: payload.batch_wait_ms,
    };
    let stored = updated.clone();
    state
        .config_store
        .update(move |config| {
            match config
                .tenants
                .policies
                .iter_mut()
                .find(|policy| policy.tenant_id.trim() == stored.tenant_id)
            {
                Some(existing) => *existing = stored,
                None => config.tenants.policies.push(stored),
            }
        })
        .await
        .map_err(|err| {
            error!("persist tenant policy failed: tenant_id={tenant_id}, error={err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
    state.hub.notify_policy_changed(&tenant_id);
    Ok(Json(json!({ "data": {
        "tenant_id": updated.tenant_id,
        "automation_enabled": updated.automation_enabled,
        "batch_wait_ms": updated.batch_wait_ms,
    }})))
}

async fn update_channel_status(
    State(state): State<Arc<AppState>>,
    AxumPath(channel_id): AxumPath<String>,
    Json(payload): Json<StatusUpdate>,
) -> Result<Json<Value>, Response> {
    let channel_id = channel_id.trim().to_string();
    let known = state
        .config_store
        .read(|config| config.find_binding(&channel_id).is_some())
        .await;
    if channel_id.is_empty() || !known {
        return Err(error_response(StatusCode::NOT_FOUND, "channel binding not found"));
    }
    let status = payload.status;
    let target = channel_id.clone();
    state
        .config_store
        .update(move |config| {
            for binding in config
                .channels
                .bindings
                .iter_mut()
                .filter(|binding| binding.channel_id.trim() == target)
            {
                binding.status = status;
            }
        })
        .await
        .map_err(|err| {
            error!("persist channel status failed: channel_id={channel_id}, error={err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
    if status == ConnectionStatus::Disconnected {
        state.hub.notify_channel_disconnected(&channel_id);
    }
    Ok(Json(json!({ "data": {
        "channel_id": channel_id,
        "status": status,
    }})))
}
