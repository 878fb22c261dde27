// HTTP surface. Routers are merged here and share one AppState.
pub mod admin;
pub mod errors;
pub mod health;
pub mod webhook;

use crate::core::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(webhook::router())
        .merge(admin::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
