// Relay server entry: config, tracing, background maintenance, and the HTTP listener.
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use relay_server::build_router;
use relay_server::config::Config;
use relay_server::config_store::ConfigStore;
use relay_server::shutdown::shutdown_signal;
use relay_server::state::AppState;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_store = ConfigStore::from_env();
    let config = config_store.get().await;
    init_tracing(&config);

    let state = Arc::new(AppState::new(config_store.clone(), &config)?);
    let maintenance = state.hub.spawn_maintenance();

    let app = build_router(state.clone()).layer(from_fn(panic_guard));
    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!(
        "relay server started: addr=http://{addr}, bindings={}, policies={}",
        config.channels.bindings.len(),
        config.tenants.policies.len()
    );

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("server exited with error: {err}");
    }
    for handle in maintenance {
        handle.abort();
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config
        .observability
        .log_format
        .trim()
        .eq_ignore_ascii_case("json")
    {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn bind_address(config: &Config) -> String {
    let host = std::env::var("RELAY_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("RELAY_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling request: method={method}, path={path}, detail={detail}");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
