//! HTTP sidecar for metrics scrape and health checks.
//!
//! The resolver core only publishes a registry and the upstream probes;
//! this server exposes them as `/metrics` (optionally behind basic auth)
//! and `/healthz`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::upstream::HealthCheck;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

struct HttpState {
    registry: Registry,
    healthchecks: Vec<HealthCheck>,
    metrics_auth: Option<String>,
}

/// Serve `/metrics` and `/healthz` until the process exits.
pub async fn serve(
    addr: SocketAddr,
    registry: Registry,
    healthchecks: Vec<HealthCheck>,
    metrics_auth: Option<String>,
) -> Result<()> {
    if metrics_auth.is_none() {
        warn!("metrics endpoint is not protected by basic auth");
    }

    let state = Arc::new(HttpState { registry, healthchecks, metrics_auth });
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service())
        .await
        .context("HTTP server terminated unexpectedly")
}

async fn metrics_handler(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.metrics_auth {
        if !authorized(&headers, expected) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
                "unauthorized",
            )
                .into_response();
        }
    }

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], buffer).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> Response {
    let mut failing = Vec::new();
    for check in &state.healthchecks {
        if !check.pass().await {
            failing.push(check.name());
        }
    }

    if failing.is_empty() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, failing.join(", ")).into_response()
    }
}

/// Compare the request's basic-auth credential against `user:pass`.
fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    match BASE64.decode(encoded) {
        Ok(decoded) => decoded == expected.as_bytes(),
        Err(_) => false,
    }
}
