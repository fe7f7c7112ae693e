//! HTTP request handlers.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use expexp_core::fetch::RequestContext;

use crate::exposition;
use crate::state::AppState;

/// Set by Prometheus on every scrape.
pub(crate) const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

// ============================================================
// Health
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Proxy
// ============================================================

#[derive(Deserialize)]
pub(crate) struct ProxyQuery {
    module: Option<String>,
    #[serde(default)]
    path: String,
}

pub(crate) async fn handle_proxy(
    State(state): AppState,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(name) = query.module.filter(|m| !m.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "module parameter is required\n").into_response();
    };
    let Some(module) = state.config.module(&name) else {
        debug!(module = %name, "unknown module requested");
        return (StatusCode::NOT_FOUND, format!("unknown module {name:?}\n")).into_response();
    };

    let resolved = match module.resolve(&query.path) {
        Ok(resolved) => resolved,
        Err(rejection) => {
            debug!(module = %name, path = %query.path, %rejection, "path rejected");
            return (StatusCode::OK, rejection.to_string()).into_response();
        }
    };

    let ctx = module.request_context(scrape_context(&headers));
    let gatherer = module.gatherer(ctx, resolved, state.metrics.clone());
    exposition::serve(&gatherer, &headers).await
}

/// Deadline from the scraper's timeout header, if present and sane.
pub(crate) fn scrape_context(headers: &HeaderMap) -> RequestContext {
    headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|timeout| !timeout.is_zero())
        .map(RequestContext::with_timeout)
        .unwrap_or_else(RequestContext::background)
}

// ============================================================
// Telemetry
// ============================================================

pub(crate) async fn handle_metrics(State(state): AppState, headers: HeaderMap) -> Response {
    exposition::serve(state.metrics.registry(), &headers).await
}
