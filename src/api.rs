//! Security API surface.
//!
//! Exposes the CSP violation sink, header audit/test endpoints, the runtime
//! report-only toggle, a redacted config summary, and the IDS dashboard.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::headers::{self, generate_nonce, ComputedHeaders};
use crate::middleware;
use crate::state::SecurityState;

/// Routes only, without the protective layers. Useful in tests that poke a
/// single handler.
pub fn router(state: Arc<SecurityState>) -> Router {
    Router::new()
        .route("/api/security/csp-report", post(csp_report))
        .route("/api/security/config", get(config_summary))
        .route("/api/security/audit", get(audit_headers))
        .route("/api/security/test", get(test_headers))
        .route(
            "/api/security/csp/toggle-report-only",
            post(toggle_report_only),
        )
        .route("/api/security/ids/dashboard", get(ids_dashboard))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Full security router: the API surface wrapped in the guard and header
/// layers, in pipeline order (headers outermost). A host application merges
/// its own routes into this router to sit behind the same defenses.
pub fn security_router(state: Arc<SecurityState>) -> Router {
    router(state.clone())
        .layer(from_fn_with_state(state.clone(), middleware::request_guard))
        .layer(from_fn_with_state(state, middleware::security_headers))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// CSP violation sink. Browsers post `application/csp-report` bodies here;
/// whatever arrives is logged and acknowledged. This is telemetry, not a
/// gate; malformed reports are logged as raw text and still acknowledged.
async fn csp_report(State(state): State<Arc<SecurityState>>, body: Bytes) -> impl IntoResponse {
    let text = String::from_utf8_lossy(&body);
    let fields = match serde_json::from_str::<Value>(&text) {
        Ok(value) => value,
        Err(_) => json!({ "raw": text }),
    };
    state.logger.append("csp_report", fields).await;
    (StatusCode::OK, Json(json!({ "received": true })))
}

/// Redacted view of the active configuration: booleans and counts only.
async fn config_summary(State(state): State<Arc<SecurityState>>) -> impl IntoResponse {
    let t = &state.config.thresholds;
    Json(json!({
        "headers": state.headers.summary(),
        "waf": {
            "enforce": state.config.waf.enforce,
            "signature_literals": state.patterns.literal_count(),
            "signature_regexes": state.patterns.regex_count(),
        },
        "alerts": {
            "webhook": state.config.alerts.webhook_url.is_some(),
            "chat_webhook": state.config.alerts.chat_webhook_url.is_some(),
            "email_recipients": state.config.alerts.email_recipients.len(),
        },
        "thresholds": {
            "brute_force_window_secs": t.brute_force_window_secs,
            "brute_force_max_failures": t.brute_force_max_failures,
            "ddos_window_secs": t.ddos_window_secs,
            "ddos_max_requests": t.ddos_max_requests,
        },
        "blocklist": {
            "blocked_ips": state.config.blocklist.blocked_ips.len(),
            "allowed_ips": state.config.blocklist.allowed_ips.len(),
            "blocked_user_agents": state.config.blocklist.blocked_user_agents.len(),
        },
        "uploads": {
            "allowed_mime_types": state.config.uploads.allowed_mime_types.len(),
            "allowed_extensions": state.config.uploads.allowed_extensions.len(),
            "max_size_bytes": state.config.uploads.max_size_bytes,
        },
    }))
}

/// Compliance score for the headers this response will carry.
async fn audit_headers(
    State(state): State<Arc<SecurityState>>,
    computed: Option<Extension<ComputedHeaders>>,
) -> impl IntoResponse {
    let header_map = response_headers(&state, computed);
    Json(serde_json::to_value(headers::audit(&header_map)).unwrap_or_else(|_| json!({})))
}

/// Pass/fail breakdown per header check plus an aggregate score.
async fn test_headers(
    State(state): State<Arc<SecurityState>>,
    computed: Option<Extension<ComputedHeaders>>,
) -> impl IntoResponse {
    let header_map = response_headers(&state, computed);
    Json(serde_json::to_value(headers::run_header_tests(&header_map)).unwrap_or_else(|_| json!({})))
}

/// The header layer stashes the computed set in request extensions; when a
/// handler is exercised without that layer, compose an equivalent set so the
/// endpoints stay meaningful.
fn response_headers(
    state: &SecurityState,
    computed: Option<Extension<ComputedHeaders>>,
) -> HeaderMap {
    match computed {
        Some(Extension(ComputedHeaders(map))) => map,
        None => {
            let mut map = HeaderMap::new();
            state.headers.apply(&mut map, &generate_nonce());
            map
        }
    }
}

/// Flip CSP between enforcing and report-only. The body must be
/// `{"reportOnly": <bool>}`; anything else is a client error.
async fn toggle_report_only(
    State(state): State<Arc<SecurityState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match body.get("reportOnly").and_then(Value::as_bool) {
        Some(value) => {
            state.headers.set_report_only(value);
            (
                StatusCode::OK,
                Json(json!({ "reportOnly": value })),
            )
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "reportOnly must be a boolean" })),
        ),
    }
}

/// IDS overview: traffic totals, recent attacks and anomalies, hourly error
/// rate, and the most active attackers.
async fn ids_dashboard(State(state): State<Arc<SecurityState>>) -> impl IntoResponse {
    let cutoff = Utc::now() - Duration::minutes(60);
    let attacks = state.recent_events(cutoff);
    let anomalies = state.anomalies.lock().recent(cutoff);
    let error_rate = state.global.lock().error_rate();
    let top: Vec<Value> = state
        .top_attackers(10)
        .into_iter()
        .map(|(source, count)| json!({ "source": source, "attacks": count }))
        .collect();
    let t = &state.config.thresholds;

    Json(json!({
        "total_requests": state.total_requests.load(std::sync::atomic::Ordering::Relaxed),
        "unique_sources": state.tracker.lock().source_count(),
        "attacks_last_hour": attacks.len(),
        "anomalies_last_hour": anomalies.len(),
        "error_rate_last_hour": error_rate,
        "top_attackers": top,
        "config": {
            "environment": state.config.environment,
            "enforce": state.config.waf.enforce,
            "brute_force_window_secs": t.brute_force_window_secs,
            "brute_force_max_failures": t.brute_force_max_failures,
            "ddos_window_secs": t.ddos_window_secs,
            "ddos_max_requests": t.ddos_max_requests,
        },
    }))
}
