//! Request-pipeline layers.
//!
//! Two layers wrap the protected application. `security_headers` (outermost)
//! generates the per-request CSP nonce and applies the full header set to
//! every response, including rejections. `request_guard` runs the blocking
//! checks in order (IP allow/block, user-agent block, body size, upload
//! constraints, signature match) and feeds the observational detector on the
//! way in and the response hooks on the way out. A rejection short-circuits:
//! the inner handler never runs and the client gets a generic 4xx that names
//! no rule.

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{connect_info::ConnectInfo, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::detector::{self, RequestContext};
use crate::headers::{generate_nonce, ComputedHeaders, CspNonce};
use crate::models::{AttackDetails, AttackEvent, AttackType};
use crate::state::SecurityState;

/// Paths whose payloads are telemetry about attacks, not attacks; signature
/// blocking would eat the very reports the sink exists to receive.
const INSPECTION_EXEMPT_PATHS: [&str; 1] = ["/api/security/csp-report"];

/// Outermost layer: nonce + response header set.
pub async fn security_headers(
    State(state): State<Arc<SecurityState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let nonce = generate_nonce();
    let mut computed = HeaderMap::new();
    state.headers.apply(&mut computed, &nonce);

    req.extensions_mut().insert(CspNonce(nonce));
    req.extensions_mut().insert(ComputedHeaders(computed.clone()));

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in computed.iter() {
        headers.insert(name.clone(), value.clone());
    }
    headers.remove("x-powered-by");
    headers.remove("server");
    response
}

/// Blocking guard plus IDS observation.
pub async fn request_guard(
    State(state): State<Arc<SecurityState>>,
    req: Request,
    next: Next,
) -> Response {
    let now_ms = Utc::now().timestamp_millis();
    let source = client_ip(&req);

    // Allowlisted sources skip every check.
    if state.config.blocklist.allowed_ips.contains(&source) {
        return next.run(req).await;
    }

    if state.config.blocklist.blocked_ips.contains(&source) {
        debug!("rejecting blocked ip {source}");
        return reject(StatusCode::FORBIDDEN);
    }

    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(ua) = &user_agent {
        if is_blocked_agent(&state, ua) {
            state.record_event(AttackEvent::new(
                AttackType::SuspiciousPattern,
                source,
                AttackDetails::SuspiciousAgent {
                    url: req.uri().to_string(),
                    user_agent: ua.clone(),
                },
            ));
            if state.config.waf.enforce {
                return reject(StatusCode::FORBIDDEN);
            }
        }
    }

    // Buffer the body for inspection; anything over the hard cap is rejected
    // without being read further.
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, state.config.waf.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("rejecting oversized or unreadable body: {e}");
            return reject(StatusCode::PAYLOAD_TOO_LARGE);
        }
    };

    if let Some(rejection) = check_upload(&state, &parts.headers, &bytes) {
        return rejection;
    }

    let ctx = build_context(&state, &parts, &bytes, source, user_agent);
    let exempt = INSPECTION_EXEMPT_PATHS.contains(&ctx.path.as_str());
    if exempt {
        // Telemetry sink: still counted in the volumetric window, but its
        // payload is not classified.
        state.tracker.lock().record_request(source, now_ms);
        state.bump_total_requests();
        state.global.lock().record_request(3_600_000, now_ms);
    } else {
        let verdict = detector::evaluate_request(&state, &ctx, now_ms);
        if verdict.block {
            debug!(
                "rejecting {} from {} ({} categories matched)",
                ctx.uri,
                source,
                verdict.matched.len()
            );
            return reject(StatusCode::FORBIDDEN);
        }
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    let response = next.run(req).await;

    detector::evaluate_response(
        &state,
        &ctx,
        response.status().as_u16(),
        Utc::now().timestamp_millis(),
    );

    response
}

/// Generic rejection: 4xx, constant body, no echo of the offending payload
/// and no hint of which rule matched.
fn reject(status: StatusCode) -> Response {
    (status, axum::Json(json!({ "error": "request rejected" }))).into_response()
}

/// Client source identity: first hop of X-Forwarded-For when present (the
/// storefront sits behind a proxy), the socket address otherwise.
fn client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return ip;
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn is_blocked_agent(state: &SecurityState, user_agent: &str) -> bool {
    if state.allowed_bots.iter().any(|re| re.is_match(user_agent)) {
        return false;
    }
    state
        .blocked_agents
        .iter()
        .any(|re| re.is_match(user_agent))
}

/// Upload constraint checks for multipart bodies: total size against the
/// configured cap, declared part content types against the MIME allowlist,
/// and filename extensions against the extension allowlist.
fn check_upload(state: &SecurityState, headers: &HeaderMap, body: &Bytes) -> Option<Response> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("multipart/form-data") {
        return None;
    }

    if body.len() as u64 > state.config.uploads.max_size_bytes {
        debug!("rejecting upload over size cap ({} bytes)", body.len());
        return Some(reject(StatusCode::PAYLOAD_TOO_LARGE));
    }

    let excerpt = String::from_utf8_lossy(&body[..body.len().min(state.config.waf.inspect_body_bytes)]);

    for caps in filename_re().captures_iter(&excerpt) {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let extension = name.rsplit('.').next().unwrap_or("").to_lowercase();
        let allowed = state
            .config
            .uploads
            .allowed_extensions
            .iter()
            .any(|e| e == &extension);
        if !allowed {
            warn!("rejecting upload with disallowed extension {extension:?}");
            return Some(reject(StatusCode::FORBIDDEN));
        }
    }

    for caps in part_type_re().captures_iter(&excerpt) {
        let mime = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let allowed = state
            .config
            .uploads
            .allowed_mime_types
            .iter()
            .any(|m| m == mime);
        if !allowed {
            warn!("rejecting upload with disallowed content type {mime:?}");
            return Some(reject(StatusCode::FORBIDDEN));
        }
    }

    None
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"filename="([^"]+)""#).expect("filename regex should compile"))
}

fn part_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^content-type:\s*([\w.+-]+/[\w.+-]+)")
            .expect("part content-type regex should compile")
    })
}

fn build_context(
    state: &SecurityState,
    parts: &Parts,
    body: &Bytes,
    source: IpAddr,
    user_agent: Option<String>,
) -> RequestContext {
    let headers_text: String = parts
        .headers
        .iter()
        .map(|(name, value)| {
            format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
        })
        .collect::<Vec<_>>()
        .join("\n");

    let excerpt_len = body.len().min(state.config.waf.inspect_body_bytes);
    RequestContext {
        source,
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        path: parts.uri.path().to_string(),
        user_agent,
        headers_text,
        body_excerpt: String::from_utf8_lossy(&body[..excerpt_len]).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> SecurityState {
        let mut config = SecurityConfig::default();
        config.logging.dir = dir.path().to_string_lossy().to_string();
        SecurityState::new(config).unwrap()
    }

    #[test]
    fn blocked_agent_honors_bot_allowlist() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert!(is_blocked_agent(&state, "sqlmap/1.7"));
        assert!(!is_blocked_agent(&state, "Mozilla/5.0 Chrome/120"));
        // Googlebot stays allowed even though crawlers match broad patterns.
        assert!(!is_blocked_agent(&state, "Googlebot/2.1"));
    }

    #[test]
    fn forwarded_for_takes_precedence() {
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn missing_connection_info_falls_back_to_unspecified() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn upload_checks_flag_disallowed_extension() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            "multipart/form-data; boundary=deadbeef".parse().unwrap(),
        );

        let evil = Bytes::from(
            "--deadbeef\r\nContent-Disposition: form-data; name=\"file\"; filename=\"shell.php\"\r\nContent-Type: image/png\r\n\r\n...",
        );
        assert!(check_upload(&state, &headers, &evil).is_some());

        let fine = Bytes::from(
            "--deadbeef\r\nContent-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\nContent-Type: image/png\r\n\r\n...",
        );
        assert!(check_upload(&state, &headers, &fine).is_none());
    }

    #[test]
    fn upload_checks_flag_disallowed_mime_type() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            "multipart/form-data; boundary=b".parse().unwrap(),
        );
        let body = Bytes::from(
            "--b\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\nContent-Type: application/x-httpd-php\r\n\r\n...",
        );
        assert!(check_upload(&state, &headers, &body).is_some());
    }

    #[test]
    fn non_multipart_bodies_skip_upload_checks() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let headers = HeaderMap::new();
        let body = Bytes::from("filename=\"shell.php\"");
        assert!(check_upload(&state, &headers, &body).is_none());
    }
}
