//! Request and response classification.
//!
//! Composes the pattern library and the sliding-window counters into named
//! attack events. Evaluation order is fixed: signature categories first
//! (body/query/headers composite, path-only for traversal), then the
//! volumetric window. Brute force is evaluated on the response side, against
//! 401s only. Detection is advisory here; whether a verdict blocks is the
//! guard's call, and an internal failure during evaluation is logged and
//! treated as "no detection" so the protected application stays up.

use std::net::IpAddr;
use tracing::warn;

use crate::models::{AttackDetails, AttackEvent, AttackType};
use crate::patterns::{decode_layers, PatternCategory};
use crate::state::SecurityState;
use crate::windows::WindowKind;

/// Request fields the detector inspects, extracted once by the middleware.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source: IpAddr,
    pub method: String,
    pub uri: String,
    pub path: String,
    pub user_agent: Option<String>,
    pub headers_text: String,
    pub body_excerpt: String,
}

#[derive(Debug, Default)]
pub struct Verdict {
    pub matched: Vec<PatternCategory>,
    pub block: bool,
}

fn attack_type_for(category: PatternCategory) -> AttackType {
    match category {
        PatternCategory::SqlInjection => AttackType::SqlInjection,
        PatternCategory::Xss => AttackType::Xss,
        PatternCategory::PathTraversal => AttackType::PathTraversal,
        PatternCategory::CommandInjection => AttackType::CommandInjection,
        // LDAP and XML probes have no dedicated classification; they are
        // recorded as suspicious patterns.
        PatternCategory::LdapInjection | PatternCategory::XmlInjection => {
            AttackType::SuspiciousPattern
        }
    }
}

/// Evaluate a request against every signature category and the volumetric
/// window. Records one event per matched classification; a request can
/// trigger several at once.
pub fn evaluate_request(state: &SecurityState, ctx: &RequestContext, now_ms: i64) -> Verdict {
    state.bump_total_requests();
    state
        .global
        .lock()
        .record_request(3_600_000, now_ms);

    let mut verdict = Verdict::default();

    // Composite of body, query string, and headers; path traversal is
    // checked against the URL path alone. Signatures are tested on the raw
    // text and on a double-percent-decoded rendering of it.
    let composite = format!("{}\n{}\n{}", ctx.uri, ctx.headers_text, ctx.body_excerpt);
    let composite_decoded = decode_layers(&composite);
    let path_decoded = decode_layers(&ctx.path);

    for category in PatternCategory::ALL {
        let matched = if category == PatternCategory::PathTraversal {
            state.patterns.matches(&ctx.path, category)
                || state.patterns.matches(&path_decoded, category)
        } else {
            state.patterns.matches(&composite, category)
                || state.patterns.matches(&composite_decoded, category)
        };
        if !matched {
            continue;
        }

        verdict.matched.push(category);
        state.record_event(AttackEvent::new(
            attack_type_for(category),
            ctx.source,
            AttackDetails::PatternMatch {
                url: ctx.uri.clone(),
                method: ctx.method.clone(),
                user_agent: ctx.user_agent.clone(),
                category,
            },
        ));
    }

    // Volumetric window: record, prune, count under one lock acquisition so
    // concurrent requests from the same source cannot interleave.
    let window_ms = state.config.thresholds.ddos_window_secs as i64 * 1000;
    let threshold = state.config.thresholds.ddos_max_requests;
    let over = {
        let mut tracker = state.tracker.lock();
        tracker.record_request(ctx.source, now_ms);
        let count = tracker.prune_and_count(ctx.source, WindowKind::Requests, window_ms, now_ms);
        if count >= threshold {
            tracker.clear_window(ctx.source, WindowKind::Requests);
            Some(count)
        } else {
            observe_request_rate(state, count);
            None
        }
    };
    if let Some(count) = over {
        state.record_event(AttackEvent::new(
            AttackType::Ddos,
            ctx.source,
            AttackDetails::Flood {
                url: ctx.uri.clone(),
                requests_in_window: count,
                window_secs: state.config.thresholds.ddos_window_secs,
            },
        ));
    }

    verdict.block = state.config.waf.enforce && !verdict.matched.is_empty();
    verdict
}

/// Baseline the per-source request rate and persist anything that stands out.
fn observe_request_rate(state: &SecurityState, count_in_window: usize) {
    let value = count_in_window as f64;
    let flagged = {
        let mut engine = state.anomalies.lock();
        let record = engine.detect_anomaly("source_request_rate", value);
        engine.update_baseline("source_request_rate", value);
        record
    };
    if let Some(record) = flagged {
        warn!(
            metric = %record.metric,
            value = record.value,
            "anomalous request rate (mean {:.1}, stddev {:.1})",
            record.mean,
            record.std_dev
        );
        state.record_anomaly(record);
    }
}

/// Response-side hooks: the hourly error-rate window, and brute-force
/// accounting over 401 responses.
pub fn evaluate_response(state: &SecurityState, ctx: &RequestContext, status: u16, now_ms: i64) {
    if status >= 400 {
        state.global.lock().record_error(3_600_000, now_ms);
    }
    if status != 401 {
        return;
    }

    let window_ms = state.config.thresholds.brute_force_window_secs as i64 * 1000;
    let threshold = state.config.thresholds.brute_force_max_failures;
    let over = {
        let mut tracker = state.tracker.lock();
        tracker.record_failure(ctx.source, now_ms);
        let count = tracker.prune_and_count(ctx.source, WindowKind::Failures, window_ms, now_ms);
        if count >= threshold {
            tracker.clear_window(ctx.source, WindowKind::Failures);
            Some(count)
        } else {
            None
        }
    };
    if let Some(count) = over {
        state.record_event(AttackEvent::new(
            AttackType::BruteForce,
            ctx.source,
            AttackDetails::AuthFailures {
                url: ctx.uri.clone(),
                user_agent: ctx.user_agent.clone(),
                failures_in_window: count,
                window_secs: state.config.thresholds.brute_force_window_secs,
            },
        ));
    }
}
