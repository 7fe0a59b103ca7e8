//! Security header composition.
//!
//! Builds the full response header set (CSP with a per-request nonce, HSTS,
//! frame/sniffing/referrer policies, cross-origin isolation in production)
//! and strips identifying headers. Composition must never fail a request: if
//! a header value cannot be assembled the middleware falls back to a static
//! safe baseline instead of sending the response bare.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::Environment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,

    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,

    /// Preload is forced off in development regardless of this setting.
    #[serde(default = "default_true")]
    pub hsts_preload: bool,

    /// Extra origins allowed in `connect-src` in production.
    #[serde(default)]
    pub connect_src: Vec<String>,

    /// Start in report-only mode instead of enforcing CSP.
    #[serde(default)]
    pub report_only: bool,

    #[serde(default = "default_report_uri")]
    pub report_uri: String,
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

fn default_true() -> bool {
    true
}

fn default_report_uri() -> String {
    "/api/security/csp-report".to_string()
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: true,
            hsts_preload: true,
            connect_src: Vec::new(),
            report_only: false,
            report_uri: default_report_uri(),
        }
    }
}

/// Fresh random nonce, URL-safe base64. One per request, never reused.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Per-request CSP nonce handed to handlers through request extensions.
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

/// The header set computed for the current response, stashed in request
/// extensions so the audit endpoints can score exactly what will be sent.
#[derive(Debug, Clone)]
pub struct ComputedHeaders(pub HeaderMap);

/// Active header policy. Constructed once from config; the report-only flag
/// can be flipped at runtime through the API.
pub struct HeaderPolicy {
    env: Environment,
    config: HeaderConfig,
    report_only: AtomicBool,
}

pub const CSP: &str = "content-security-policy";
pub const CSP_REPORT_ONLY: &str = "content-security-policy-report-only";

/// Headers a compliant response must carry; drives the audit score.
pub const REQUIRED_HEADERS: [&str; 7] = [
    CSP,
    "strict-transport-security",
    "x-frame-options",
    "x-content-type-options",
    "x-xss-protection",
    "referrer-policy",
    "permissions-policy",
];

impl HeaderPolicy {
    pub fn new(env: Environment, config: HeaderConfig) -> Self {
        let report_only = AtomicBool::new(config.report_only);
        Self {
            env,
            config,
            report_only,
        }
    }

    pub fn report_only(&self) -> bool {
        self.report_only.load(Ordering::Relaxed)
    }

    pub fn set_report_only(&self, value: bool) {
        self.report_only.store(value, Ordering::Relaxed);
    }

    pub fn environment(&self) -> Environment {
        self.env
    }

    /// Assemble the CSP directive set with `nonce` substituted into the
    /// script and style sources.
    pub fn build_csp(&self, nonce: &str) -> String {
        let mut directives: Vec<String> = vec!["default-src 'self'".into()];

        match self.env {
            Environment::Development => {
                directives.push("script-src 'self' 'unsafe-inline' 'unsafe-eval'".into());
                directives.push("style-src 'self' 'unsafe-inline'".into());
                directives.push(
                    "connect-src 'self' ws://localhost:* wss://localhost:* http://localhost:*"
                        .into(),
                );
            }
            Environment::Production => {
                directives.push(format!("script-src 'self' 'nonce-{nonce}'"));
                directives.push(format!("style-src 'self' 'nonce-{nonce}'"));
                let mut connect = String::from("connect-src 'self'");
                for origin in &self.config.connect_src {
                    connect.push(' ');
                    connect.push_str(origin);
                }
                directives.push(connect);
            }
        }

        directives.push("img-src 'self' data: https:".into());
        directives.push("font-src 'self' data:".into());
        directives.push("object-src 'none'".into());
        directives.push("base-uri 'self'".into());
        directives.push("form-action 'self'".into());
        directives.push("frame-ancestors 'none'".into());
        directives.push(format!("report-uri {}", self.config.report_uri));

        directives.join("; ")
    }

    fn build_hsts(&self) -> String {
        let mut value = format!("max-age={}", self.config.hsts_max_age_secs);
        if self.config.hsts_include_subdomains {
            value.push_str("; includeSubDomains");
        }
        if self.config.hsts_preload && self.env == Environment::Production {
            value.push_str("; preload");
        }
        value
    }

    /// Apply the full header set to a response. Any assembly failure falls
    /// back to the static safe baseline.
    pub fn apply(&self, headers: &mut HeaderMap, nonce: &str) {
        let csp_name = if self.report_only() {
            CSP_REPORT_ONLY
        } else {
            CSP
        };

        let pairs: Vec<(&str, String)> = vec![
            (csp_name, self.build_csp(nonce)),
            ("strict-transport-security", self.build_hsts()),
            ("x-frame-options", "DENY".into()),
            ("x-content-type-options", "nosniff".into()),
            ("x-xss-protection", "1; mode=block".into()),
            ("referrer-policy", "strict-origin-when-cross-origin".into()),
            (
                "permissions-policy",
                "camera=(), microphone=(), geolocation=(), usb=(), payment=(self), fullscreen=(self)"
                    .into(),
            ),
        ];

        let mut assembled = Vec::with_capacity(pairs.len() + 3);
        for (name, value) in &pairs {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => assembled.push((n, v)),
                _ => {
                    warn!("header assembly failed for {name}, applying baseline");
                    apply_fallback(headers);
                    return;
                }
            }
        }
        for (name, value) in assembled {
            headers.insert(name, value);
        }

        if self.env == Environment::Production {
            headers.insert(
                HeaderName::from_static("cross-origin-opener-policy"),
                HeaderValue::from_static("same-origin"),
            );
            headers.insert(
                HeaderName::from_static("cross-origin-resource-policy"),
                HeaderValue::from_static("same-origin"),
            );
            headers.insert(
                HeaderName::from_static("cross-origin-embedder-policy"),
                HeaderValue::from_static("require-corp"),
            );
        }

        headers.remove("x-powered-by");
        headers.remove("server");
    }

    /// Redacted configuration summary: booleans and counts, never raw values.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.env,
            "csp_report_only": self.report_only(),
            "csp_nonce_per_request": true,
            "hsts": {
                "max_age_secs": self.config.hsts_max_age_secs,
                "include_subdomains": self.config.hsts_include_subdomains,
                "preload": self.config.hsts_preload && self.env == Environment::Production,
            },
            "connect_src_origins": self.config.connect_src.len(),
            "required_headers": REQUIRED_HEADERS.len(),
        })
    }
}

/// Static safe baseline applied when normal assembly fails. Better a strict
/// boilerplate policy than a response with no protection at all.
pub fn apply_fallback(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static(CSP),
        HeaderValue::from_static("default-src 'self'; object-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.remove("x-powered-by");
    headers.remove("server");
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderStatus {
    pub name: String,
    pub present: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub score: u32,
    pub compliance: &'static str,
    pub headers: Vec<HeaderStatus>,
}

/// Score a response header set against the required list. CSP counts whether
/// enforced or report-only.
pub fn audit(headers: &HeaderMap) -> AuditReport {
    let statuses: Vec<HeaderStatus> = REQUIRED_HEADERS
        .iter()
        .map(|name| {
            let present = if *name == CSP {
                headers.contains_key(CSP) || headers.contains_key(CSP_REPORT_ONLY)
            } else {
                headers.contains_key(*name)
            };
            HeaderStatus {
                name: (*name).to_string(),
                present,
            }
        })
        .collect();

    let present = statuses.iter().filter(|s| s.present).count();
    let score = (present * 100 / REQUIRED_HEADERS.len()) as u32;
    let compliance = if score >= 95 {
        "advanced"
    } else if score >= 80 {
        "basic"
    } else {
        "insufficient"
    };

    AuditReport {
        score,
        compliance,
        headers: statuses,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderCheck {
    pub check: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderTestReport {
    pub checks: Vec<HeaderCheck>,
    pub score: u32,
    pub passed: bool,
}

/// Per-check pass/fail breakdown over a response header set.
pub fn run_header_tests(headers: &HeaderMap) -> HeaderTestReport {
    let value_of = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let checks = vec![
        HeaderCheck {
            check: "xss_filter",
            passed: value_of("x-xss-protection").starts_with('1'),
        },
        HeaderCheck {
            check: "frame_options",
            passed: matches!(value_of("x-frame-options").as_str(), "DENY" | "SAMEORIGIN"),
        },
        HeaderCheck {
            check: "content_type_sniffing",
            passed: value_of("x-content-type-options") == "nosniff",
        },
        HeaderCheck {
            check: "hsts",
            passed: value_of("strict-transport-security").contains("max-age="),
        },
        HeaderCheck {
            check: "csp",
            passed: headers.contains_key(CSP) || headers.contains_key(CSP_REPORT_ONLY),
        },
    ];

    let passed_count = checks.iter().filter(|c| c.passed).count();
    let score = (passed_count * 100 / checks.len()) as u32;
    HeaderTestReport {
        passed: passed_count == checks.len(),
        score,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(env: Environment) -> HeaderPolicy {
        HeaderPolicy::new(env, HeaderConfig::default())
    }

    #[test]
    fn nonces_are_unique_and_urlsafe() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn production_csp_uses_nonce_not_unsafe_inline() {
        let p = policy(Environment::Production);
        let csp = p.build_csp("abc123");
        assert!(csp.contains("'nonce-abc123'"));
        assert!(!csp.contains("unsafe-inline"));
        assert!(!csp.contains("unsafe-eval"));
    }

    #[test]
    fn development_csp_permits_inline_and_localhost() {
        let p = policy(Environment::Development);
        let csp = p.build_csp("abc123");
        assert!(csp.contains("'unsafe-inline'"));
        assert!(csp.contains("ws://localhost:*"));
        assert!(!csp.contains("nonce-abc123"));
    }

    #[test]
    fn hsts_preload_disabled_in_development() {
        assert!(!policy(Environment::Development).build_hsts().contains("preload"));
        assert!(policy(Environment::Production).build_hsts().contains("preload"));
    }

    #[test]
    fn apply_sets_full_header_set_and_strips_identifiers() {
        let p = policy(Environment::Production);
        let mut headers = HeaderMap::new();
        headers.insert("x-powered-by", HeaderValue::from_static("Express"));
        headers.insert("server", HeaderValue::from_static("nginx"));

        p.apply(&mut headers, &generate_nonce());

        assert!(headers.contains_key(CSP));
        assert!(headers.contains_key("cross-origin-opener-policy"));
        assert!(!headers.contains_key("x-powered-by"));
        assert!(!headers.contains_key("server"));

        let report = audit(&headers);
        assert_eq!(report.score, 100);
        assert_eq!(report.compliance, "advanced");
    }

    #[test]
    fn report_only_toggle_switches_header_name() {
        let p = policy(Environment::Production);
        p.set_report_only(true);
        let mut headers = HeaderMap::new();
        p.apply(&mut headers, "n0nce");
        assert!(headers.contains_key(CSP_REPORT_ONLY));
        assert!(!headers.contains_key(CSP));

        // CSP still counts toward the audit in report-only mode.
        assert_eq!(audit(&headers).score, 100);
    }

    #[test]
    fn fallback_baseline_scores_at_least_basic() {
        let mut headers = HeaderMap::new();
        apply_fallback(&mut headers);
        let report = audit(&headers);
        assert!(report.score >= 80, "baseline score {}", report.score);
        assert!(run_header_tests(&headers).passed);
    }

    #[test]
    fn header_tests_report_individual_failures() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        let report = run_header_tests(&headers);
        assert!(!report.passed);
        assert_eq!(report.score, 20);
        let sniff = report
            .checks
            .iter()
            .find(|c| c.check == "content_type_sniffing")
            .unwrap();
        assert!(sniff.passed);
    }
}
