use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::patterns::PatternCategory;

/// Classification assigned to a detected attack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    SqlInjection,
    Xss,
    BruteForce,
    Ddos,
    PathTraversal,
    CommandInjection,
    SuspiciousPattern,
}

impl AttackType {
    /// Fixed severity mapping per attack classification.
    ///
    /// Command injection carries the same weight as SQL injection and XSS;
    /// an injected shell command is not less dangerous than an injected query.
    pub fn severity(self) -> Severity {
        match self {
            AttackType::SqlInjection => Severity::High,
            AttackType::Xss => Severity::High,
            AttackType::BruteForce => Severity::Medium,
            AttackType::Ddos => Severity::High,
            AttackType::PathTraversal => Severity::Medium,
            AttackType::CommandInjection => Severity::High,
            AttackType::SuspiciousPattern => Severity::Low,
        }
    }
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackType::SqlInjection => write!(f, "sql_injection"),
            AttackType::Xss => write!(f, "xss"),
            AttackType::BruteForce => write!(f, "brute_force"),
            AttackType::Ddos => write!(f, "ddos"),
            AttackType::PathTraversal => write!(f, "path_traversal"),
            AttackType::CommandInjection => write!(f, "command_injection"),
            AttackType::SuspiciousPattern => write!(f, "suspicious_pattern"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Context captured alongside an attack, with the fields that are actually
/// meaningful for the given classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttackDetails {
    /// A signature category matched somewhere in the request.
    PatternMatch {
        url: String,
        method: String,
        user_agent: Option<String>,
        category: PatternCategory,
    },
    /// Volumetric burst from a single source.
    Flood {
        url: String,
        requests_in_window: usize,
        window_secs: u64,
    },
    /// Repeated authentication failures from a single source.
    AuthFailures {
        url: String,
        user_agent: Option<String>,
        failures_in_window: usize,
        window_secs: u64,
    },
    /// A client identifying itself with a blocked user-agent.
    SuspiciousAgent { url: String, user_agent: String },
}

/// Immutable record of a detected attack. Created once, appended to the
/// in-memory event list and the security log, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackEvent {
    pub id: String,
    pub attack_type: AttackType,
    pub source: IpAddr,
    pub details: AttackDetails,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl AttackEvent {
    pub fn new(attack_type: AttackType, source: IpAddr, details: AttackDetails) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attack_type,
            source,
            details,
            timestamp: Utc::now(),
            severity: attack_type.severity(),
        }
    }
}

/// A flagged outlier observation against a metric baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub metric: String,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_is_fixed() {
        assert_eq!(AttackType::SqlInjection.severity(), Severity::High);
        assert_eq!(AttackType::Xss.severity(), Severity::High);
        assert_eq!(AttackType::BruteForce.severity(), Severity::Medium);
        assert_eq!(AttackType::Ddos.severity(), Severity::High);
        assert_eq!(AttackType::PathTraversal.severity(), Severity::Medium);
        assert_eq!(AttackType::CommandInjection.severity(), Severity::High);
        assert_eq!(AttackType::SuspiciousPattern.severity(), Severity::Low);
    }

    #[test]
    fn attack_type_display() {
        assert_eq!(AttackType::SqlInjection.to_string(), "sql_injection");
        assert_eq!(AttackType::BruteForce.to_string(), "brute_force");
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let event = AttackEvent::new(
            AttackType::Xss,
            "1.2.3.4".parse().unwrap(),
            AttackDetails::SuspiciousAgent {
                url: "/".into(),
                user_agent: "sqlmap".into(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"xss\""));
        assert!(json.contains("\"1.2.3.4\""));
        assert!(json.contains("\"high\""));
    }
}
