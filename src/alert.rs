//! Outbound alert fan-out.
//!
//! Every recorded attack is offered to the dispatcher; at most one alert per
//! (attack type, source, minute bucket) actually leaves the process. Dedup
//! suppresses notification noise only; event creation and logging are not
//! affected. Delivery runs on spawned tasks with a bounded client timeout so
//! the response that triggered the alert never waits on a webhook.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::{AttackEvent, AttackType};

/// Dedup set capacity; when full the oldest half is evicted.
const DEDUP_CAPACITY: usize = 1000;
/// One alert per (type, source) per this many milliseconds.
const DEDUP_BUCKET_MS: i64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Generic webhook receiving the raw event JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Chat webhook receiving a formatted text summary.
    #[serde(default)]
    pub chat_webhook_url: Option<String>,

    /// Recipients for email alerts. No provider is wired up; configured
    /// recipients produce a logged stub instead of silent nothing.
    #[serde(default)]
    pub email_recipients: Vec<String>,

    /// Outbound request timeout in seconds.
    #[serde(default = "default_alert_timeout")]
    pub timeout_secs: u64,
}

fn default_alert_timeout() -> u64 {
    5
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            chat_webhook_url: None,
            email_recipients: Vec::new(),
            timeout_secs: default_alert_timeout(),
        }
    }
}

impl AlertConfig {
    pub fn any_channel_enabled(&self) -> bool {
        self.webhook_url.is_some()
            || self.chat_webhook_url.is_some()
            || !self.email_recipients.is_empty()
    }
}

/// Insertion-ordered bounded set of dedup keys.
#[derive(Debug, Default)]
struct DedupSet {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupSet {
    /// Returns true the first time a key is seen; false on repeats.
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() >= DEDUP_CAPACITY {
            for _ in 0..DEDUP_CAPACITY / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.keys.remove(&old);
                }
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct AlertDispatcher {
    config: AlertConfig,
    client: reqwest::Client,
    sent: Mutex<DedupSet>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("alert http client build failed, using defaults: {e}");
                reqwest::Client::new()
            }
        };
        Self {
            config,
            client,
            sent: Mutex::new(DedupSet::default()),
        }
    }

    /// Whether an alert for (type, source) should go out in the minute bucket
    /// containing `now_ms`. Consumes a dedup slot when it answers yes.
    pub fn should_send(&self, attack_type: AttackType, source: IpAddr, now_ms: i64) -> bool {
        let key = format!("{attack_type}:{source}:{}", now_ms / DEDUP_BUCKET_MS);
        self.sent.lock().insert(key)
    }

    /// Offer an event for delivery. Deduplicates, then fans out to every
    /// configured channel on detached tasks. Channel failures are logged and
    /// never reach the caller.
    pub fn dispatch(&self, event: &AttackEvent, now_ms: i64) {
        if !self.config.any_channel_enabled() {
            return;
        }
        if !self.should_send(event.attack_type, event.source, now_ms) {
            debug!(
                "alert suppressed for {} from {} (already sent this minute)",
                event.attack_type, event.source
            );
            return;
        }

        if let Some(url) = self.config.webhook_url.clone() {
            let client = self.client.clone();
            let payload = match serde_json::to_value(event) {
                Ok(v) => v,
                Err(e) => {
                    warn!("alert payload serialization failed: {e}");
                    return;
                }
            };
            tokio::spawn(async move {
                match client.post(&url).json(&payload).send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!("alert webhook returned {}", resp.status());
                    }
                    Ok(_) => {}
                    Err(e) => error!("alert webhook delivery failed: {e}"),
                }
            });
        }

        if let Some(url) = self.config.chat_webhook_url.clone() {
            let client = self.client.clone();
            let text = format_summary(event);
            tokio::spawn(async move {
                let body = json!({ "text": text });
                match client.post(&url).json(&body).send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!("chat webhook returned {}", resp.status());
                    }
                    Ok(_) => {}
                    Err(e) => error!("chat webhook delivery failed: {e}"),
                }
            });
        }

        if !self.config.email_recipients.is_empty() {
            // No mail provider is configured in this deployment; record the
            // intent so operators can see what would have been sent.
            info!(
                recipients = self.config.email_recipients.len(),
                "email alert (stub): {} from {}", event.attack_type, event.source
            );
        }
    }
}

fn format_summary(event: &AttackEvent) -> String {
    format!(
        "[{}] {} detected from {} at {}",
        serde_json::to_string(&event.severity)
            .unwrap_or_default()
            .trim_matches('"'),
        event.attack_type,
        event.source,
        event.timestamp.to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttackDetails;

    fn src() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[test]
    fn dedup_suppresses_within_minute_bucket() {
        let dispatcher = AlertDispatcher::new(AlertConfig::default());
        let t0 = 1_700_000_000_000_i64;

        assert!(dispatcher.should_send(AttackType::Xss, src(), t0));
        // Same bucket, same pair: suppressed.
        assert!(!dispatcher.should_send(AttackType::Xss, src(), t0 + 30_000));
        // Next minute bucket: sent again.
        assert!(dispatcher.should_send(AttackType::Xss, src(), t0 + DEDUP_BUCKET_MS));
    }

    #[test]
    fn dedup_distinguishes_type_and_source() {
        let dispatcher = AlertDispatcher::new(AlertConfig::default());
        let t0 = 1_700_000_000_000_i64;

        assert!(dispatcher.should_send(AttackType::Xss, src(), t0));
        assert!(dispatcher.should_send(AttackType::SqlInjection, src(), t0));
        assert!(dispatcher.should_send(AttackType::Xss, "5.6.7.8".parse().unwrap(), t0));
    }

    #[test]
    fn dedup_set_evicts_oldest_half_at_capacity() {
        let mut set = DedupSet::default();
        for i in 0..DEDUP_CAPACITY {
            assert!(set.insert(format!("key-{i}")));
        }
        assert_eq!(set.keys.len(), DEDUP_CAPACITY);

        // The next insert evicts the oldest half.
        assert!(set.insert("overflow".to_string()));
        assert_eq!(set.keys.len(), DEDUP_CAPACITY / 2 + 1);
        // Early keys were evicted and may fire again; late keys still dedup.
        assert!(set.insert("key-0".to_string()));
        assert!(!set.insert(format!("key-{}", DEDUP_CAPACITY - 1)));
    }

    #[test]
    fn summary_is_human_readable() {
        let event = AttackEvent::new(
            AttackType::Ddos,
            src(),
            AttackDetails::Flood {
                url: "/checkout".into(),
                requests_in_window: 1500,
                window_secs: 60,
            },
        );
        let text = format_summary(&event);
        assert!(text.contains("ddos"));
        assert!(text.contains("1.2.3.4"));
        assert!(text.contains("high"));
    }
}
