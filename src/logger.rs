//! Append-only security event log.
//!
//! One file per calendar day (`security-YYYY-MM-DD.log`), one JSON object per
//! line, wrapped in a `{timestamp, level, ...}` envelope. There is no update,
//! delete, index, or compaction; reads glob the last N days and filter by the
//! timestamp field. Write failures are logged and swallowed; the log must
//! never take the request path down with it.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::models::{AnomalyRecord, AttackEvent};

#[derive(Debug, Clone)]
pub struct SecurityLogger {
    dir: PathBuf,
}

impl SecurityLogger {
    pub fn new<P: AsRef<Path>>(dir: P) -> crate::error::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("security-{}.log", date.format("%Y-%m-%d")))
    }

    /// Append one entry to today's file. `fields` is merged into the envelope;
    /// envelope keys win on collision.
    pub async fn append(&self, level: &str, fields: Value) {
        let now = Utc::now();
        let mut envelope = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("message".to_string(), other);
                map
            }
        };
        envelope.insert("timestamp".to_string(), json!(now.to_rfc3339()));
        envelope.insert("level".to_string(), json!(level));

        let line = Value::Object(envelope).to_string();
        let path = self.file_for(now.date_naive());
        if let Err(e) = self.write_line(&path, &line).await {
            // Console fallback; the entry is lost but the request is not.
            error!(path = %path.display(), "security log write failed: {e}");
        }
    }

    async fn write_line(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn log_attack(&self, event: &AttackEvent) {
        let fields = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!("attack event serialization failed: {e}");
                return;
            }
        };
        self.append("attack", fields).await;
    }

    pub async fn log_anomaly(&self, record: &AnomalyRecord) {
        let fields = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(e) => {
                warn!("anomaly record serialization failed: {e}");
                return;
            }
        };
        self.append("anomaly", fields).await;
    }

    /// Scan the last `max_days` daily files and return entries whose envelope
    /// timestamp is at or after `cutoff`. Unparseable lines are skipped.
    pub async fn query_since(&self, cutoff: DateTime<Utc>, max_days: u64) -> Vec<Value> {
        let mut entries = Vec::new();
        let today = Utc::now().date_naive();
        for back in 0..max_days {
            let Some(date) = today.checked_sub_days(Days::new(back)) else {
                break;
            };
            let path = self.file_for(date);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            for line in content.lines() {
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                let fresh = value
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(false);
                if fresh {
                    entries.push(value);
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new(dir.path()).unwrap();

        logger
            .append("csp_report", json!({"blocked-uri": "https://evil.example/x.js"}))
            .await;
        logger.append("attack", json!({"attack_type": "xss"})).await;

        let cutoff = Utc::now() - Duration::minutes(5);
        let entries = logger.query_since(cutoff, 2).await;
        assert_eq!(entries.len(), 2);

        let report = entries
            .iter()
            .find(|e| e["level"] == "csp_report")
            .expect("csp report entry");
        // Payload survives verbatim under the envelope.
        assert_eq!(report["blocked-uri"], "https://evil.example/x.js");
        assert!(report["timestamp"].is_string());
    }

    #[tokio::test]
    async fn query_filters_by_cutoff() {
        let dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new(dir.path()).unwrap();
        logger.append("attack", json!({"n": 1})).await;

        let future_cutoff = Utc::now() + Duration::minutes(5);
        assert!(logger.query_since(future_cutoff, 2).await.is_empty());
    }

    #[tokio::test]
    async fn non_object_fields_become_message() {
        let dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new(dir.path()).unwrap();
        logger.append("info", json!("daemon started")).await;

        let entries = logger
            .query_since(Utc::now() - Duration::minutes(1), 1)
            .await;
        assert_eq!(entries[0]["message"], "daemon started");
    }
}
