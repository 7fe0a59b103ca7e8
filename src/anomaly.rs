//! Statistical anomaly baselining.
//!
//! Keeps a bounded ring buffer of the most recent observations per named
//! metric and flags values more than three standard deviations above the
//! mean. Statistics are recomputed from the buffer on every call; at 100
//! samples per metric that is cheaper than being clever.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use crate::models::{AnomalyRecord, Severity};

/// Samples retained per metric.
const BASELINE_CAPACITY: usize = 100;
/// Below this many samples the baseline is not trusted and nothing is flagged.
const MIN_SAMPLES: usize = 10;

#[derive(Debug, Default)]
struct Baseline {
    samples: VecDeque<f64>,
}

impl Baseline {
    fn push(&mut self, value: f64) {
        if self.samples.len() == BASELINE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn mean_and_std_dev(&self) -> (f64, f64) {
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / n;
        let variance = self
            .samples
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        (mean, variance.sqrt())
    }
}

/// Per-metric baselines plus the history of everything that was flagged.
/// Baselines are never reset except by process restart.
#[derive(Debug, Default)]
pub struct AnomalyEngine {
    baselines: HashMap<String, Baseline>,
    history: Vec<AnomalyRecord>,
}

impl AnomalyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed an observation into the metric's ring buffer.
    pub fn update_baseline(&mut self, metric: &str, value: f64) {
        self.baselines
            .entry(metric.to_string())
            .or_default()
            .push(value);
    }

    /// Check `value` against the metric's current baseline. Returns the
    /// recorded anomaly when the value exceeds mean + 3σ; severity is High
    /// past mean + 5σ, Medium otherwise. Advisory only: never blocks,
    /// never errors.
    pub fn detect_anomaly(&mut self, metric: &str, value: f64) -> Option<AnomalyRecord> {
        let baseline = self.baselines.get(metric)?;
        if baseline.samples.len() < MIN_SAMPLES {
            return None;
        }

        let (mean, std_dev) = baseline.mean_and_std_dev();
        if value <= mean + 3.0 * std_dev {
            return None;
        }

        let severity = if value > mean + 5.0 * std_dev {
            Severity::High
        } else {
            Severity::Medium
        };
        let record = AnomalyRecord {
            metric: metric.to_string(),
            value,
            mean,
            std_dev,
            severity,
            timestamp: Utc::now(),
        };
        self.history.push(record.clone());
        Some(record)
    }

    /// Anomalies flagged at or after `cutoff`.
    pub fn recent(&self, cutoff: DateTime<Utc>) -> Vec<AnomalyRecord> {
        self.history
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn metric_count(&self) -> usize {
        self.baselines.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Drop flagged history older than `cutoff`. The log files keep the full
    /// record; memory only serves the dashboard's recency window.
    pub fn trim_history(&mut self, cutoff: DateTime<Utc>) {
        self.history.retain(|r| r.timestamp >= cutoff);
    }
}
