//! Shared security state.
//!
//! One `SecurityState` is constructed at process start and handed to the
//! middleware chain and API handlers by `Arc`. Nothing in here is a
//! module-level singleton; tests build as many independent states as they
//! like. Lock discipline: every critical section is short and free of await
//! points, and whole record/prune/count sequences run under a single lock
//! acquisition.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::alert::AlertDispatcher;
use crate::anomaly::AnomalyEngine;
use crate::config::SecurityConfig;
use crate::error::{Result, WardenError};
use crate::headers::HeaderPolicy;
use crate::logger::SecurityLogger;
use crate::models::{AnomalyRecord, AttackEvent};
use crate::patterns::PatternLibrary;
use crate::windows::{GlobalWindows, SourceTracker};

pub struct SecurityState {
    pub config: SecurityConfig,
    pub patterns: PatternLibrary,
    pub tracker: Mutex<SourceTracker>,
    pub anomalies: Mutex<AnomalyEngine>,
    pub events: RwLock<Vec<AttackEvent>>,
    pub alerts: AlertDispatcher,
    pub logger: SecurityLogger,
    pub headers: HeaderPolicy,
    pub global: Mutex<GlobalWindows>,
    pub total_requests: AtomicU64,
    pub blocked_agents: Vec<Regex>,
    pub allowed_bots: Vec<Regex>,
}

impl SecurityState {
    pub fn new(config: SecurityConfig) -> Result<Self> {
        let patterns = PatternLibrary::new()?;
        let logger = SecurityLogger::new(&config.logging.dir)?;
        let headers = HeaderPolicy::new(config.environment, config.headers.clone());
        let alerts = AlertDispatcher::new(config.alerts.clone());

        let blocked_agents = compile_agent_patterns(&config.blocklist.blocked_user_agents)?;
        let allowed_bots = compile_agent_patterns(&config.blocklist.allowed_bots)?;

        Ok(Self {
            patterns,
            tracker: Mutex::new(SourceTracker::new()),
            anomalies: Mutex::new(AnomalyEngine::new()),
            events: RwLock::new(Vec::new()),
            alerts,
            logger,
            headers,
            global: Mutex::new(GlobalWindows::default()),
            total_requests: AtomicU64::new(0),
            blocked_agents,
            allowed_bots,
            config,
        })
    }

    /// Record a detected attack: append to the in-memory list, persist to the
    /// security log on a detached task, and offer to the alert dispatcher.
    /// Nothing here can fail the request that triggered the detection.
    pub fn record_event(&self, event: AttackEvent) {
        debug!(
            "attack recorded: {} from {} ({:?})",
            event.attack_type, event.source, event.severity
        );
        self.events.write().push(event.clone());

        let logger = self.logger.clone();
        let for_log = event.clone();
        tokio::spawn(async move {
            logger.log_attack(&for_log).await;
        });

        self.alerts.dispatch(&event, event.timestamp.timestamp_millis());
    }

    /// Persist a flagged anomaly; the engine already keeps it in history.
    pub fn record_anomaly(&self, record: AnomalyRecord) {
        let logger = self.logger.clone();
        tokio::spawn(async move {
            logger.log_anomaly(&record).await;
        });
    }

    pub fn recent_events(&self, cutoff: DateTime<Utc>) -> Vec<AttackEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Sources ranked by attack count over the retained event list.
    pub fn top_attackers(&self, limit: usize) -> Vec<(IpAddr, usize)> {
        let mut counts: HashMap<IpAddr, usize> = HashMap::new();
        for event in self.events.read().iter() {
            *counts.entry(event.source).or_insert(0) += 1;
        }
        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        ranked
    }

    /// Periodic maintenance: evict idle sources, trim retained events and
    /// anomaly history. Bounds the memory the counters can consume.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let idle_ttl_ms = self.config.sweep.idle_ttl_secs as i64 * 1000;
        let evicted = self.tracker.lock().sweep_idle(idle_ttl_ms, now_ms);

        let retention = Duration::seconds(self.config.sweep.event_retention_secs as i64);
        let cutoff = now - retention;
        self.events.write().retain(|e| e.timestamp >= cutoff);
        self.anomalies.lock().trim_history(cutoff);

        if evicted > 0 {
            debug!("sweep evicted {evicted} idle sources");
        }
    }

    /// Run `sweep` on an interval until the process exits.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let interval_secs = state.config.sweep.interval_secs.max(1);
        info!("sweep task running every {interval_secs}s");
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                state.sweep(Utc::now());
            }
        })
    }

    pub fn bump_total_requests(&self) -> u64 {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn compile_agent_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| WardenError::Config(format!("invalid user-agent pattern {p:?}: {e}")))
        })
        .collect()
}
