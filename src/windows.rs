//! Per-source sliding-window accounting.
//!
//! Each source IP owns two ordered timestamp lists: one for requests (DDoS
//! detection) and one for authentication failures (brute-force detection).
//! Counting operations prune entries older than the window before counting,
//! and the names say so; there is deliberately no non-mutating threshold
//! query. Callers must hold the tracker's lock across the whole
//! record/prune/count sequence so concurrent requests from the same source
//! cannot interleave.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Requests,
    Failures,
}

#[derive(Debug, Default)]
struct SourceWindows {
    requests: Vec<i64>,
    failures: Vec<i64>,
    last_seen_ms: i64,
}

impl SourceWindows {
    fn list(&mut self, kind: WindowKind) -> &mut Vec<i64> {
        match kind {
            WindowKind::Requests => &mut self.requests,
            WindowKind::Failures => &mut self.failures,
        }
    }
}

/// Sliding-window state for every source the process has seen.
#[derive(Debug, Default)]
pub struct SourceTracker {
    sources: HashMap<IpAddr, SourceWindows>,
}

impl SourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request timestamp for `source`.
    pub fn record_request(&mut self, source: IpAddr, now_ms: i64) {
        self.record(source, WindowKind::Requests, now_ms);
    }

    /// Append a failure timestamp for `source`. The caller decides what a
    /// failure is (a 401 response observed by the response hook).
    pub fn record_failure(&mut self, source: IpAddr, now_ms: i64) {
        self.record(source, WindowKind::Failures, now_ms);
    }

    fn record(&mut self, source: IpAddr, kind: WindowKind, now_ms: i64) {
        let entry = self.sources.entry(source).or_default();
        entry.last_seen_ms = now_ms;
        entry.list(kind).push(now_ms);
    }

    /// Drop entries older than `now_ms - window_ms`, then return how many
    /// remain. Mutates the window; the name is the contract.
    pub fn prune_and_count(
        &mut self,
        source: IpAddr,
        kind: WindowKind,
        window_ms: i64,
        now_ms: i64,
    ) -> usize {
        match self.sources.get_mut(&source) {
            Some(entry) => {
                let list = entry.list(kind);
                list.retain(|t| now_ms - *t <= window_ms);
                list.len()
            }
            None => 0,
        }
    }

    /// Reset one window after a threshold has fired, so a sustained burst
    /// produces one event per threshold crossing rather than one per request.
    pub fn clear_window(&mut self, source: IpAddr, kind: WindowKind) {
        if let Some(entry) = self.sources.get_mut(&source) {
            entry.list(kind).clear();
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Evict sources with no activity in the last `idle_ttl_ms`. Returns the
    /// number of evicted sources. Called from the periodic sweep task; without
    /// it a source that never returns would pin its windows for the process
    /// lifetime.
    pub fn sweep_idle(&mut self, idle_ttl_ms: i64, now_ms: i64) -> usize {
        let before = self.sources.len();
        self.sources
            .retain(|_, w| now_ms - w.last_seen_ms <= idle_ttl_ms);
        before - self.sources.len()
    }
}

/// Process-wide request/error windows backing the dashboard's hourly error
/// rate. Same prune-on-touch discipline as the per-source windows.
#[derive(Debug, Default)]
pub struct GlobalWindows {
    requests: Vec<i64>,
    errors: Vec<i64>,
}

impl GlobalWindows {
    pub fn record_request(&mut self, window_ms: i64, now_ms: i64) {
        self.requests.retain(|t| now_ms - *t <= window_ms);
        self.requests.push(now_ms);
    }

    pub fn record_error(&mut self, window_ms: i64, now_ms: i64) {
        self.errors.retain(|t| now_ms - *t <= window_ms);
        self.errors.push(now_ms);
    }

    /// Errors divided by requests over the retained window, in [0.0, 1.0].
    pub fn error_rate(&self) -> f64 {
        if self.requests.is_empty() {
            0.0
        } else {
            self.errors.len() as f64 / self.requests.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn prune_and_count_drops_old_entries() {
        let mut tracker = SourceTracker::new();
        let src = ip(1);
        tracker.record_request(src, 1_000);
        tracker.record_request(src, 30_000);
        tracker.record_request(src, 59_000);

        // 60s window evaluated at t=61s keeps the two newer entries.
        let count = tracker.prune_and_count(src, WindowKind::Requests, 60_000, 61_000);
        assert_eq!(count, 2);
    }

    #[test]
    fn unknown_source_counts_zero() {
        let mut tracker = SourceTracker::new();
        assert_eq!(
            tracker.prune_and_count(ip(9), WindowKind::Failures, 1_000, 1_000),
            0
        );
    }

    #[test]
    fn request_and_failure_windows_are_independent() {
        let mut tracker = SourceTracker::new();
        let src = ip(2);
        tracker.record_request(src, 100);
        tracker.record_failure(src, 100);
        tracker.record_failure(src, 200);
        assert_eq!(
            tracker.prune_and_count(src, WindowKind::Requests, 1_000, 200),
            1
        );
        assert_eq!(
            tracker.prune_and_count(src, WindowKind::Failures, 1_000, 200),
            2
        );
    }

    #[test]
    fn clear_window_resets_only_one_kind() {
        let mut tracker = SourceTracker::new();
        let src = ip(3);
        tracker.record_request(src, 100);
        tracker.record_failure(src, 100);
        tracker.clear_window(src, WindowKind::Failures);
        assert_eq!(
            tracker.prune_and_count(src, WindowKind::Failures, 1_000, 100),
            0
        );
        assert_eq!(
            tracker.prune_and_count(src, WindowKind::Requests, 1_000, 100),
            1
        );
    }

    #[test]
    fn sweep_evicts_idle_sources() {
        let mut tracker = SourceTracker::new();
        tracker.record_request(ip(1), 1_000);
        tracker.record_request(ip(2), 500_000);
        let evicted = tracker.sweep_idle(60_000, 520_000);
        assert_eq!(evicted, 1);
        assert_eq!(tracker.source_count(), 1);
    }

    /// Pruned count must equal an independent recount of timestamps within
    /// [now - window, now], for arbitrary timestamp sequences.
    #[test]
    fn prune_matches_independent_recount() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let now_ms: i64 = 10_000_000;
            let window_ms: i64 = rng.gen_range(1_000..120_000);
            let timestamps: Vec<i64> = (0..rng.gen_range(0..200))
                .map(|_| now_ms - rng.gen_range(0..window_ms * 2))
                .collect();

            let mut tracker = SourceTracker::new();
            let src = ip(7);
            for t in &timestamps {
                tracker.record_request(src, *t);
            }

            let expected = timestamps
                .iter()
                .filter(|t| now_ms - **t <= window_ms)
                .count();
            let counted = tracker.prune_and_count(src, WindowKind::Requests, window_ms, now_ms);
            assert_eq!(counted, expected);

            // A second evaluation over the pruned window agrees.
            let again = tracker.prune_and_count(src, WindowKind::Requests, window_ms, now_ms);
            assert_eq!(again, expected);
        }
    }

    #[test]
    fn global_error_rate() {
        let mut g = GlobalWindows::default();
        for i in 0..10 {
            g.record_request(3_600_000, i * 1_000);
        }
        g.record_error(3_600_000, 5_000);
        g.record_error(3_600_000, 6_000);
        assert!((g.error_rate() - 0.2).abs() < f64::EPSILON);
    }
}
