use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::config::Thresholds;
use crate::types::HealthSnapshot;

/// Bounded per-agent snapshot history plus the rolling figures derived from it.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    history: VecDeque<HealthSnapshot>,
    capacity: usize,
    recovery_streak: u32,
    baseline_reset_at: Option<DateTime<Utc>>,
}

impl HealthTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            recovery_streak: 0,
            baseline_reset_at: None,
        }
    }

    pub fn record(&mut self, snapshot: HealthSnapshot, thresholds: &Thresholds) {
        self.history.push_back(snapshot);
        if self.history.len() > self.capacity {
            self.history.pop_front();
        }

        if self.meets_recovery(thresholds) {
            self.recovery_streak += 1;
        } else {
            self.recovery_streak = 0;
        }
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.history.back()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|s| s.timestamp)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn snapshots(
        &self,
    ) -> impl DoubleEndedIterator<Item = &HealthSnapshot> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn to_vec(&self) -> Vec<HealthSnapshot> {
        self.history.iter().cloned().collect()
    }

    /// Time since the last report, or `None` if the agent never reported.
    pub fn silence(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_seen().map(|seen| now.signed_duration_since(seen))
    }

    pub fn recovery_streak(&self) -> u32 {
        self.recovery_streak
    }

    /// Forget error history before `at`. Called when a restart is issued so
    /// the restarted process is judged on its own reports.
    pub fn reset_baseline(&mut self, at: DateTime<Utc>) {
        self.baseline_reset_at = Some(at);
        self.recovery_streak = 0;
    }

    fn since_baseline(&self) -> impl DoubleEndedIterator<Item = &HealthSnapshot> {
        let reset = self.baseline_reset_at;
        self.history
            .iter()
            .filter(move |s| reset.map(|r| s.timestamp >= r).unwrap_or(true))
    }

    pub fn rolling_error_rate(&self, window: usize) -> f64 {
        let recent: Vec<&HealthSnapshot> =
            self.since_baseline().rev().take(window.max(1)).collect();
        if recent.is_empty() {
            return 0.0;
        }

        let errors: u64 = recent.iter().map(|s| s.error_count).sum();
        let requests: u64 = recent.iter().map(|s| s.request_count).sum();

        if requests > 0 {
            (errors as f64 / requests as f64).min(1.0)
        } else {
            let erroring = recent.iter().filter(|s| s.reported_error()).count();
            erroring as f64 / recent.len() as f64
        }
    }

    /// How long `predicate` has held continuously, measured from the first
    /// snapshot of the current run to the latest one.
    pub fn sustained<F>(&self, predicate: F) -> Duration
    where
        F: Fn(&HealthSnapshot) -> bool,
    {
        let latest = match self.latest() {
            Some(s) if predicate(s) => s.timestamp,
            _ => return Duration::zero(),
        };

        let start = self
            .history
            .iter()
            .rev()
            .take_while(|s| predicate(*s))
            .last()
            .map(|s| s.timestamp)
            .unwrap_or(latest);

        latest.signed_duration_since(start)
    }

    /// Snapshots since the last restart with `timestamp >= since`, oldest first.
    pub fn window(&self, since: DateTime<Utc>) -> Vec<&HealthSnapshot> {
        self.since_baseline().filter(|s| s.timestamp >= since).collect()
    }

    pub fn meets_recovery(&self, thresholds: &Thresholds) -> bool {
        let Some(latest) = self.latest() else {
            return false;
        };

        latest.response_time_ms < thresholds.recovery_response_ms
            && self.rolling_error_rate(thresholds.error_rate_window)
                < thresholds.recovery_error_rate
            && latest.resource_usage.peak() < thresholds.recovery_resource_pct
    }

    pub fn memory_critical_for(&self, thresholds: &Thresholds) -> Duration {
        self.sustained(|s| s.resource_usage.memory_pct >= thresholds.memory_critical_pct)
    }

    pub fn cpu_critical_for(&self, thresholds: &Thresholds) -> Duration {
        self.sustained(|s| s.resource_usage.cpu_pct >= thresholds.cpu_critical_pct)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn snap(offset_secs: i64) -> HealthSnapshot {
        HealthSnapshot::new("a1", t0() + Duration::seconds(offset_secs)).with_response_time(200)
    }

    #[test]
    fn test_tracker_initialization() {
        let tracker = HealthTracker::new(10);
        assert!(tracker.is_empty());
        assert_eq!(tracker.recovery_streak(), 0);
        assert!(tracker.silence(t0()).is_none());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(3);
        for i in 0..5 {
            tracker.record(snap(i * 10), &thresholds);
        }

        assert_eq!(tracker.len(), 3);
        assert_eq!(
            tracker.snapshots().next().unwrap().timestamp,
            t0() + Duration::seconds(20)
        );
    }

    #[test]
    fn test_rolling_error_rate_with_requests() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_errors(1, 10), &thresholds);
        tracker.record(snap(10).with_errors(0, 10), &thresholds);

        assert!((tracker.rolling_error_rate(20) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_error_rate_without_requests() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_errors(2, 0), &thresholds);
        tracker.record(snap(10), &thresholds);
        tracker.record(snap(20), &thresholds);
        tracker.record(snap(30), &thresholds);

        assert!((tracker.rolling_error_rate(20) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_reset_baseline_drops_old_errors() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_errors(5, 5), &thresholds);
        tracker.reset_baseline(t0() + Duration::seconds(5));
        tracker.record(snap(10).with_errors(0, 10), &thresholds);

        assert_eq!(tracker.rolling_error_rate(20), 0.0);
    }

    #[test]
    fn test_sustained_breach() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_usage(50.0, 10.0), &thresholds);
        for i in 1..=21 {
            tracker.record(snap(i * 10).with_usage(95.0, 10.0), &thresholds);
        }

        assert_eq!(tracker.memory_critical_for(&thresholds).num_seconds(), 200);
        assert_eq!(tracker.cpu_critical_for(&thresholds), Duration::zero());
    }

    #[test]
    fn test_sustained_resets_on_break() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_usage(95.0, 0.0), &thresholds);
        tracker.record(snap(100).with_usage(95.0, 0.0), &thresholds);
        tracker.record(snap(110).with_usage(40.0, 0.0), &thresholds);
        tracker.record(snap(120).with_usage(95.0, 0.0), &thresholds);

        assert_eq!(tracker.memory_critical_for(&thresholds), Duration::zero());
    }

    #[test]
    fn test_recovery_streak_counts_consecutive() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(50);
        tracker.record(snap(0).with_response_time(6000), &thresholds);
        assert_eq!(tracker.recovery_streak(), 0);

        tracker.record(snap(10), &thresholds);
        tracker.record(snap(20), &thresholds);
        assert_eq!(tracker.recovery_streak(), 2);

        tracker.record(snap(30).with_usage(80.0, 0.0), &thresholds);
        assert_eq!(tracker.recovery_streak(), 0);
    }

    #[test]
    fn test_silence() {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(10);
        tracker.record(snap(0), &thresholds);

        let silence = tracker.silence(t0() + Duration::seconds(65)).unwrap();
        assert_eq!(silence.num_seconds(), 65);
    }
}
