use serde::{Deserialize, Serialize};

use crate::config::{PredictiveConfig, Thresholds};
use crate::detection::{stats, DetectionContext};
use crate::lifecycle::HealthTracker;
use crate::types::{AgentStatus, Evidence, HealthSnapshot, Issue, IssueType, Severity};

/// Trailing window used for every component.
const TRAILING_WINDOW: usize = 50;

/// Response-time deviation floor in milliseconds.
const MIN_RESPONSE_STDDEV_MS: f64 = 50.0;

const MIN_ERROR_STDDEV: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: f64,
    pub response_time: f64,
    pub error_rate: f64,
    pub resource_trend: f64,
}

pub struct PredictiveScorer {
    config: PredictiveConfig,
}

impl PredictiveScorer {
    pub fn new(config: PredictiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    /// Combined risk in `[0, 1]`, or `None` until enough history exists.
    pub fn score(&self, tracker: &HealthTracker, thresholds: &Thresholds) -> Option<RiskScore> {
        if tracker.len() < self.config.min_samples {
            return None;
        }
        let latest = tracker.latest()?;
        let trailing: Vec<&HealthSnapshot> = tracker
            .snapshots()
            .rev()
            .skip(1)
            .take(TRAILING_WINDOW)
            .collect();

        let response_baseline: Vec<f64> =
            trailing.iter().map(|s| s.response_time_ms as f64).collect();
        let response_time = deviation_risk(stats::z_score(
            latest.response_time_ms as f64,
            &response_baseline,
            MIN_RESPONSE_STDDEV_MS,
        ));

        let error_baseline: Vec<f64> = trailing.iter().map(|s| s.error_count as f64).collect();
        let error_rate = deviation_risk(stats::z_score(
            latest.error_count as f64,
            &error_baseline,
            MIN_ERROR_STDDEV,
        ));

        let resource_trend = self.trend_risk(tracker, thresholds);

        let score = 1.0 - (1.0 - response_time) * (1.0 - error_rate) * (1.0 - resource_trend);

        Some(RiskScore {
            score,
            response_time,
            error_rate,
            resource_trend,
        })
    }

    fn trend_risk(&self, tracker: &HealthTracker, thresholds: &Thresholds) -> f64 {
        let recent: Vec<&HealthSnapshot> = tracker
            .snapshots()
            .rev()
            .take(self.config.min_samples.max(2))
            .collect();
        let horizon = self.config.horizon_secs as f64;
        let floor = thresholds.recovery_resource_pct;

        let memory = projected_risk(
            &recent,
            |s| s.resource_usage.memory_pct,
            floor,
            thresholds.memory_critical_pct,
            horizon,
        );
        let cpu = projected_risk(
            &recent,
            |s| s.resource_usage.cpu_pct,
            floor,
            thresholds.cpu_critical_pct,
            horizon,
        );
        memory.max(cpu)
    }

    /// Raise an advisory issue for a healthy agent whose risk crossed the
    /// threshold while no hard detector fired.
    pub fn assess(&self, ctx: &DetectionContext<'_>, hard_findings: &[Evidence]) -> Option<Issue> {
        if ctx.status != AgentStatus::Healthy || !hard_findings.is_empty() {
            return None;
        }

        let risk = self.score(ctx.tracker, ctx.thresholds)?;
        if risk.score < self.config.risk_threshold {
            return None;
        }

        log::info!(
            "Predicted degradation for {}: risk {:.2} (response {:.2}, errors {:.2}, resources {:.2})",
            ctx.agent_id,
            risk.score,
            risk.response_time,
            risk.error_rate,
            risk.resource_trend
        );

        Issue::from_evidence(
            ctx.agent_id.to_string(),
            ctx.now,
            vec![Evidence {
                issue_type: IssueType::PredictedDegradation,
                severity: Severity::Low,
                description: format!(
                    "risk score {:.2} (response {:.2}, errors {:.2}, resources {:.2})",
                    risk.score, risk.response_time, risk.error_rate, risk.resource_trend
                ),
                snapshots: ctx.tracker.latest().cloned().into_iter().collect(),
            }],
        )
    }
}

/// Project a resource series `horizon` seconds ahead along its least-squares
/// slope and place the result between the recovery floor and the critical line.
/// `recent` is newest first.
fn projected_risk<F>(
    recent: &[&HealthSnapshot],
    value: F,
    floor: f64,
    critical: f64,
    horizon: f64,
) -> f64
where
    F: Fn(&HealthSnapshot) -> f64,
{
    let (Some(latest), Some(oldest)) = (recent.first(), recent.last()) else {
        return 0.0;
    };
    if critical <= floor {
        return 0.0;
    }

    let points: Vec<(f64, f64)> = recent
        .iter()
        .map(|s| {
            let secs = s
                .timestamp
                .signed_duration_since(oldest.timestamp)
                .num_milliseconds() as f64
                / 1000.0;
            (secs, value(*s))
        })
        .collect();

    match stats::slope(&points) {
        Some(slope) if slope > 0.0 => {
            let projected = value(*latest) + slope * horizon;
            ((projected - floor) / (critical - floor)).clamp(0.0, 1.0)
        }
        _ => 0.0,
    }
}

/// Map a z-score to `[0, 1]`: nothing below 1 sigma, saturating at 4.
fn deviation_risk(z: Option<f64>) -> f64 {
    match z {
        Some(z) => ((z - 1.0) / 3.0).clamp(0.0, 1.0),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ok(offset: i64) -> HealthSnapshot {
        HealthSnapshot::new("a", t0() + Duration::seconds(offset))
            .with_response_time(200)
            .with_usage(40.0, 20.0)
    }

    fn tracker_with(snapshots: Vec<HealthSnapshot>) -> HealthTracker {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(500);
        for s in snapshots {
            tracker.record(s, &thresholds);
        }
        tracker
    }

    #[test]
    fn test_needs_min_samples() {
        let scorer = PredictiveScorer::new(PredictiveConfig::default());
        let tracker = tracker_with((0..5).map(|i| ok(i * 10)).collect());
        assert!(scorer.score(&tracker, &Thresholds::default()).is_none());
    }

    #[test]
    fn test_stable_history_scores_low() {
        let scorer = PredictiveScorer::new(PredictiveConfig::default());
        let tracker = tracker_with((0..20).map(|i| ok(i * 10)).collect());
        let risk = scorer.score(&tracker, &Thresholds::default()).unwrap();
        assert!(risk.score < 0.1, "score was {}", risk.score);
    }

    #[test]
    fn test_rising_memory_scores_high() {
        let scorer = PredictiveScorer::new(PredictiveConfig::default());
        let snapshots = (0..10)
            .map(|i| ok(i * 10).with_usage(40.0 + i as f64 * 3.0, 20.0))
            .collect();
        let tracker = tracker_with(snapshots);

        let risk = scorer.score(&tracker, &Thresholds::default()).unwrap();
        assert_eq!(risk.resource_trend, 1.0);
        assert!(risk.score >= 0.8);
    }

    #[test]
    fn test_response_time_jump() {
        let scorer = PredictiveScorer::new(PredictiveConfig::default());
        let mut snapshots: Vec<HealthSnapshot> = (0..15).map(|i| ok(i * 10)).collect();
        snapshots.push(ok(150).with_response_time(1500));
        let tracker = tracker_with(snapshots);

        let risk = scorer.score(&tracker, &Thresholds::default()).unwrap();
        assert_eq!(risk.response_time, 1.0);
    }

    #[test]
    fn test_assess_only_for_healthy_without_hard_findings() {
        let scorer = PredictiveScorer::new(PredictiveConfig::default());
        let thresholds = Thresholds::default();
        let snapshots = (0..10)
            .map(|i| ok(i * 10).with_usage(40.0 + i as f64 * 3.0, 20.0))
            .collect();
        let tracker = tracker_with(snapshots);

        let mut ctx = DetectionContext {
            agent_id: "a",
            status: AgentStatus::Healthy,
            tracker: &tracker,
            thresholds: &thresholds,
            now: t0() + Duration::seconds(90),
        };
        let issue = scorer.assess(&ctx, &[]).unwrap();
        assert_eq!(issue.issue_type, IssueType::PredictedDegradation);
        assert_eq!(issue.severity, Severity::Low);

        ctx.status = AgentStatus::Degraded;
        assert!(scorer.assess(&ctx, &[]).is_none());
    }
}
