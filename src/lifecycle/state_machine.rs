use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::error::{Result, SupervisorError};
use crate::lifecycle::HealthTracker;
use crate::types::AgentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Degradation,
    Stalled,
    ResourceCritical,
    InterventionFailed,
    RestartIssued,
    Recovered,
    Isolate,
    EmergencyStop,
    ClearIsolation,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &str {
        match self {
            LifecycleEvent::Degradation => "degradation",
            LifecycleEvent::Stalled => "stalled",
            LifecycleEvent::ResourceCritical => "resource_critical",
            LifecycleEvent::InterventionFailed => "intervention_failed",
            LifecycleEvent::RestartIssued => "restart_issued",
            LifecycleEvent::Recovered => "recovered",
            LifecycleEvent::Isolate => "isolate",
            LifecycleEvent::EmergencyStop => "emergency_stop",
            LifecycleEvent::ClearIsolation => "clear_isolation",
        }
    }
}

pub struct HealthStateMachine;

impl HealthStateMachine {
    pub fn transition(status: AgentStatus, event: LifecycleEvent) -> Result<AgentStatus> {
        use AgentStatus::*;

        let next = match (status, event) {
            (Isolated, LifecycleEvent::ClearIsolation) => Healthy,
            (_, LifecycleEvent::Isolate | LifecycleEvent::EmergencyStop) => Isolated,

            (Healthy, LifecycleEvent::Degradation) => Degraded,
            (Healthy | Degraded, LifecycleEvent::Stalled) => Stuck,
            (Healthy | Degraded | Stuck, LifecycleEvent::ResourceCritical) => Failed,
            (Degraded | Stuck | Restarting, LifecycleEvent::InterventionFailed) => Failed,
            (Healthy | Degraded | Stuck | Failed | Restarting, LifecycleEvent::RestartIssued) => {
                Restarting
            }
            (Degraded | Stuck | Failed | Restarting, LifecycleEvent::Recovered) => Healthy,

            _ => {
                return Err(SupervisorError::InvalidTransition {
                    from: status.to_string(),
                    event: event.as_str().to_string(),
                });
            }
        };

        Ok(next)
    }

    /// Pick the threshold event implied by the latest snapshot, if any.
    ///
    /// Recovery wins over everything else; after that the most severe
    /// applicable event is returned.
    pub fn evaluate_snapshot(
        status: AgentStatus,
        tracker: &HealthTracker,
        thresholds: &Thresholds,
    ) -> Option<LifecycleEvent> {
        use AgentStatus::*;

        if status == Isolated {
            return None;
        }
        let latest = tracker.latest()?;

        if status != Healthy && tracker.recovery_streak() >= thresholds.recovery_snapshots {
            return Some(LifecycleEvent::Recovered);
        }

        let sustain = thresholds.critical_sustain();
        let resource_critical = tracker.memory_critical_for(thresholds) >= sustain
            || tracker.cpu_critical_for(thresholds) >= sustain;
        if resource_critical && matches!(status, Healthy | Degraded | Stuck) {
            return Some(LifecycleEvent::ResourceCritical);
        }

        if latest.consecutive_errors >= thresholds.stuck_consecutive_errors
            && matches!(status, Healthy | Degraded)
        {
            return Some(LifecycleEvent::Stalled);
        }

        let slow = latest.response_time_ms > thresholds.degraded_response_ms;
        let error_rate = tracker.rolling_error_rate(thresholds.error_rate_window);
        let erroring = error_rate > thresholds.degraded_error_rate;
        if (slow || erroring) && status == Healthy {
            return Some(LifecycleEvent::Degradation);
        }

        None
    }

    /// Heartbeat silence check, run on the evaluation tick.
    pub fn evaluate_silence(
        status: AgentStatus,
        tracker: &HealthTracker,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Option<LifecycleEvent> {
        if !matches!(status, AgentStatus::Healthy | AgentStatus::Degraded) {
            return None;
        }

        match tracker.silence(now) {
            Some(silence) if silence >= thresholds.silence_limit() => Some(LifecycleEvent::Stalled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthSnapshot;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn tracker_with(snapshots: Vec<HealthSnapshot>) -> HealthTracker {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(100);
        for s in snapshots {
            tracker.record(s, &thresholds);
        }
        tracker
    }

    fn ok(offset: i64) -> HealthSnapshot {
        HealthSnapshot::new("a", t0() + Duration::seconds(offset)).with_response_time(100)
    }

    #[test]
    fn test_healthy_to_degraded() {
        let next = HealthStateMachine::transition(AgentStatus::Healthy, LifecycleEvent::Degradation)
            .unwrap();
        assert_eq!(next, AgentStatus::Degraded);
    }

    #[test]
    fn test_isolated_only_leaves_on_clear() {
        let result =
            HealthStateMachine::transition(AgentStatus::Isolated, LifecycleEvent::Recovered);
        assert!(result.is_err());

        let next =
            HealthStateMachine::transition(AgentStatus::Isolated, LifecycleEvent::ClearIsolation)
                .unwrap();
        assert_eq!(next, AgentStatus::Healthy);
    }

    #[test]
    fn test_any_state_can_be_isolated() {
        for status in [
            AgentStatus::Healthy,
            AgentStatus::Degraded,
            AgentStatus::Stuck,
            AgentStatus::Failed,
            AgentStatus::Restarting,
        ] {
            let next =
                HealthStateMachine::transition(status, LifecycleEvent::EmergencyStop).unwrap();
            assert_eq!(next, AgentStatus::Isolated);
        }
    }

    #[test]
    fn test_invalid_transition() {
        let result =
            HealthStateMachine::transition(AgentStatus::Healthy, LifecycleEvent::Recovered);
        assert!(result.is_err());
    }

    #[test]
    fn test_slow_response_degrades() {
        let tracker = tracker_with(vec![ok(0).with_response_time(5001)]);
        let thresholds = Thresholds::default();
        let event = HealthStateMachine::evaluate_snapshot(AgentStatus::Healthy, &tracker, &thresholds);
        assert_eq!(event, Some(LifecycleEvent::Degradation));
    }

    #[test]
    fn test_error_rate_degrades() {
        let tracker = tracker_with(vec![ok(0).with_errors(1, 10)]);
        let thresholds = Thresholds::default();
        let event = HealthStateMachine::evaluate_snapshot(AgentStatus::Healthy, &tracker, &thresholds);
        assert_eq!(event, Some(LifecycleEvent::Degradation));
    }

    #[test]
    fn test_consecutive_errors_stall() {
        let tracker = tracker_with(vec![ok(0).with_consecutive_errors(3)]);
        let event = HealthStateMachine::evaluate_snapshot(
            AgentStatus::Degraded,
            &tracker,
            &Thresholds::default(),
        );
        assert_eq!(event, Some(LifecycleEvent::Stalled));
    }

    #[test]
    fn test_sustained_cpu_fails() {
        let snapshots = (0..=19).map(|i| ok(i * 10).with_usage(10.0, 90.0)).collect();
        let tracker = tracker_with(snapshots);
        let event = HealthStateMachine::evaluate_snapshot(
            AgentStatus::Degraded,
            &tracker,
            &Thresholds::default(),
        );
        assert_eq!(event, Some(LifecycleEvent::ResourceCritical));
    }

    #[test]
    fn test_recovery_after_three_good_snapshots() {
        let tracker = tracker_with(vec![ok(0), ok(10)]);
        let thresholds = Thresholds::default();
        assert_eq!(
            HealthStateMachine::evaluate_snapshot(AgentStatus::Restarting, &tracker, &thresholds),
            None
        );

        let tracker = tracker_with(vec![ok(0), ok(10), ok(20)]);
        assert_eq!(
            HealthStateMachine::evaluate_snapshot(AgentStatus::Restarting, &tracker, &thresholds),
            Some(LifecycleEvent::Recovered)
        );
    }

    #[test]
    fn test_silence_stalls_within_one_tick() {
        let tracker = tracker_with(vec![ok(0)]);
        let thresholds = Thresholds::default();

        let before = HealthStateMachine::evaluate_silence(
            AgentStatus::Healthy,
            &tracker,
            &thresholds,
            t0() + Duration::seconds(59),
        );
        assert_eq!(before, None);

        let after = HealthStateMachine::evaluate_silence(
            AgentStatus::Healthy,
            &tracker,
            &thresholds,
            t0() + Duration::seconds(65),
        );
        assert_eq!(after, Some(LifecycleEvent::Stalled));
    }

    #[test]
    fn test_isolated_is_not_evaluated() {
        let tracker = tracker_with(vec![ok(0).with_response_time(9000)]);
        assert_eq!(
            HealthStateMachine::evaluate_snapshot(
                AgentStatus::Isolated,
                &tracker,
                &Thresholds::default()
            ),
            None
        );
    }
}
