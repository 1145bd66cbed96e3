pub mod dependency;
pub mod signature;
pub mod stats;

pub use dependency::{find_cycle, DependencyCycle};
pub use signature::action_signature;

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::config::{DetectionConfig, Thresholds};
use crate::lifecycle::HealthTracker;
use crate::types::{AgentId, AgentStatus, Evidence, HealthSnapshot, Issue, IssueType, Severity};

/// Snapshots attached to a single finding.
const MAX_EVIDENCE_SNAPSHOTS: usize = 10;

/// Spike baseline deviation floor, in errors per report.
const MIN_ERROR_STDDEV: f64 = 1.0;

/// Baseline length for the error-spike z-score.
const SPIKE_BASELINE_LEN: usize = 50;

pub struct DetectionContext<'a> {
    pub agent_id: &'a str,
    pub status: AgentStatus,
    pub tracker: &'a HealthTracker,
    pub thresholds: &'a Thresholds,
    pub now: DateTime<Utc>,
}

pub struct AnomalyDetector {
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run every snapshot-driven check and fold the matches into at most one
    /// issue at the highest detected severity.
    pub fn evaluate(&self, ctx: &DetectionContext<'_>) -> Option<Issue> {
        Issue::from_evidence(ctx.agent_id.to_string(), ctx.now, self.findings(ctx))
    }

    pub fn findings(&self, ctx: &DetectionContext<'_>) -> Vec<Evidence> {
        if ctx.status == AgentStatus::Isolated {
            return Vec::new();
        }

        let findings = [
            self.check_resources(ctx),
            self.check_stuck(ctx),
            self.check_timeout(ctx),
            self.check_error_spike(ctx),
            self.check_repetition(ctx),
        ];

        rank(findings.into_iter().flatten().collect())
    }

    /// Dependency cycles run on their own slower cadence.
    pub fn check_dependencies(
        &self,
        agent_id: &str,
        graph: &HashMap<AgentId, BTreeSet<AgentId>>,
        now: DateTime<Utc>,
    ) -> Option<Issue> {
        let cycle = find_cycle(agent_id, graph, self.config.max_dependency_depth)?;
        let description = if cycle.depth_limited {
            format!(
                "dependency walk exceeded depth {} without terminating: {}",
                self.config.max_dependency_depth,
                cycle.path.join(" -> ")
            )
        } else {
            format!("circular dependency: {}", cycle.path.join(" -> "))
        };

        Issue::from_evidence(
            agent_id.to_string(),
            now,
            vec![Evidence {
                issue_type: IssueType::CircularDependency,
                severity: Severity::High,
                description,
                snapshots: Vec::new(),
            }],
        )
    }

    fn check_repetition(&self, ctx: &DetectionContext<'_>) -> Option<Evidence> {
        let since = ctx.now - Duration::seconds(self.config.repetition_window_secs as i64);
        let mut by_signature: HashMap<String, Vec<&HealthSnapshot>> = HashMap::new();

        for snapshot in ctx.tracker.window(since) {
            if let Some(task) = snapshot.current_task.as_deref() {
                let signature = action_signature(task);
                if !signature.is_empty() {
                    by_signature.entry(signature).or_default().push(snapshot);
                }
            }
        }

        let (signature, hits) = by_signature
            .into_iter()
            .max_by_key(|(_, hits)| hits.len())?;
        if hits.len() < self.config.repetition_count {
            return None;
        }

        Some(Evidence {
            issue_type: IssueType::RepetitiveAction,
            severity: Severity::Medium,
            description: format!(
                "action '{}' repeated {} times within {}s",
                signature,
                hits.len(),
                self.config.repetition_window_secs
            ),
            snapshots: tail(hits.into_iter().cloned().collect()),
        })
    }

    fn check_resources(&self, ctx: &DetectionContext<'_>) -> Option<Evidence> {
        let sustain = ctx.thresholds.critical_sustain();
        let memory = ctx.tracker.memory_critical_for(ctx.thresholds);
        let cpu = ctx.tracker.cpu_critical_for(ctx.thresholds);

        let mut breaches = Vec::new();
        if memory >= sustain {
            breaches.push(format!(
                "memory >= {}% for {}s",
                ctx.thresholds.memory_critical_pct,
                memory.num_seconds()
            ));
        }
        if cpu >= sustain {
            breaches.push(format!(
                "cpu >= {}% for {}s",
                ctx.thresholds.cpu_critical_pct,
                cpu.num_seconds()
            ));
        }
        if breaches.is_empty() {
            return None;
        }

        let span = memory.max(cpu);
        let latest = ctx.tracker.last_seen()?;
        let evidence = ctx
            .tracker
            .window(latest - span)
            .into_iter()
            .cloned()
            .collect();

        Some(Evidence {
            issue_type: IssueType::ResourceExhaustion,
            severity: Severity::Critical,
            description: breaches.join(", "),
            snapshots: tail(evidence),
        })
    }

    fn check_timeout(&self, ctx: &DetectionContext<'_>) -> Option<Evidence> {
        let latest = ctx.tracker.latest()?;
        let operation = latest.operation?;
        let limit = self.config.operation_timeout(operation);

        if latest.response_time_ms <= limit.as_millis() as u64 {
            return None;
        }

        Some(Evidence {
            issue_type: IssueType::ResponseTimeout,
            severity: Severity::High,
            description: format!(
                "{} took {}ms (limit {}ms)",
                operation.as_str(),
                latest.response_time_ms,
                limit.as_millis()
            ),
            snapshots: vec![latest.clone()],
        })
    }

    fn check_error_spike(&self, ctx: &DetectionContext<'_>) -> Option<Evidence> {
        let latest = ctx.tracker.latest()?;
        let baseline: Vec<f64> = ctx
            .tracker
            .snapshots()
            .rev()
            .skip(1)
            .take(SPIKE_BASELINE_LEN)
            .map(|s| s.error_count as f64)
            .collect();
        if baseline.len() < self.config.spike_min_samples {
            return None;
        }

        let z = stats::z_score(latest.error_count as f64, &baseline, MIN_ERROR_STDDEV)?;
        if z < self.config.spike_sigma {
            return None;
        }

        Some(Evidence {
            issue_type: IssueType::ErrorSpike,
            severity: spike_severity(z),
            description: format!(
                "{} errors is {:.1} standard deviations above baseline",
                latest.error_count, z
            ),
            snapshots: vec![latest.clone()],
        })
    }

    fn check_stuck(&self, ctx: &DetectionContext<'_>) -> Option<Evidence> {
        if ctx.status != AgentStatus::Stuck {
            return None;
        }

        let description = match ctx.tracker.silence(ctx.now) {
            Some(silence) if silence >= ctx.thresholds.silence_limit() => {
                format!("no heartbeat for {}s", silence.num_seconds())
            }
            _ => match ctx.tracker.latest() {
                Some(latest) => format!("{} consecutive errors", latest.consecutive_errors),
                None => "agent stuck".to_string(),
            },
        };

        Some(Evidence {
            issue_type: IssueType::AgentStuck,
            severity: Severity::High,
            description,
            snapshots: ctx.tracker.latest().cloned().into_iter().collect(),
        })
    }
}

fn spike_severity(z: f64) -> Severity {
    if z >= 8.0 {
        Severity::Critical
    } else if z >= 5.0 {
        Severity::High
    } else {
        Severity::Medium
    }
}

fn tail(mut snapshots: Vec<HealthSnapshot>) -> Vec<HealthSnapshot> {
    if snapshots.len() > MAX_EVIDENCE_SNAPSHOTS {
        snapshots.drain(..snapshots.len() - MAX_EVIDENCE_SNAPSHOTS);
    }
    snapshots
}

/// Tie-break order for findings of equal severity.
fn priority(issue_type: IssueType) -> u8 {
    match issue_type {
        IssueType::ResourceExhaustion => 0,
        IssueType::CircularDependency => 1,
        IssueType::AgentStuck => 2,
        IssueType::ResponseTimeout => 3,
        IssueType::ErrorSpike => 4,
        IssueType::RepetitiveAction => 5,
        IssueType::PredictedDegradation => 6,
        IssueType::ManualOverride => 7,
    }
}

/// Highest severity first; the head becomes the issue, the rest evidence.
pub fn rank(mut findings: Vec<Evidence>) -> Vec<Evidence> {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| priority(a.issue_type).cmp(&priority(b.issue_type)))
    });
    findings
}

/// Suppresses re-raising an issue type for one agent inside the cooldown,
/// unless the new occurrence is strictly more severe.
#[derive(Debug, Clone, Default)]
pub struct IssueCooldown {
    raised: HashMap<IssueType, (DateTime<Utc>, Severity)>,
}

impl IssueCooldown {
    pub fn admit(&mut self, issue: &Issue, cooldown: Duration) -> bool {
        if let Some((at, severity)) = self.raised.get(&issue.issue_type) {
            let within = issue.detected_at.signed_duration_since(*at) < cooldown;
            if within && issue.severity <= *severity {
                return false;
            }
        }
        self.raised
            .insert(issue.issue_type, (issue.detected_at, issue.severity));
        true
    }

    pub fn clear(&mut self) {
        self.raised.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationClass;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ok(offset: i64) -> HealthSnapshot {
        HealthSnapshot::new("a", t0() + Duration::seconds(offset)).with_response_time(100)
    }

    fn tracker_with(snapshots: Vec<HealthSnapshot>) -> HealthTracker {
        let thresholds = Thresholds::default();
        let mut tracker = HealthTracker::new(500);
        for s in snapshots {
            tracker.record(s, &thresholds);
        }
        tracker
    }

    fn evaluate(
        tracker: &HealthTracker,
        status: AgentStatus,
        now_offset: i64,
    ) -> Option<Issue> {
        let thresholds = Thresholds::default();
        let detector = AnomalyDetector::new(DetectionConfig::default());
        let ctx = DetectionContext {
            agent_id: "a",
            status,
            tracker,
            thresholds: &thresholds,
            now: t0() + Duration::seconds(now_offset),
        };
        detector.evaluate(&ctx)
    }

    #[test]
    fn test_healthy_history_has_no_findings() {
        let tracker = tracker_with((0..20).map(|i| ok(i * 10)).collect());
        assert!(evaluate(&tracker, AgentStatus::Healthy, 200).is_none());
    }

    #[test]
    fn test_repetitive_action_five_in_four_minutes() {
        let snapshots = (0..5)
            .map(|i| ok(i * 60).with_task(format!("retry ticket {}", 100 + i)))
            .collect();
        let tracker = tracker_with(snapshots);

        let issue = evaluate(&tracker, AgentStatus::Healthy, 240).unwrap();
        assert_eq!(issue.issue_type, IssueType::RepetitiveAction);
        assert_eq!(issue.severity, Severity::Medium);
        assert_eq!(issue.evidence[0].snapshots.len(), 5);
    }

    #[test]
    fn test_repetition_outside_window_ignored() {
        let snapshots = (0..5)
            .map(|i| ok(i * 90).with_task("sync repo"))
            .collect();
        let tracker = tracker_with(snapshots);

        assert!(evaluate(&tracker, AgentStatus::Healthy, 400).is_none());
    }

    #[test]
    fn test_memory_exhaustion_is_critical() {
        let snapshots = (0..=20).map(|i| ok(i * 10).with_usage(95.0, 20.0)).collect();
        let tracker = tracker_with(snapshots);

        let issue = evaluate(&tracker, AgentStatus::Healthy, 200).unwrap();
        assert_eq!(issue.issue_type, IssueType::ResourceExhaustion);
        assert_eq!(issue.severity, Severity::Critical);
        assert!(issue.evidence[0].description.contains("memory"));
    }

    #[test]
    fn test_short_memory_burst_ignored() {
        let snapshots = (0..=10).map(|i| ok(i * 10).with_usage(95.0, 20.0)).collect();
        let tracker = tracker_with(snapshots);
        assert!(evaluate(&tracker, AgentStatus::Healthy, 100).is_none());
    }

    #[test]
    fn test_response_timeout_per_operation() {
        let tracker = tracker_with(vec![ok(0)
            .with_operation(OperationClass::StorageOp)
            .with_response_time(12_000)]);
        let issue = evaluate(&tracker, AgentStatus::Healthy, 0).unwrap();
        assert_eq!(issue.issue_type, IssueType::ResponseTimeout);
        assert_eq!(issue.severity, Severity::High);

        let tracker = tracker_with(vec![ok(0)
            .with_operation(OperationClass::Computation)
            .with_response_time(12_000)]);
        assert!(evaluate(&tracker, AgentStatus::Healthy, 0).is_none());
    }

    #[test]
    fn test_error_spike_scaled_severity() {
        let mut snapshots: Vec<HealthSnapshot> = (0..12).map(|i| ok(i * 10)).collect();
        snapshots.push(ok(130).with_errors(6, 0));
        let tracker = tracker_with(snapshots);

        let issue = evaluate(&tracker, AgentStatus::Degraded, 130).unwrap();
        assert_eq!(issue.issue_type, IssueType::ErrorSpike);
        assert_eq!(issue.severity, Severity::High);
    }

    #[test]
    fn test_error_spike_needs_baseline() {
        let tracker = tracker_with(vec![ok(0), ok(10).with_errors(50, 0)]);
        assert!(evaluate(&tracker, AgentStatus::Healthy, 10).is_none());
    }

    #[test]
    fn test_stuck_status_raises_issue() {
        let tracker = tracker_with(vec![ok(0)]);
        let issue = evaluate(&tracker, AgentStatus::Stuck, 65).unwrap();
        assert_eq!(issue.issue_type, IssueType::AgentStuck);
        assert!(issue.summary().contains("65s"));
    }

    #[test]
    fn test_highest_severity_wins_rest_become_evidence() {
        let snapshots = (0..=20)
            .map(|i| ok(i * 10).with_usage(96.0, 10.0).with_task("compact index"))
            .collect();
        let tracker = tracker_with(snapshots);

        let issue = evaluate(&tracker, AgentStatus::Healthy, 200).unwrap();
        assert_eq!(issue.issue_type, IssueType::ResourceExhaustion);
        assert_eq!(issue.evidence.len(), 2);
        assert_eq!(issue.evidence[1].issue_type, IssueType::RepetitiveAction);
    }

    #[test]
    fn test_isolated_agent_not_evaluated() {
        let snapshots = (0..=20).map(|i| ok(i * 10).with_usage(95.0, 20.0)).collect();
        let tracker = tracker_with(snapshots);
        assert!(evaluate(&tracker, AgentStatus::Isolated, 200).is_none());
    }

    #[test]
    fn test_rank_equal_severity_by_priority() {
        let finding = |issue_type| Evidence {
            issue_type,
            severity: Severity::High,
            description: String::new(),
            snapshots: vec![],
        };
        let ranked = rank(vec![
            finding(IssueType::ResponseTimeout),
            finding(IssueType::AgentStuck),
        ]);
        assert_eq!(ranked[0].issue_type, IssueType::AgentStuck);
    }

    #[test]
    fn test_dependency_cycle_issue() {
        let detector = AnomalyDetector::new(DetectionConfig::default());
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), BTreeSet::from(["b".to_string()]));
        graph.insert("b".to_string(), BTreeSet::from(["a".to_string()]));

        let issue = detector.check_dependencies("a", &graph, t0()).unwrap();
        assert_eq!(issue.issue_type, IssueType::CircularDependency);
        assert_eq!(issue.severity, Severity::High);
        assert!(issue.summary().contains("a -> b -> a"));
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let mut cooldown = IssueCooldown::default();
        let window = Duration::seconds(300);
        let mut issue = Issue::manual("a".to_string(), t0(), Severity::Medium, "x");

        assert!(cooldown.admit(&issue, window));
        issue.detected_at = t0() + Duration::seconds(10);
        assert!(!cooldown.admit(&issue, window));

        issue.severity = Severity::High;
        assert!(cooldown.admit(&issue, window));

        issue.detected_at = t0() + Duration::seconds(400);
        assert!(cooldown.admit(&issue, window));
    }
}
