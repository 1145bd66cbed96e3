use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::policy::{policy, starting_level, EMERGENCY_DELIVERY_TIMEOUT};
use crate::circuit::{BreakerKey, CircuitBreakerBank};
use crate::config::Thresholds;
use crate::dispatch::{AgentCommand, AgentCommandSink, OperatorNotifier};
use crate::error::{Result, SupervisorError};
use crate::lifecycle::LifecycleEvent;
use crate::registry::AgentMonitor;
use crate::storage::{AuditLog, AuditRecord};
use crate::types::{
    Agent, AgentId, AgentStatus, BreakerStatus, Intervention, InterventionId, InterventionLevel,
    InterventionOutcome, Issue,
};

/// The open level of an escalation chain.
#[derive(Debug, Clone)]
pub struct ActiveRemediation {
    pub issue: Issue,
    pub record: Intervention,
    /// End of the current attempt. `None` until the first dispatch finishes.
    pub deadline: Option<DateTime<Utc>>,
    /// Consecutive recovered snapshots since the current attempt dispatched.
    pub recovered: u32,
}

/// One attempt's commands. Built under the monitor lock and delivered
/// outside it; the result comes back through [`InterventionEngine::complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub agent_id: AgentId,
    pub intervention_id: InterventionId,
    pub level: InterventionLevel,
    pub attempt: u32,
    pub issued_at: DateTime<Utc>,
    pub commands: Vec<AgentCommand>,
}

/// Per-agent remediation state: at most one active chain plus the issues
/// waiting behind it.
#[derive(Debug, Default)]
pub struct RemediationState {
    active: Option<ActiveRemediation>,
    queue: Vec<Issue>,
    outbox: Vec<Delivery>,
}

impl RemediationState {
    pub fn active(&self) -> Option<&ActiveRemediation> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn queued(&self) -> &[Issue] {
        &self.queue
    }

    /// Deliveries issued since the last call, oldest first.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.outbox)
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.queue.clear();
        self.outbox.clear();
    }
}

/// Drives escalation chains through the table in [`super::policy`].
pub struct InterventionEngine {
    sink: Arc<dyn AgentCommandSink>,
    notifier: Arc<dyn OperatorNotifier>,
    breakers: Arc<CircuitBreakerBank>,
    audit: AuditLog,
}

impl InterventionEngine {
    pub fn new(
        sink: Arc<dyn AgentCommandSink>,
        notifier: Arc<dyn OperatorNotifier>,
        breakers: Arc<CircuitBreakerBank>,
        audit: AuditLog,
    ) -> Self {
        Self {
            sink,
            notifier,
            breakers,
            audit,
        }
    }

    pub fn sink(&self) -> &Arc<dyn AgentCommandSink> {
        &self.sink
    }

    /// Route a freshly raised issue.
    ///
    /// With no active chain the issue starts one. Otherwise it escalates the
    /// active chain when it calls for a higher level (or the active attempt
    /// is overdue) and queues behind it when it does not. Hard issues take
    /// over advisory chains.
    ///
    /// Returns `EscalationExhausted` when the chain reached Level 4.
    pub async fn handle_issue(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        issue: Issue,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let start = starting_level(&issue);
        let Some(active) = monitor.remediation.active.as_ref() else {
            return self.start(agent, monitor, issue, start, now).await;
        };

        if issue.issue_type.is_advisory() {
            log::debug!(
                "Dropping advisory issue for {}: remediation already active",
                agent.id
            );
            return Ok(());
        }

        let active_level = active.record.level;
        if active.issue.issue_type.is_advisory() || start > active_level {
            return self.escalate(agent, monitor, start, Some(issue), now).await;
        }

        let overdue = active.deadline.is_some_and(|deadline| now >= deadline);
        let next = policy(active_level).next;
        self.enqueue(monitor, issue, now).await;

        match next {
            Some(next) if overdue => self.escalate(agent, monitor, next, None, now).await,
            _ => Ok(()),
        }
    }

    /// Advance the active chain once its attempt deadline has passed:
    /// retry within the level's budget, then escalate. An attempt whose
    /// delivery is still in flight has no deadline yet.
    pub async fn on_tick(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(active) = monitor.remediation.active.as_ref() else {
            return Ok(());
        };
        match active.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Ok(()),
        }

        let level = active.record.level;
        let attempts = active.record.attempts;
        let advisory = active.issue.issue_type.is_advisory();
        let policy = policy(level);

        log::warn!(
            "Level {} attempt {} for {} ended without recovery",
            level.number(),
            attempts,
            agent.id
        );

        if policy.max_attempts.is_some_and(|max| attempts < max) {
            return self.attempt(agent, monitor, now).await;
        }

        if advisory {
            // Advisory chains never escalate on their own.
            self.finish(monitor, InterventionOutcome::Failed, now).await;
            return self.start_queued(agent, monitor, now).await;
        }

        match policy.next {
            Some(next) => self.escalate(agent, monitor, next, None, now).await,
            None => Ok(()),
        }
    }

    /// Count a processed snapshot towards resolving a Level 1-2 chain on an
    /// agent that never left `healthy`.
    pub async fn observe(
        &self,
        monitor: &mut AgentMonitor,
        thresholds: &Thresholds,
        issue_cleared: bool,
        now: DateTime<Utc>,
    ) {
        let recovered_now = monitor.tracker.meets_recovery(thresholds);
        let healthy = monitor.status == AgentStatus::Healthy;

        let Some(active) = monitor.remediation.active.as_mut() else {
            return;
        };
        if active.record.level > InterventionLevel::Restart || active.deadline.is_none() {
            return;
        }

        active.recovered = if recovered_now { active.recovered + 1 } else { 0 };
        if healthy && issue_cleared && active.recovered >= thresholds.recovery_snapshots {
            self.resolve(monitor, now).await;
        }
    }

    /// Close the active chain as resolved and drop whatever queued behind it.
    pub async fn resolve(&self, monitor: &mut AgentMonitor, now: DateTime<Utc>) {
        if let Some(active) = self.finish(monitor, InterventionOutcome::Resolved, now).await {
            log::info!(
                "Remediation of {} for {} resolved at level {}",
                active.issue.issue_type.as_str(),
                active.record.agent_id,
                active.record.level.number()
            );
        }
        monitor.remediation.queue.clear();
    }

    /// Operator path: abandon whatever is active and run `issue` at `level`.
    pub async fn preempt(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        issue: Issue,
        level: InterventionLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(previous) = self.finish(monitor, InterventionOutcome::Failed, now).await {
            self.audit
                .record(
                    now,
                    AuditRecord::IssueSuperseded {
                        agent_id: agent.id.clone(),
                        issue_id: previous.issue.id,
                        superseded_by: issue.id,
                    },
                )
                .await;
        }
        monitor.remediation.queue.clear();
        self.start(agent, monitor, issue, level, now).await
    }

    async fn start(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        issue: Issue,
        level: InterventionLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = Intervention::open(
            agent.id.clone(),
            issue.id,
            level,
            policy(level).action_names(&issue),
            now,
        );

        log::info!(
            "Starting level {} ({}) for {} on {} [{}]",
            level.number(),
            level.as_str(),
            agent.id,
            issue.issue_type.as_str(),
            issue.severity.as_str()
        );
        self.audit
            .record(
                now,
                AuditRecord::InterventionRecorded {
                    intervention: record.clone(),
                },
            )
            .await;

        match level {
            InterventionLevel::Isolate => {
                monitor
                    .apply(&agent.id, LifecycleEvent::Isolate, now, &self.audit)
                    .await;
                self.open_breaker(agent, now).await;
            }
            InterventionLevel::Emergency => {
                monitor
                    .apply(&agent.id, LifecycleEvent::EmergencyStop, now, &self.audit)
                    .await;
                self.open_breaker(agent, now).await;
            }
            InterventionLevel::Graceful | InterventionLevel::Restart => {}
        }

        monitor.remediation.active = Some(ActiveRemediation {
            issue,
            record,
            deadline: None,
            recovered: 0,
        });
        self.attempt(agent, monitor, now).await
    }

    async fn attempt(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(active) = monitor.remediation.active.as_mut() else {
            return Ok(());
        };
        active.record.attempts += 1;
        active.recovered = 0;
        active.deadline = None;

        let level = active.record.level;
        let delivery = Delivery {
            agent_id: agent.id.clone(),
            intervention_id: active.record.id,
            level,
            attempt: active.record.attempts,
            issued_at: now,
            commands: policy(level).commands(agent, &active.issue),
        };

        if level == InterventionLevel::Restart {
            monitor
                .apply(&agent.id, LifecycleEvent::RestartIssued, now, &self.audit)
                .await;
            monitor.tracker.reset_baseline(now);
        }
        monitor.remediation.outbox.push(delivery);

        if level == InterventionLevel::Emergency {
            return self.exhaust(agent, monitor, now).await;
        }
        Ok(())
    }

    /// Apply a finished delivery to the chain that issued it. A successful
    /// delivery starts the level's timeout; a failed one leaves the attempt
    /// due on the next tick. Results for superseded attempts are dropped.
    pub fn complete(&self, monitor: &mut AgentMonitor, delivery: &Delivery, result: Result<()>) {
        if let Err(e) = &result {
            log::warn!(
                "Level {} attempt {} for {} failed: {}",
                delivery.level.number(),
                delivery.attempt,
                delivery.agent_id,
                e
            );
        }

        let Some(active) = monitor.remediation.active.as_mut() else {
            return;
        };
        if active.record.id != delivery.intervention_id
            || active.record.attempts != delivery.attempt
        {
            log::debug!(
                "Dropping result of superseded level {} attempt for {}",
                delivery.level.number(),
                delivery.agent_id
            );
            return;
        }

        let deadline = match (result, policy(delivery.level).timeout) {
            (Ok(()), Some(timeout)) => delivery.issued_at + to_chrono(timeout),
            _ => delivery.issued_at,
        };
        active.deadline = Some(deadline);
    }

    async fn escalate(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        level: InterventionLevel,
        replacement: Option<Issue>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(active) = self.finish(monitor, InterventionOutcome::Escalated, now).await else {
            return Ok(());
        };

        if active.record.level == InterventionLevel::Restart {
            monitor
                .apply(&agent.id, LifecycleEvent::InterventionFailed, now, &self.audit)
                .await;
        }

        let issue = match replacement {
            Some(issue) => {
                self.audit
                    .record(
                        now,
                        AuditRecord::IssueSuperseded {
                            agent_id: agent.id.clone(),
                            issue_id: active.issue.id,
                            superseded_by: issue.id,
                        },
                    )
                    .await;
                issue
            }
            None => active.issue,
        };

        log::warn!(
            "Escalating {} from level {} to level {}",
            agent.id,
            active.record.level.number(),
            level.number()
        );
        self.start(agent, monitor, issue, level, now).await
    }

    /// Level 4: hand the agent to a human and stop automated remediation.
    async fn exhaust(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        monitor.remediation.queue.clear();
        let Some(active) = self.finish(monitor, InterventionOutcome::Escalated, now).await else {
            return Ok(());
        };

        self.audit
            .record(
                now,
                AuditRecord::EscalationExhausted {
                    agent_id: agent.id.clone(),
                    issue_id: active.issue.id,
                    intervention_id: active.record.id,
                },
            )
            .await;
        self.notifier
            .escalate(agent, &active.issue, &active.record)
            .await;

        let err = SupervisorError::EscalationExhausted {
            agent_id: agent.id.clone(),
        };
        log::error!("{}", err);
        Err(err)
    }

    async fn finish(
        &self,
        monitor: &mut AgentMonitor,
        outcome: InterventionOutcome,
        now: DateTime<Utc>,
    ) -> Option<ActiveRemediation> {
        let mut active = monitor.remediation.active.take()?;
        active.record.close(outcome, now);
        self.audit
            .record(
                now,
                AuditRecord::InterventionRecorded {
                    intervention: active.record.clone(),
                },
            )
            .await;
        Some(active)
    }

    async fn enqueue(&self, monitor: &mut AgentMonitor, issue: Issue, now: DateTime<Utc>) {
        let queue = &mut monitor.remediation.queue;
        queue.retain(|queued| queued.issue_type != issue.issue_type);

        log::info!(
            "Queued {} for {} behind active remediation",
            issue.issue_type.as_str(),
            issue.agent_id
        );
        self.audit
            .record(
                now,
                AuditRecord::IssueQueued {
                    agent_id: issue.agent_id.clone(),
                    issue_id: issue.id,
                },
            )
            .await;
        queue.push(issue);
    }

    async fn start_queued(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let queue = &mut monitor.remediation.queue;
        let Some(index) = (0..queue.len()).max_by_key(|&i| queue[i].severity) else {
            return Ok(());
        };

        let issue = queue.remove(index);
        let level = starting_level(&issue);
        self.start(agent, monitor, issue, level, now).await
    }

    /// Send every command of a delivery, bounded by its level's timeout.
    /// Level-1 deliveries pass through the agent's breaker and feed their
    /// result back into it.
    pub async fn deliver(&self, agent: &Agent, delivery: &Delivery) -> Result<()> {
        let policy = policy(delivery.level);
        let now = delivery.issued_at;
        let key = BreakerKey::agent(&agent.id);
        if policy.gated_by_breaker {
            self.breakers.try_acquire(&key, now)?;
        }

        let limit = policy.timeout.unwrap_or(EMERGENCY_DELIVERY_TIMEOUT);
        let deliveries = async {
            for command in &delivery.commands {
                self.sink.deliver(agent, command).await?;
            }
            Ok::<(), SupervisorError>(())
        };

        let result = match tokio::time::timeout(limit, deliveries).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::InterventionTimeout {
                agent_id: agent.id.clone(),
                level: delivery.level,
                timeout_secs: limit.as_secs(),
            }),
        };

        if policy.gated_by_breaker {
            let change = match &result {
                Ok(()) => self.breakers.record_success(&key),
                Err(_) => self.breakers.record_failure(&key, now),
            };
            if let Some(state) = change {
                self.record_breaker(agent, state, now).await;
            }
        }

        result
    }

    async fn open_breaker(&self, agent: &Agent, now: DateTime<Utc>) {
        if self.breakers.is_open(&agent.id, now) {
            return;
        }
        self.breakers.force_open(&agent.id, now);
        self.record_breaker(agent, BreakerStatus::Open, now).await;
    }

    async fn record_breaker(&self, agent: &Agent, state: BreakerStatus, now: DateTime<Utc>) {
        self.audit
            .record(
                now,
                AuditRecord::BreakerChanged {
                    agent_id: agent.id.clone(),
                    operation: None,
                    state,
                },
            )
            .await;
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::milliseconds(duration.as_millis() as i64)
}
