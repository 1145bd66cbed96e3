pub mod query;

pub use query::{AgentView, Overview};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::circuit::{Admission, BreakerKey};
use crate::config::{SupervisorConfig, Thresholds};
use crate::detection::{AnomalyDetector, DetectionContext};
use crate::dispatch::{AgentCommand, AgentCommandSink, LogNotifier, OperatorNotifier};
use crate::error::{Result, SupervisorError};
use crate::intervention::policy::EMERGENCY_DELIVERY_TIMEOUT;
use crate::intervention::{Delivery, InterventionEngine};
use crate::lifecycle::{HealthStateMachine, LifecycleEvent};
use crate::predictive::PredictiveScorer;
use crate::registry::{
    AgentEntry, AgentMonitor, DispatchMessage, IngressMessage, Registration, Registry,
};
use crate::storage::{AuditLog, AuditRecord, AuditStore, InMemoryAuditStore, OverrideAction};
use crate::types::{
    Agent, AgentId, AgentStatus, BreakerStatus, HealthSnapshot, InterventionLevel, Issue,
    OperationClass, Severity,
};

/// The supervision control plane. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    registry: Arc<Registry>,
    detector: Arc<AnomalyDetector>,
    scorer: Arc<PredictiveScorer>,
    engine: Arc<InterventionEngine>,
    audit: AuditLog,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, sink: Arc<dyn AgentCommandSink>) -> Self {
        Self::with_parts(
            config,
            sink,
            Arc::new(LogNotifier),
            Arc::new(InMemoryAuditStore::new()),
        )
    }

    pub fn with_parts(
        config: SupervisorConfig,
        sink: Arc<dyn AgentCommandSink>,
        notifier: Arc<dyn OperatorNotifier>,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        let breakers = Arc::new(crate::circuit::CircuitBreakerBank::new(config.breaker.clone()));
        let audit = AuditLog::new(store);
        let engine = InterventionEngine::new(sink, notifier, breakers.clone(), audit.clone());

        Self {
            registry: Arc::new(Registry::new(
                breakers,
                config.ingress_capacity,
                config.history_capacity,
            )),
            detector: Arc::new(AnomalyDetector::new(config.detection.clone())),
            scorer: Arc::new(PredictiveScorer::new(config.predictive.clone())),
            engine: Arc::new(engine),
            audit,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        self.audit.store()
    }

    // Registration

    /// Register or update an agent. Re-registering an id replaces its config
    /// and keeps its history.
    pub async fn register(&self, agent: Agent) -> Result<AgentId> {
        let id = agent.id.clone();
        let record = agent.clone();

        let replaced = match self.registry.upsert(agent) {
            Registration::Updated(_) => true,
            Registration::Created {
                entry,
                ingress,
                dispatch,
            } => {
                entry.add_task(tokio::spawn(self.clone().run_agent(entry.clone(), ingress)));
                entry.add_task(tokio::spawn(self.clone().run_dispatch(entry.clone(), dispatch)));
                false
            }
        };

        log::info!(
            "{} agent {} ({})",
            if replaced { "Updated" } else { "Registered" },
            id,
            record.agent_type
        );
        self.audit
            .record(
                Utc::now(),
                AuditRecord::Registered {
                    agent: record,
                    replaced,
                },
            )
            .await;
        Ok(id)
    }

    /// Remove an agent after draining the snapshots it already had queued.
    pub async fn deregister(&self, agent_id: &str) -> Result<()> {
        let entry = self
            .registry
            .remove(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;

        entry.preempt();
        if let Err(e) = entry.drain_ingress().await {
            log::debug!("Ingress for {} already closed: {}", agent_id, e);
        }
        entry.stop();

        log::info!("Deregistered agent {}", agent_id);
        self.audit
            .record(
                Utc::now(),
                AuditRecord::Deregistered {
                    agent_id: agent_id.to_string(),
                },
            )
            .await;
        Ok(())
    }

    // Ingress

    /// Accept a health report. Awaits only the enqueue onto the agent's
    /// channel; evaluation happens on the agent's monitor task.
    pub async fn report_health(&self, snapshot: HealthSnapshot) -> Result<()> {
        let entry = self.registry.get(&snapshot.agent_id)?;
        entry.submit(snapshot).await
    }

    /// Resolves once every snapshot accepted for the agent before this call
    /// has been processed.
    pub async fn flush(&self, agent_id: &str) -> Result<()> {
        self.registry.get(agent_id)?.flush().await
    }

    async fn run_agent(self, entry: Arc<AgentEntry>, mut ingress: mpsc::Receiver<IngressMessage>) {
        while let Some(message) = ingress.recv().await {
            match message {
                IngressMessage::Snapshot(snapshot) => self.process_snapshot(&entry, snapshot).await,
                IngressMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        log::debug!("Monitor loop for {} stopped", entry.id());
    }

    /// Deliver remediation commands for one agent, one delivery at a time,
    /// without holding its monitor lock.
    async fn run_dispatch(
        self,
        entry: Arc<AgentEntry>,
        mut queue: mpsc::UnboundedReceiver<DispatchMessage>,
    ) {
        let mut preempted = entry.preempt_signal();
        while let Some(message) = queue.recv().await {
            match message {
                DispatchMessage::Deliver {
                    delivery,
                    generation,
                } => {
                    self.run_delivery(&entry, delivery, generation, &mut preempted)
                        .await
                }
                DispatchMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        log::debug!("Dispatch loop for {} stopped", entry.id());
    }

    async fn run_delivery(
        &self,
        entry: &AgentEntry,
        delivery: Delivery,
        generation: u64,
        preempted: &mut watch::Receiver<u64>,
    ) {
        if *preempted.borrow_and_update() > generation {
            log::debug!(
                "Skipping preempted level {} delivery for {}",
                delivery.level.number(),
                delivery.agent_id
            );
            return;
        }

        let agent = entry.agent();
        let result = tokio::select! {
            result = self.engine.deliver(&agent, &delivery) => result,
            _ = wait_for_preempt(preempted, generation) => {
                log::warn!(
                    "Level {} delivery for {} preempted by operator",
                    delivery.level.number(),
                    delivery.agent_id
                );
                return;
            }
        };

        let mut monitor = entry.monitor.lock().await;
        self.engine.complete(&mut monitor, &delivery, result);
    }

    /// Record a snapshot and run the state machine over it. Entering
    /// degraded or worse runs the detector immediately.
    async fn process_snapshot(&self, entry: &AgentEntry, snapshot: HealthSnapshot) {
        let agent = entry.agent();
        let thresholds = self.config.thresholds_for(&agent.agent_type);
        let now = snapshot.timestamp;

        let mut monitor = entry.monitor.lock().await;
        monitor.tracker.record(snapshot, thresholds);

        let mut detect_now = false;
        let event =
            HealthStateMachine::evaluate_snapshot(monitor.status, &monitor.tracker, thresholds);
        if let Some(event) = event {
            if let Some(next) = monitor.apply(&agent.id, event, now, &self.audit).await {
                if event == LifecycleEvent::Recovered {
                    self.engine.resolve(&mut monitor, now).await;
                }
                detect_now = matches!(
                    next,
                    AgentStatus::Degraded | AgentStatus::Stuck | AgentStatus::Failed
                );
            }
        }

        if let Some(issue_type) = monitor.remediation.active().map(|a| a.issue.issue_type) {
            let cleared = {
                let ctx = context(&agent, &monitor, thresholds, now);
                !self
                    .detector
                    .findings(&ctx)
                    .iter()
                    .any(|f| f.issue_type == issue_type)
            };
            self.engine.observe(&mut monitor, thresholds, cleared, now).await;
        }

        if detect_now {
            self.detect(&agent, &mut monitor, thresholds, now).await;
        }
        entry.queue_deliveries(monitor.remediation.take_deliveries());
    }

    // Evaluation

    /// One evaluation tick across every agent, in parallel: silence check,
    /// remediation deadlines, then the detectors. Commands are only queued
    /// here, so a slow agent never holds up the tick.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let entries = self.registry.entries();
        join_all(entries.iter().map(|entry| self.tick_agent(entry, now))).await;
    }

    async fn tick_agent(&self, entry: &AgentEntry, now: DateTime<Utc>) {
        let agent = entry.agent();
        let thresholds = self.config.thresholds_for(&agent.agent_type);
        let mut monitor = entry.monitor.lock().await;

        let never_reported = monitor.tracker.is_empty()
            && monitor.status == AgentStatus::Healthy
            && now.signed_duration_since(agent.registered_at) >= thresholds.silence_limit();
        let silence = HealthStateMachine::evaluate_silence(
            monitor.status,
            &monitor.tracker,
            thresholds,
            now,
        )
        .or(never_reported.then_some(LifecycleEvent::Stalled));
        if let Some(event) = silence {
            monitor.apply(&agent.id, event, now, &self.audit).await;
        }

        settle(self.engine.on_tick(&agent, &mut monitor, now).await);
        self.detect(&agent, &mut monitor, thresholds, now).await;
        entry.queue_deliveries(monitor.remediation.take_deliveries());
    }

    /// Dependency-cycle pass over the whole registry.
    pub async fn check_dependencies(&self, now: DateTime<Utc>) {
        let graph = self.registry.dependency_graph();
        for entry in self.registry.entries() {
            let agent = entry.agent();
            let Some(issue) = self.detector.check_dependencies(&agent.id, &graph, now) else {
                continue;
            };

            let mut monitor = entry.monitor.lock().await;
            if monitor.status != AgentStatus::Isolated {
                self.raise(&agent, &mut monitor, issue, now).await;
                entry.queue_deliveries(monitor.remediation.take_deliveries());
            }
        }
    }

    /// Predictive pass: advisory issues for healthy agents trending towards
    /// a threshold.
    pub async fn run_predictive(&self, now: DateTime<Utc>) {
        let entries = self.registry.entries();
        join_all(entries.iter().map(|entry| self.predict_agent(entry, now))).await;
    }

    async fn predict_agent(&self, entry: &AgentEntry, now: DateTime<Utc>) {
        let agent = entry.agent();
        let thresholds = self.config.thresholds_for(&agent.agent_type);
        let mut monitor = entry.monitor.lock().await;

        let issue = {
            let ctx = context(&agent, &monitor, thresholds, now);
            let hard = self.detector.findings(&ctx);
            self.scorer.assess(&ctx, &hard)
        };
        if let Some(issue) = issue {
            self.raise(&agent, &mut monitor, issue, now).await;
            entry.queue_deliveries(monitor.remediation.take_deliveries());
        }
    }

    async fn detect(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) {
        let issue = {
            let ctx = context(agent, monitor, thresholds, now);
            self.detector.evaluate(&ctx)
        };
        if let Some(issue) = issue {
            self.raise(agent, monitor, issue, now).await;
        }
    }

    async fn raise(
        &self,
        agent: &Agent,
        monitor: &mut AgentMonitor,
        issue: Issue,
        now: DateTime<Utc>,
    ) {
        let cooldown = Duration::seconds(self.config.detection.reraise_cooldown_secs as i64);
        if !monitor.cooldown.admit(&issue, cooldown) {
            log::debug!(
                "Suppressing repeat {} for {} inside cooldown",
                issue.issue_type.as_str(),
                agent.id
            );
            return;
        }

        log::warn!(
            "Issue {} [{}] for {}: {}",
            issue.issue_type.as_str(),
            issue.severity.as_str(),
            agent.id,
            issue.summary()
        );
        self.audit
            .record(now, AuditRecord::IssueRaised { issue: issue.clone() })
            .await;
        settle(self.engine.handle_issue(agent, monitor, issue, now).await);
    }

    /// Spawn the shared background workers: evaluation tick, dependency
    /// cadence and predictive scorer. All stop when `shutdown` turns true.
    pub fn run_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let detection = &self.config.detection;
        let cadences = [
            (Worker::Tick, detection.tick_secs),
            (Worker::Dependencies, detection.dependency_check_secs),
            (Worker::Predictive, self.config.predictive.interval_secs),
        ];

        cadences
            .into_iter()
            .map(|(worker, secs)| {
                let supervisor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    supervisor
                        .run_worker(worker, std::time::Duration::from_secs(secs.max(1)), shutdown)
                        .await
                })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        worker: Worker,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Starting {:?} worker every {}s", worker, period.as_secs());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    match worker {
                        Worker::Tick => self.tick(now).await,
                        Worker::Dependencies => self.check_dependencies(now).await,
                        Worker::Predictive => self.run_predictive(now).await,
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        log::info!("{:?} worker stopped", worker);
    }

    // Traffic gating

    /// Gate a unit of workload bound for an agent.
    pub fn admit_traffic(
        &self,
        agent_id: &str,
        operation: Option<OperationClass>,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let entry = self.registry.get(agent_id)?;
        let breakers = self.registry.breakers();

        if entry.status() == AgentStatus::Isolated {
            let state = breakers.state(&BreakerKey::agent(agent_id));
            return Err(SupervisorError::CircuitOpenRejected {
                agent_id: agent_id.to_string(),
                next_probe_at: state.next_probe_at.unwrap_or(now),
            });
        }

        breakers.try_acquire(&breaker_key(agent_id, operation), now)
    }

    /// Feed the result of admitted traffic back into the breaker.
    pub async fn report_traffic_outcome(
        &self,
        agent_id: &str,
        operation: Option<OperationClass>,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakerStatus>> {
        self.registry.get(agent_id)?;
        let key = breaker_key(agent_id, operation);
        let breakers = self.registry.breakers();

        let change = if success {
            breakers.record_success(&key)
        } else {
            breakers.record_failure(&key, now)
        };

        if let Some(state) = change {
            self.audit
                .record(
                    now,
                    AuditRecord::BreakerChanged {
                        agent_id: agent_id.to_string(),
                        operation,
                        state,
                    },
                )
                .await;
        }
        Ok(change)
    }

    // Manual overrides

    /// Force every agent straight to Level 4, preempting active remediation
    /// and cancelling any delivery still in flight.
    pub async fn emergency_stop_all(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        log::error!("Emergency stop requested for all agents");
        self.audit
            .record(
                now,
                AuditRecord::OperatorOverride {
                    agent_id: None,
                    action: OverrideAction::EmergencyStop,
                },
            )
            .await;

        let entries = self.registry.entries();
        let stops = entries.iter().map(|entry| async move {
            let agent = entry.agent();
            let issue = Issue::manual(agent.id.clone(), now, Severity::Critical, "emergency stop");
            self.override_level(entry, &agent, issue, InterventionLevel::Emergency, now)
                .await;
            agent.id
        });

        let mut stopped = join_all(stops).await;
        stopped.sort();
        stopped
    }

    /// Start a chain at an operator-chosen level for one agent.
    pub async fn manual_intervene(
        &self,
        agent_id: &str,
        level: u8,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let level =
            InterventionLevel::try_from(level).map_err(|_| SupervisorError::InvalidLevel(level))?;
        let entry = self.registry.get(agent_id)?;
        let agent = entry.agent();

        log::warn!("Manual level {} intervention on {}", level.number(), agent_id);
        self.audit
            .record(
                now,
                AuditRecord::OperatorOverride {
                    agent_id: Some(agent_id.to_string()),
                    action: OverrideAction::ManualIntervene { level },
                },
            )
            .await;

        let severity = if level >= InterventionLevel::Isolate {
            Severity::Critical
        } else {
            Severity::High
        };
        let issue = Issue::manual(
            agent.id.clone(),
            now,
            severity,
            &format!("manual level {} intervention", level.number()),
        );
        self.override_level(&entry, &agent, issue, level, now).await;
        Ok(())
    }

    async fn override_level(
        &self,
        entry: &AgentEntry,
        agent: &Agent,
        issue: Issue,
        level: InterventionLevel,
        now: DateTime<Utc>,
    ) {
        entry.preempt();
        let mut monitor = entry.monitor.lock().await;
        self.audit
            .record(now, AuditRecord::IssueRaised { issue: issue.clone() })
            .await;
        settle(self.engine.preempt(agent, &mut monitor, issue, level, now).await);
        entry.queue_deliveries(monitor.remediation.take_deliveries());
    }

    /// Return an isolated agent to service. The only way out of `isolated`.
    pub async fn clear_isolation(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        let entry = self.registry.get(agent_id)?;
        let agent = entry.agent();
        let mut monitor = entry.monitor.lock().await;

        if monitor.status != AgentStatus::Isolated {
            return Err(SupervisorError::NotIsolated(agent_id.to_string()));
        }

        entry.preempt();
        monitor
            .apply(agent_id, LifecycleEvent::ClearIsolation, now, &self.audit)
            .await;
        self.engine.resolve(&mut monitor, now).await;
        monitor.remediation.clear();
        monitor.cooldown.clear();
        monitor.tracker.reset_baseline(now);
        drop(monitor);

        self.registry.breakers().force_close(agent_id);
        self.audit
            .record(
                now,
                AuditRecord::BreakerChanged {
                    agent_id: agent_id.to_string(),
                    operation: None,
                    state: BreakerStatus::Closed,
                },
            )
            .await;
        let close = self
            .engine
            .sink()
            .deliver(&agent, &AgentCommand::CircuitBreakerClose);
        match tokio::time::timeout(EMERGENCY_DELIVERY_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Could not notify {} of breaker close: {}", agent_id, e),
            Err(_) => log::warn!("Timed out notifying {} of breaker close", agent_id),
        }

        log::info!("Isolation cleared for {}", agent_id);
        self.audit
            .record(
                now,
                AuditRecord::OperatorOverride {
                    agent_id: Some(agent_id.to_string()),
                    action: OverrideAction::ClearIsolation,
                },
            )
            .await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Worker {
    Tick,
    Dependencies,
    Predictive,
}

fn context<'a>(
    agent: &'a Agent,
    monitor: &'a AgentMonitor,
    thresholds: &'a Thresholds,
    now: DateTime<Utc>,
) -> DetectionContext<'a> {
    DetectionContext {
        agent_id: &agent.id,
        status: monitor.status,
        tracker: &monitor.tracker,
        thresholds,
        now,
    }
}

fn breaker_key(agent_id: &str, operation: Option<OperationClass>) -> BreakerKey {
    match operation {
        Some(operation) => BreakerKey::operation(agent_id, operation),
        None => BreakerKey::agent(agent_id),
    }
}

/// Level-4 exhaustion is already audited and sent to the operator notifier.
fn settle(result: Result<()>) {
    match result {
        Ok(()) | Err(SupervisorError::EscalationExhausted { .. }) => {}
        Err(e) => log::error!("Remediation error: {}", e),
    }
}

/// Resolves once an override newer than `generation` has been issued.
async fn wait_for_preempt(preempted: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *preempted.borrow_and_update() > generation {
            return;
        }
        if preempted.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
