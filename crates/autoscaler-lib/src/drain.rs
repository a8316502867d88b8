//! Drain coordination
//!
//! Each node selected for removal gets a [`DrainRecord`] that walks
//! `Cordoned → Evicting → Drained → Terminating → Terminated`, with `Failed`
//! reachable from `Evicting` and `Terminating`. Each call to `advance`
//! reports every state the record entered. A drain that reaches `Drained`
//! waits for the next tick before its instance is terminated. Records live
//! in the loop's node table so a drain survives failed ticks and resumes
//! where it stopped.

use crate::capacity::elapsed;
use crate::config::ScalerConfig;
use crate::error::{OrchestratorError, ProvisionError};
use crate::models::Pod;
use crate::observability::StructuredLogger;
use crate::planner::DrainAction;
use crate::provider::{EvictOutcome, Orchestrator, Provisioner};
use crate::retry::{bounded, retry_with_backoff, RetryPolicy};
use crate::snapshot::ClusterStateSnapshot;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Phase of a node drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Cordoned,
    Evicting,
    Drained,
    Terminating,
    Terminated,
    Failed,
}

impl DrainState {
    pub const ALL: [DrainState; 6] = [
        DrainState::Cordoned,
        DrainState::Evicting,
        DrainState::Drained,
        DrainState::Terminating,
        DrainState::Terminated,
        DrainState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DrainState::Cordoned => "cordoned",
            DrainState::Evicting => "evicting",
            DrainState::Drained => "drained",
            DrainState::Terminating => "terminating",
            DrainState::Terminated => "terminated",
            DrainState::Failed => "failed",
        }
    }

    /// No further transitions happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, DrainState::Terminated | DrainState::Failed)
    }
}

/// Durable progress of one node's removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRecord {
    pub node_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub state: DrainState,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    /// When the current state was entered
    pub state_since: DateTime<Utc>,
    /// Pods whose eviction the disruption budget refused on the last attempt
    pub blocked_pods: Vec<String>,
    /// Completed by overriding blocked evictions
    pub forced: bool,
    /// The provisioner accepted the termination request
    #[serde(default)]
    pub terminate_accepted: bool,
    pub last_error: Option<String>,
}

impl DrainRecord {
    /// A freshly cordoned node
    pub fn new(
        node_id: impl Into<String>,
        instance_id: impl Into<String>,
        instance_type: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            instance_id: instance_id.into(),
            instance_type: instance_type.into(),
            state: DrainState::Cordoned,
            reason: reason.into(),
            started_at: now,
            state_since: now,
            blocked_pods: Vec::new(),
            forced: false,
            terminate_accepted: false,
            last_error: None,
        }
    }

    fn enter(&mut self, state: DrainState, now: DateTime<Utc>) -> Option<(DrainState, DrainState)> {
        let from = self.state;
        if from == state {
            return None;
        }
        self.state = state;
        self.state_since = now;
        Some((from, state))
    }
}

/// State changes applied to one record during a call to `advance`
pub type DrainSteps = Vec<(DrainState, DrainState)>;

/// Timing and retry settings for drain calls
#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Force-complete a drain blocked this long; `None` waits indefinitely
    pub force_after: Option<Duration>,
    pub termination_timeout: Duration,
}

impl DrainSettings {
    pub fn from_config(config: &ScalerConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            retry: config.retry_policy(),
            force_after: config.force_drain_after(),
            termination_timeout: config.termination_timeout(),
        }
    }
}

/// Applies drain steps through the collaborators
pub struct DrainCoordinator {
    orchestrator: Arc<dyn Orchestrator>,
    provisioner: Arc<dyn Provisioner>,
    settings: DrainSettings,
    logger: StructuredLogger,
}

impl DrainCoordinator {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        provisioner: Arc<dyn Provisioner>,
        settings: DrainSettings,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            orchestrator,
            provisioner,
            settings,
            logger,
        }
    }

    /// Cordon the node and open a drain record for it. On failure the node
    /// is left untracked and may be selected again next tick.
    pub async fn begin(
        &self,
        action: &DrainAction,
        now: DateTime<Utc>,
    ) -> Result<DrainRecord, OrchestratorError> {
        let limit = self.settings.call_timeout;
        retry_with_backoff(
            &self.settings.retry,
            "cordon",
            OrchestratorError::is_transient,
            || {
                bounded(limit, self.orchestrator.cordon(&action.node_id), |timeout| {
                    OrchestratorError::Timeout {
                        operation: "cordon",
                        timeout,
                    }
                })
            },
        )
        .await?;

        let reason = action.reason.to_string();
        self.logger
            .log_drain_started(&action.node_id, &action.instance_type, &reason);
        Ok(DrainRecord::new(
            action.node_id.as_str(),
            action.instance_id.as_str(),
            action.instance_type.as_str(),
            reason,
            now,
        ))
    }

    /// Advance a drain against the current snapshot. Returns one
    /// `(from, to)` pair per state entered, in order.
    pub async fn advance(
        &self,
        record: &mut DrainRecord,
        snapshot: &ClusterStateSnapshot,
        now: DateTime<Utc>,
    ) -> DrainSteps {
        let mut steps = DrainSteps::new();
        if record.state.is_terminal() {
            return steps;
        }

        if snapshot.node(&record.node_id).is_none() {
            record.blocked_pods.clear();
            self.enter(record, DrainState::Terminated, now, &mut steps);
            return steps;
        }

        match record.state {
            DrainState::Cordoned => {
                self.enter(record, DrainState::Evicting, now, &mut steps);
                self.evict_pods(record, snapshot, now, &mut steps).await;
            }
            DrainState::Evicting => self.evict_pods(record, snapshot, now, &mut steps).await,
            DrainState::Drained => {
                record.terminate_accepted = false;
                self.enter(record, DrainState::Terminating, now, &mut steps);
                self.terminate(record, now, &mut steps).await;
            }
            DrainState::Terminating => {
                let waited = elapsed(now, record.state_since);
                if waited >= self.settings.termination_timeout {
                    let error = format!(
                        "instance {} still registered {}s after termination",
                        record.instance_id,
                        waited.as_secs()
                    );
                    self.fail(record, error, now, &mut steps);
                } else if !record.terminate_accepted {
                    self.terminate(record, now, &mut steps).await;
                }
            }
            DrainState::Terminated | DrainState::Failed => {}
        }
        steps
    }

    fn enter(
        &self,
        record: &mut DrainRecord,
        state: DrainState,
        now: DateTime<Utc>,
        steps: &mut DrainSteps,
    ) {
        if let Some((from, to)) = record.enter(state, now) {
            self.logger.log_drain_transition(&record.node_id, from, to);
            steps.push((from, to));
        }
    }

    fn fail(&self, record: &mut DrainRecord, error: String, now: DateTime<Utc>, steps: &mut DrainSteps) {
        self.logger.log_drain_failed(&record.node_id, &error);
        record.last_error = Some(error);
        self.enter(record, DrainState::Failed, now, steps);
    }

    async fn evict_one(&self, pod: &Pod) -> Result<EvictOutcome, OrchestratorError> {
        let limit = self.settings.call_timeout;
        retry_with_backoff(
            &self.settings.retry,
            "evict",
            OrchestratorError::is_transient,
            || {
                bounded(limit, self.orchestrator.evict(pod), |timeout| {
                    OrchestratorError::Timeout {
                        operation: "evict",
                        timeout,
                    }
                })
            },
        )
        .await
    }

    async fn evict_pods(
        &self,
        record: &mut DrainRecord,
        snapshot: &ClusterStateSnapshot,
        now: DateTime<Utc>,
        steps: &mut DrainSteps,
    ) {
        // System pods are left to die with the node
        let pods: Vec<&Pod> = snapshot
            .pods_on(&record.node_id)
            .filter(|p| !p.system)
            .collect();

        if pods.is_empty() {
            record.blocked_pods.clear();
            record.last_error = None;
            self.enter(record, DrainState::Drained, now, steps);
            return;
        }

        let results = join_all(pods.iter().map(|pod| self.evict_one(pod))).await;

        let mut blocked = Vec::new();
        let mut timed_out = None;
        for (pod, result) in pods.iter().zip(results) {
            match result {
                Ok(EvictOutcome::Evicted) | Ok(EvictOutcome::NotFound) => {}
                Ok(EvictOutcome::BudgetViolation) => blocked.push(pod.key()),
                Err(e) if e.is_timeout() => {
                    debug!(node = %record.node_id, pod = %pod.key(), "Eviction timed out, retrying next tick");
                    timed_out = Some(format!("evict {}: {}", pod.key(), e));
                }
                Err(e) => {
                    let error = format!("evict {}: {}", pod.key(), e);
                    self.fail(record, error, now, steps);
                    return;
                }
            }
        }

        record.last_error = timed_out;
        record.blocked_pods = blocked;
        if record.blocked_pods.is_empty() {
            return;
        }

        let blocked_for = elapsed(now, record.state_since);
        match self.settings.force_after {
            Some(limit) if blocked_for >= limit => {
                self.logger.log_drain_forced(
                    &record.node_id,
                    &record.blocked_pods,
                    blocked_for.as_secs(),
                );
                record.forced = true;
                self.enter(record, DrainState::Drained, now, steps);
            }
            _ => self
                .logger
                .log_drain_blocked(&record.node_id, &record.blocked_pods),
        }
    }

    /// Issue the termination for a record already in `Terminating`. A timed
    /// out or unavailable provisioner is retried next tick, bounded by the
    /// termination timeout.
    async fn terminate(&self, record: &mut DrainRecord, now: DateTime<Utc>, steps: &mut DrainSteps) {
        let limit = self.settings.call_timeout;
        let instance_id = record.instance_id.clone();
        let result = retry_with_backoff(
            &self.settings.retry,
            "terminate",
            ProvisionError::is_transient,
            || {
                bounded(limit, self.provisioner.terminate(&instance_id), |timeout| {
                    ProvisionError::Timeout {
                        operation: "terminate",
                        timeout,
                    }
                })
            },
        )
        .await;

        match result {
            Ok(()) => {
                record.terminate_accepted = true;
                record.last_error = None;
            }
            Err(e) if e.is_timeout() || e.is_transient() => {
                debug!(node = %record.node_id, instance = %record.instance_id, error = %e, "Terminate not confirmed, retrying next tick");
                record.last_error = Some(format!("terminate {}: {}", record.instance_id, e));
            }
            Err(e) => {
                let error = format!("terminate {}: {}", record.instance_id, e);
                self.fail(record, error, now, steps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DrainReason;
    use crate::testing::{
        fleet_node, pod_on, profile, system_pod_on, MockOrchestrator, MockProvisioner,
    };
    use chrono::Duration as ChronoDuration;

    fn settings() -> DrainSettings {
        DrainSettings {
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            force_after: None,
            termination_timeout: Duration::from_secs(600),
        }
    }

    fn coordinator(
        orchestrator: Arc<MockOrchestrator>,
        provisioner: Arc<MockProvisioner>,
        settings: DrainSettings,
    ) -> DrainCoordinator {
        DrainCoordinator::new(orchestrator, provisioner, settings, StructuredLogger::new("prod"))
    }

    fn snapshot(now: DateTime<Utc>, pods: Vec<Pod>) -> ClusterStateSnapshot {
        ClusterStateSnapshot::from_parts(
            now,
            vec![fleet_node("node-a", "m5.xlarge", now - ChronoDuration::hours(1))],
            pods,
            vec![profile("m5.xlarge", 4000, 120)],
        )
    }

    fn action() -> DrainAction {
        DrainAction {
            node_id: "node-a".to_string(),
            instance_id: "i-node-a".to_string(),
            instance_type: "m5.xlarge".to_string(),
            reason: DrainReason::Idle { idle_for_secs: 900 },
        }
    }

    #[tokio::test]
    async fn test_begin_cordons_node() {
        let orchestrator = Arc::new(MockOrchestrator::default());
        let coordinator = coordinator(orchestrator.clone(), Arc::new(MockProvisioner::default()), settings());

        let record = coordinator.begin(&action(), Utc::now()).await.unwrap();
        assert_eq!(record.state, DrainState::Cordoned);
        assert_eq!(record.reason, "idle for 900s");
        assert_eq!(orchestrator.cordoned(), vec!["node-a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_failure_leaves_node_untracked() {
        let orchestrator = Arc::new(MockOrchestrator::default());
        orchestrator.fail_cordon(OrchestratorError::Api("connection reset".to_string()));
        let coordinator = coordinator(orchestrator.clone(), Arc::new(MockProvisioner::default()), settings());

        assert!(coordinator.begin(&action(), Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let now = Utc::now();
        let pods = vec![
            pod_on("default", "web", "node-a", 500),
            system_pod_on("kube-system", "proxy", "node-a", 100),
        ];
        let orchestrator = Arc::new(MockOrchestrator::with_state(vec![], pods.clone()));
        let provisioner = Arc::new(MockProvisioner::default());
        let coordinator = coordinator(orchestrator.clone(), provisioner.clone(), settings());
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);

        // Eviction issued for the workload pod, system pods untouched
        let with_pods = snapshot(now, pods);
        let steps = coordinator.advance(&mut record, &with_pods, now).await;
        assert_eq!(steps, vec![(DrainState::Cordoned, DrainState::Evicting)]);
        assert_eq!(orchestrator.evicted(), vec!["default/web".to_string()]);

        let emptied = snapshot(now, vec![system_pod_on("kube-system", "proxy", "node-a", 100)]);
        let steps = coordinator.advance(&mut record, &emptied, now).await;
        assert_eq!(steps, vec![(DrainState::Evicting, DrainState::Drained)]);

        let steps = coordinator.advance(&mut record, &emptied, now).await;
        assert_eq!(steps, vec![(DrainState::Drained, DrainState::Terminating)]);
        assert_eq!(provisioner.terminated(), vec!["i-node-a".to_string()]);
        assert!(record.terminate_accepted);

        // Still registered: keep waiting without asking again
        assert!(coordinator.advance(&mut record, &emptied, now).await.is_empty());
        assert_eq!(provisioner.terminated().len(), 1);

        let gone = ClusterStateSnapshot::from_parts(now, vec![], vec![], vec![]);
        let steps = coordinator.advance(&mut record, &gone, now).await;
        assert_eq!(steps, vec![(DrainState::Terminating, DrainState::Terminated)]);
        assert!(coordinator.advance(&mut record, &gone, now).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_node_reports_each_state_entered() {
        let now = Utc::now();
        let coordinator = coordinator(
            Arc::new(MockOrchestrator::default()),
            Arc::new(MockProvisioner::default()),
            settings(),
        );
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);

        let steps = coordinator.advance(&mut record, &snapshot(now, vec![]), now).await;
        assert_eq!(
            steps,
            vec![
                (DrainState::Cordoned, DrainState::Evicting),
                (DrainState::Evicting, DrainState::Drained),
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_budget_blocks_drain() {
        let orchestrator = Arc::new(MockOrchestrator::default());
        let coordinator = coordinator(orchestrator.clone(), Arc::new(MockProvisioner::default()), settings());
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);

        let mut guarded = pod_on("default", "db-0", "node-a", 500);
        guarded.disruptions_allowed = Some(0);
        let snapshot = snapshot(now, vec![guarded]);

        coordinator.advance(&mut record, &snapshot, now).await;
        assert_eq!(record.state, DrainState::Evicting);
        assert_eq!(record.blocked_pods, vec!["default/db-0".to_string()]);

        // Re-checked every tick, never forced without configuration
        let later = now + ChronoDuration::hours(6);
        assert!(coordinator.advance(&mut record, &snapshot, later).await.is_empty());
        assert_eq!(record.state, DrainState::Evicting);
        assert!(!record.forced);
    }

    #[tokio::test]
    async fn test_force_after_blocked_window() {
        let orchestrator = Arc::new(MockOrchestrator::default());
        let coordinator = coordinator(
            orchestrator,
            Arc::new(MockProvisioner::default()),
            DrainSettings {
                force_after: Some(Duration::from_secs(300)),
                ..settings()
            },
        );
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);

        let mut guarded = pod_on("default", "db-0", "node-a", 500);
        guarded.disruptions_allowed = Some(0);
        let snapshot = snapshot(now, vec![guarded]);

        coordinator.advance(&mut record, &snapshot, now).await;
        assert_eq!(record.state, DrainState::Evicting);

        let later = now + ChronoDuration::seconds(301);
        let steps = coordinator.advance(&mut record, &snapshot, later).await;
        assert_eq!(steps, vec![(DrainState::Evicting, DrainState::Drained)]);
        assert!(record.forced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_errors_exhaust_to_failed() {
        let orchestrator = Arc::new(MockOrchestrator::default());
        orchestrator.fail_evict(OrchestratorError::Api("etcd timeout".to_string()));
        let coordinator = coordinator(orchestrator.clone(), Arc::new(MockProvisioner::default()), settings());
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);

        let snapshot = snapshot(now, vec![pod_on("default", "web", "node-a", 500)]);
        let steps = coordinator.advance(&mut record, &snapshot, now).await;
        assert_eq!(
            steps,
            vec![
                (DrainState::Cordoned, DrainState::Evicting),
                (DrainState::Evicting, DrainState::Failed),
            ]
        );
        assert!(record.last_error.as_deref().unwrap().contains("etcd timeout"));
        // Both attempts were made
        assert_eq!(orchestrator.evict_calls(), 2);

        // Failed is terminal for the coordinator
        assert!(coordinator.advance(&mut record, &snapshot, now).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_rejected_fails() {
        let provisioner = Arc::new(MockProvisioner::default());
        provisioner.fail_terminate(ProvisionError::Rejected("instance protected".to_string()));
        let coordinator = coordinator(Arc::new(MockOrchestrator::default()), provisioner, settings());
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);
        record.enter(DrainState::Drained, now);

        let steps = coordinator.advance(&mut record, &snapshot(now, vec![]), now).await;
        assert_eq!(
            steps,
            vec![
                (DrainState::Drained, DrainState::Terminating),
                (DrainState::Terminating, DrainState::Failed),
            ]
        );
        assert!(record.last_error.as_deref().unwrap().contains("instance protected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_termination_retried_next_tick() {
        let provisioner = Arc::new(MockProvisioner::default());
        provisioner.fail_terminate(ProvisionError::Unavailable("throttled".to_string()));
        let coordinator = coordinator(Arc::new(MockOrchestrator::default()), provisioner.clone(), settings());
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);
        record.enter(DrainState::Drained, now);

        let steps = coordinator.advance(&mut record, &snapshot(now, vec![]), now).await;
        assert_eq!(steps, vec![(DrainState::Drained, DrainState::Terminating)]);
        assert!(!record.terminate_accepted);
        assert!(record.last_error.is_some());

        provisioner.clear_terminate_error();
        let later = now + ChronoDuration::seconds(60);
        assert!(coordinator.advance(&mut record, &snapshot(later, vec![]), later).await.is_empty());
        assert_eq!(record.state, DrainState::Terminating);
        assert!(record.terminate_accepted);
        assert_eq!(provisioner.terminated(), vec!["i-node-a".to_string()]);
        // Timeout still measured from entry into Terminating
        assert_eq!(record.state_since, now);
    }

    #[tokio::test]
    async fn test_termination_timeout_fails() {
        let coordinator = coordinator(
            Arc::new(MockOrchestrator::default()),
            Arc::new(MockProvisioner::default()),
            settings(),
        );
        let now = Utc::now();
        let mut record = DrainRecord::new("node-a", "i-node-a", "m5.xlarge", "idle", now);
        record.enter(DrainState::Terminating, now);

        record.terminate_accepted = true;

        let later = now + ChronoDuration::seconds(601);
        let steps = coordinator
            .advance(&mut record, &snapshot(later, vec![]), later)
            .await;
        assert_eq!(steps, vec![(DrainState::Terminating, DrainState::Failed)]);
    }
}
