//! Tick driver
//!
//! Runs one tick per interval. A tick either captures a consistent snapshot
//! and runs to completion, or aborts before touching any loop state.

use super::table::NodeTable;
use crate::capacity::{self, elapsed, CapacityReport};
use crate::config::ScalerConfig;
use crate::drain::{DrainCoordinator, DrainSettings, DrainState};
use crate::error::{ConfigError, OrchestratorError, ProvisionError, StateFetchError};
use crate::health::{Collaborator, HealthRegistry};
use crate::models::InFlightLaunch;
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::planner::{
    scale_down, scale_up, DrainAction, LaunchAction, LaunchBackoff, LaunchReason, ScalingAction,
    ScalingPlan, ScalingPolicy,
};
use crate::provider::{Orchestrator, Provisioner};
use crate::retry::{bounded, retry_with_backoff};
use crate::snapshot::{self, ClusterStateSnapshot};
use crate::status::{NodeDrainStatus, ScalerStatus, StatusError, StatusHandle};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A drain state change applied during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTransition {
    pub node_id: String,
    pub from: DrainState,
    pub to: DrainState,
}

/// What a completed tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub plan: ScalingPlan,
    /// Instances the provisioner confirmed
    pub launched: u32,
    /// Nodes cordoned this tick
    pub drains_started: usize,
    pub transitions: Vec<DrainTransition>,
    /// Non-fatal failures recorded while applying the plan
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    launched: u64,
    drained: u64,
    terminated: u64,
}

/// The reconciliation loop and the state it owns
pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    provisioner: Arc<dyn Provisioner>,
    config: ScalerConfig,
    table: NodeTable,
    in_flight: Vec<InFlightLaunch>,
    backoff: LaunchBackoff,
    policy: ScalingPolicy,
    drains: DrainCoordinator,
    counters: Counters,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
    status: StatusHandle,
}

impl Reconciler {
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    pub fn in_flight(&self) -> &[InFlightLaunch] {
        &self.in_flight
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn launch_backoff(&self) -> &LaunchBackoff {
        &self.backoff
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Run ticks until shutdown is signalled. A tick already in progress
    /// always completes first.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let started_at = Utc::now();
        for collaborator in Collaborator::ALL {
            self.health.register(collaborator, started_at).await;
        }

        info!(
            interval_secs = self.config.tick_interval_secs,
            policy = %self.policy.name(),
            "Starting reconciliation loop"
        );

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        debug!(error = %e, "Tick aborted, retrying next interval");
                    }
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Execute one reconciliation tick at `now`
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, StateFetchError> {
        let started = Instant::now();

        let snapshot = match snapshot::capture(
            self.orchestrator.as_ref(),
            self.provisioner.as_ref(),
            &self.config,
            now,
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_failure(&e, now).await;
                return Err(e);
            }
        };
        self.health.set_healthy(Collaborator::Snapshot, now).await;

        self.expire_in_flight(&snapshot, now);
        let in_flight = &self.in_flight;
        self.table.retain_buffer(|id| {
            snapshot.has_instance(id) || in_flight.iter().any(|l| l.instance_id == id)
        });
        let report = capacity::compute(&snapshot, &self.table, &self.in_flight, &self.config, now);
        self.table.record_idle(&report);
        self.policy.observe(&report, now);

        // Both plans are computed before anything is applied
        let launches = scale_up::plan(&report, &self.config, &self.backoff);
        let drain_actions = scale_down::plan(&report, &snapshot, &self.policy, &self.config);

        let mut tick = TickReport::default();
        self.apply_launches(&launches, &mut tick, now).await;
        self.begin_drains(&drain_actions, &mut tick, now).await;
        self.advance_drains(&snapshot, &mut tick, now).await;
        self.table.prune(&snapshot);

        self.publish(&report, &tick, now).await;
        self.health.record_tick(now).await;

        let duration = started.elapsed();
        self.metrics.observe_tick_latency(duration.as_secs_f64());
        self.metrics.set_fleet_size(report.fleet_size);
        let pending = report.total_pending();
        self.metrics
            .set_pending(pending.cpu_millis, pending.memory_bytes);
        self.metrics.set_drain_states(&self.table.drain_states());
        self.logger.log_tick_complete(
            report.fleet_size,
            tick.launched,
            tick.drains_started,
            tick.transitions.len(),
            duration.as_millis(),
        );

        Ok(tick)
    }

    /// Drop launches whose node registered, or that never registered within
    /// boot latency plus init time. A launch that never registered backs its
    /// type off.
    fn expire_in_flight(&mut self, snapshot: &ClusterStateSnapshot, now: DateTime<Utc>) {
        self.backoff.expire(now);
        let init_time = self.config.instance_init_time();
        let mut timed_out = Vec::new();
        self.in_flight.retain(|launch| {
            if snapshot.has_instance(&launch.instance_id) {
                return false;
            }
            let boot = snapshot
                .instance_types
                .get(&launch.instance_type)
                .map(|p| p.boot_latency())
                .unwrap_or_default();
            let waited = elapsed(now, launch.requested_at);
            if waited >= boot + init_time {
                warn!(
                    instance = %launch.instance_id,
                    instance_type = %launch.instance_type,
                    waited_secs = waited.as_secs(),
                    "Launched instance never registered, no longer counting it"
                );
                timed_out.push(launch.instance_type.clone());
                return false;
            }
            true
        });
        for instance_type in timed_out {
            self.backoff
                .record_failure(&instance_type, now, self.config.launch_backoff());
        }
    }

    /// Only errors proving the provider refused the request are retried.
    /// An unconfirmed launch may already have created instances.
    async fn launch(&self, action: &LaunchAction) -> Result<Vec<String>, ProvisionError> {
        let limit = self.config.call_timeout();
        retry_with_backoff(
            &self.config.retry_policy(),
            "launch",
            ProvisionError::is_transient,
            || {
                bounded(
                    limit,
                    self.provisioner.launch(&action.instance_type, action.count),
                    |timeout| ProvisionError::Timeout {
                        operation: "launch",
                        timeout,
                    },
                )
            },
        )
        .await
    }

    async fn apply_launches(
        &mut self,
        launches: &[LaunchAction],
        tick: &mut TickReport,
        now: DateTime<Utc>,
    ) {
        if launches.is_empty() {
            return;
        }

        let results = join_all(launches.iter().map(|action| self.launch(action))).await;

        let mut failures = Vec::new();
        let mut failed_types = Vec::new();
        for (action, result) in launches.iter().zip(results) {
            tick.plan.push(ScalingAction::Launch(action.clone()));
            match result {
                Ok(instance_ids) => {
                    self.logger.log_scale_up(
                        &action.instance_type,
                        action.count,
                        &instance_ids,
                        &action.reason.to_string(),
                    );
                    tick.launched += instance_ids.len() as u32;
                    if matches!(action.reason, LaunchReason::OverProvision { .. }) {
                        for id in &instance_ids {
                            self.table.mark_buffer(id.as_str());
                        }
                    }
                    self.in_flight
                        .extend(instance_ids.into_iter().map(|instance_id| InFlightLaunch {
                            instance_id,
                            instance_type: action.instance_type.clone(),
                            requested_at: now,
                        }));
                }
                Err(e) => {
                    self.logger
                        .log_scale_up_failed(&action.instance_type, action.count, &e.to_string());
                    self.backoff
                        .record_failure(&action.instance_type, now, self.config.launch_backoff());
                    failed_types.push(action.instance_type.clone());
                    failures.push(format!("launch {} x {}: {}", action.count, action.instance_type, e));
                }
            }
        }

        self.counters.launched += u64::from(tick.launched);
        self.metrics.add_instances_launched(u64::from(tick.launched));
        if failures.is_empty() {
            self.health.set_healthy(Collaborator::Provisioner, now).await;
        } else {
            self.health
                .set_degraded(Collaborator::Provisioner, failures.join("; "), failed_types, now)
                .await;
            tick.errors.extend(failures);
        }
    }

    async fn begin_drains(
        &mut self,
        actions: &[DrainAction],
        tick: &mut TickReport,
        now: DateTime<Utc>,
    ) {
        if actions.is_empty() {
            return;
        }

        let drains = &self.drains;
        let results = join_all(actions.iter().map(|action| drains.begin(action, now))).await;

        for (action, result) in actions.iter().zip(results) {
            tick.plan.push(ScalingAction::Drain(action.clone()));
            match result {
                Ok(record) => {
                    self.table.start_drain(record);
                    self.metrics.inc_drains_started();
                    tick.drains_started += 1;
                }
                Err(e) => {
                    warn!(node = %action.node_id, error = %e, "Cordon failed, node left schedulable");
                    tick.errors.push(format!("cordon {}: {}", action.node_id, e));
                }
            }
        }
    }

    async fn advance_drains(
        &mut self,
        snapshot: &ClusterStateSnapshot,
        tick: &mut TickReport,
        now: DateTime<Utc>,
    ) {
        let coordinator = &self.drains;
        let advanced = join_all(self.table.drains_mut().map(|record| async move {
            let steps = coordinator.advance(record, snapshot, now).await;
            (
                steps,
                record.node_id.clone(),
                record.instance_id.clone(),
                record.forced,
                record.last_error.clone(),
            )
        }))
        .await;

        for (steps, node_id, instance_id, forced, last_error) in advanced {
            for (from, to) in steps {
                match to {
                    DrainState::Drained => {
                        self.counters.drained += 1;
                        if forced {
                            self.metrics.inc_drains_forced();
                        }
                    }
                    DrainState::Terminating => tick.plan.push(ScalingAction::Terminate {
                        node_id: node_id.clone(),
                        instance_id: instance_id.clone(),
                    }),
                    DrainState::Terminated => {
                        self.counters.terminated += 1;
                        self.metrics.inc_instances_terminated();
                    }
                    DrainState::Failed => {
                        self.metrics.inc_drains_failed();
                        if let Some(error) = &last_error {
                            tick.errors.push(format!("drain {}: {}", node_id, error));
                        }
                    }
                    DrainState::Cordoned | DrainState::Evicting => {}
                }
                tick.transitions.push(DrainTransition {
                    node_id: node_id.clone(),
                    from,
                    to,
                });
            }
        }

        let failed: Vec<String> = self
            .table
            .drains()
            .filter(|r| r.state == DrainState::Failed)
            .map(|r| r.node_id.clone())
            .collect();
        if failed.is_empty() {
            self.health.set_healthy(Collaborator::Drain, now).await;
        } else {
            self.health
                .set_degraded(
                    Collaborator::Drain,
                    format!("{} drains failed, nodes left cordoned", failed.len()),
                    failed,
                    now,
                )
                .await;
        }
    }

    async fn publish(&self, report: &CapacityReport, tick: &TickReport, now: DateTime<Utc>) {
        let status = {
            let mut status = self.status.write().await;
            status.cluster_id = self.config.cluster_id.clone();
            status.policy = self.policy.name().to_string();
            status.last_tick_at = Some(now);
            if !tick.errors.is_empty() {
                status.last_error = Some(StatusError {
                    at: now,
                    message: tick.errors.join("; "),
                });
            }
            status.nodes = self
                .table
                .drains()
                .map(|record| (record.node_id.clone(), NodeDrainStatus::from(record)))
                .collect();
            status.launched_total = self.counters.launched;
            status.drained_total = self.counters.drained;
            status.terminated_total = self.counters.terminated;
            status.last_actions = tick.plan.describe();
            status.fleet_size = report.fleet_size;
            status.in_flight = self.in_flight.len();
            let pending = report.total_pending();
            status.pending_cpu_millis = pending.cpu_millis;
            status.pending_memory_bytes = pending.memory_bytes;
            status.hourly_cost = report.hourly_cost;
            status.launch_backoff = self
                .backoff
                .entries()
                .map(|(name, until)| (name.to_string(), until))
                .collect();
            status.clone()
        };
        self.persist(&status, now).await;
    }

    async fn record_failure(&self, error: &StateFetchError, now: DateTime<Utc>) {
        let message = error.to_string();
        self.metrics.inc_tick_errors();
        self.logger.log_tick_failed(&message);
        self.health
            .set_unhealthy(Collaborator::Snapshot, message.clone(), now)
            .await;

        let status = {
            let mut status = self.status.write().await;
            status.last_error = Some(StatusError { at: now, message });
            status.clone()
        };
        self.persist(&status, now).await;
    }

    async fn persist(&self, status: &ScalerStatus, now: DateTime<Utc>) {
        let limit = self.config.call_timeout();
        let result = retry_with_backoff(
            &self.config.retry_policy(),
            "patch_status",
            OrchestratorError::is_transient,
            || {
                bounded(limit, self.orchestrator.patch_status(status), |timeout| {
                    OrchestratorError::Timeout {
                        operation: "patch_status",
                        timeout,
                    }
                })
            },
        )
        .await;

        match result {
            Ok(()) => self.health.set_healthy(Collaborator::Status, now).await,
            Err(e) => {
                warn!(error = %e, "Failed to persist status");
                self.health
                    .set_degraded(Collaborator::Status, e.to_string(), Vec::new(), now)
                    .await;
            }
        }
    }
}

/// Builder for the reconciliation loop
#[derive(Default)]
pub struct ReconcilerBuilder {
    orchestrator: Option<Arc<dyn Orchestrator>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    config: ScalerConfig,
    health: Option<HealthRegistry>,
    status: Option<StatusHandle>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(mut self, config: ScalerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a health registry with the HTTP API
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Share a status handle with the HTTP API
    pub fn status(mut self, status: StatusHandle) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Result<Reconciler, ConfigError> {
        let orchestrator = self
            .orchestrator
            .ok_or(ConfigError::Missing("orchestrator"))?;
        let provisioner = self.provisioner.ok_or(ConfigError::Missing("provisioner"))?;
        self.config.validate()?;

        let logger = StructuredLogger::new(self.config.cluster_id.clone());
        let policy = ScalingPolicy::from_config(&self.config);
        let drains = DrainCoordinator::new(
            orchestrator.clone(),
            provisioner.clone(),
            DrainSettings::from_config(&self.config),
            logger.clone(),
        );
        let status = self.status.unwrap_or_else(|| {
            ScalerStatus::new(self.config.cluster_id.clone(), policy.name()).handle()
        });

        Ok(Reconciler {
            orchestrator,
            provisioner,
            config: self.config,
            table: NodeTable::default(),
            in_flight: Vec::new(),
            backoff: LaunchBackoff::default(),
            policy,
            drains,
            counters: Counters::default(),
            metrics: ScalerMetrics::new(),
            logger,
            health: self.health.unwrap_or_default(),
            status,
        })
    }
}
