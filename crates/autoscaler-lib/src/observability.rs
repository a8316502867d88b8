//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - Prometheus metrics (tick latency, launches, drains, fleet size, pending demand)
//! - Structured JSON logging with tracing

use crate::drain::DrainState;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for tick latency (in seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    tick_latency_seconds: Histogram,
    tick_errors: IntCounter,
    instances_launched: IntCounter,
    drains_started: IntCounter,
    drains_failed: IntCounter,
    drains_forced: IntCounter,
    instances_terminated: IntCounter,
    fleet_size: IntGauge,
    pending_cpu_millis: IntGauge,
    pending_memory_bytes: IntGauge,
    drain_nodes: IntGaugeVec,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "fleet_autoscaler_tick_latency_seconds",
                "Time spent in one reconciliation tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            tick_errors: register_int_counter!(
                "fleet_autoscaler_tick_errors_total",
                "Ticks skipped because the cluster snapshot could not be captured"
            )
            .expect("Failed to register tick_errors"),

            instances_launched: register_int_counter!(
                "fleet_autoscaler_instances_launched_total",
                "Instances requested from the provisioner"
            )
            .expect("Failed to register instances_launched"),

            drains_started: register_int_counter!(
                "fleet_autoscaler_drains_started_total",
                "Nodes cordoned for removal"
            )
            .expect("Failed to register drains_started"),

            drains_failed: register_int_counter!(
                "fleet_autoscaler_drains_failed_total",
                "Drains that ended in the failed state"
            )
            .expect("Failed to register drains_failed"),

            drains_forced: register_int_counter!(
                "fleet_autoscaler_drains_forced_total",
                "Drains completed by overriding blocked evictions"
            )
            .expect("Failed to register drains_forced"),

            instances_terminated: register_int_counter!(
                "fleet_autoscaler_instances_terminated_total",
                "Instances confirmed terminated after drain"
            )
            .expect("Failed to register instances_terminated"),

            fleet_size: register_int_gauge!(
                "fleet_autoscaler_fleet_size",
                "Nodes currently in the managed fleet"
            )
            .expect("Failed to register fleet_size"),

            pending_cpu_millis: register_int_gauge!(
                "fleet_autoscaler_pending_cpu_millis",
                "CPU requested by pods that fit on no node"
            )
            .expect("Failed to register pending_cpu_millis"),

            pending_memory_bytes: register_int_gauge!(
                "fleet_autoscaler_pending_memory_bytes",
                "Memory requested by pods that fit on no node"
            )
            .expect("Failed to register pending_memory_bytes"),

            drain_nodes: register_int_gauge_vec!(
                "fleet_autoscaler_drain_nodes",
                "Tracked drains by state",
                &["state"]
            )
            .expect("Failed to register drain_nodes"),
        }
    }
}

/// Autoscaler metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_tick_errors(&self) {
        self.inner().tick_errors.inc();
    }

    pub fn add_instances_launched(&self, count: u64) {
        self.inner().instances_launched.inc_by(count);
    }

    pub fn inc_drains_started(&self) {
        self.inner().drains_started.inc();
    }

    pub fn inc_drains_failed(&self) {
        self.inner().drains_failed.inc();
    }

    pub fn inc_drains_forced(&self) {
        self.inner().drains_forced.inc();
    }

    pub fn inc_instances_terminated(&self) {
        self.inner().instances_terminated.inc();
    }

    pub fn set_fleet_size(&self, nodes: usize) {
        self.inner().fleet_size.set(nodes as i64);
    }

    pub fn set_pending(&self, cpu_millis: u64, memory_bytes: u64) {
        self.inner().pending_cpu_millis.set(cpu_millis as i64);
        self.inner().pending_memory_bytes.set(memory_bytes as i64);
    }

    /// Replace the per-state drain counts
    pub fn set_drain_states(&self, counts: &[(DrainState, usize)]) {
        self.inner().drain_nodes.reset();
        for (state, count) in counts {
            self.inner()
                .drain_nodes
                .with_label_values(&[state.as_str()])
                .set(*count as i64);
        }
    }
}

/// Structured logger for scaling events
///
/// Provides consistent JSON-formatted logging for launches, drains and
/// tick outcomes.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster_id: String,
}

impl StructuredLogger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str, policy: &str) {
        info!(
            event = "autoscaler_started",
            cluster = %self.cluster_id,
            version = %version,
            policy = %policy,
            "Fleet autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            cluster = %self.cluster_id,
            reason = %reason,
            "Fleet autoscaler shutting down"
        );
    }

    /// Log a launch request and its outcome
    pub fn log_scale_up(
        &self,
        instance_type: &str,
        requested: u32,
        instance_ids: &[String],
        reason: &str,
    ) {
        info!(
            event = "scale_up",
            cluster = %self.cluster_id,
            instance_type = %instance_type,
            requested = requested,
            launched = instance_ids.len(),
            instance_ids = ?instance_ids,
            reason = %reason,
            "Launched instances"
        );
    }

    pub fn log_scale_up_failed(&self, instance_type: &str, requested: u32, error: &str) {
        warn!(
            event = "scale_up_failed",
            cluster = %self.cluster_id,
            instance_type = %instance_type,
            requested = requested,
            error = %error,
            "Instance launch failed"
        );
    }

    pub fn log_drain_started(&self, node_id: &str, instance_type: &str, reason: &str) {
        info!(
            event = "drain_started",
            cluster = %self.cluster_id,
            node = %node_id,
            instance_type = %instance_type,
            reason = %reason,
            "Node cordoned for removal"
        );
    }

    pub fn log_drain_transition(&self, node_id: &str, from: DrainState, to: DrainState) {
        info!(
            event = "drain_transition",
            cluster = %self.cluster_id,
            node = %node_id,
            from = %from.as_str(),
            to = %to.as_str(),
            "Drain state changed"
        );
    }

    pub fn log_drain_blocked(&self, node_id: &str, blocked_pods: &[String]) {
        warn!(
            event = "drain_blocked",
            cluster = %self.cluster_id,
            node = %node_id,
            blocked_pods = ?blocked_pods,
            "Evictions refused by disruption budget, will retry"
        );
    }

    pub fn log_drain_forced(&self, node_id: &str, blocked_pods: &[String], blocked_secs: u64) {
        warn!(
            event = "drain_forced",
            cluster = %self.cluster_id,
            node = %node_id,
            blocked_pods = ?blocked_pods,
            blocked_secs = blocked_secs,
            "Force-completing drain, remaining pods will be lost with the node"
        );
    }

    pub fn log_drain_failed(&self, node_id: &str, error: &str) {
        error!(
            event = "drain_failed",
            cluster = %self.cluster_id,
            node = %node_id,
            error = %error,
            "Drain failed, node left cordoned for operator attention"
        );
    }

    pub fn log_tick_failed(&self, error: &str) {
        warn!(
            event = "tick_failed",
            cluster = %self.cluster_id,
            error = %error,
            "Tick skipped, cluster state unavailable"
        );
    }

    pub fn log_tick_complete(
        &self,
        fleet_size: usize,
        launched: u32,
        drains_started: usize,
        transitions: usize,
        duration_ms: u128,
    ) {
        info!(
            event = "tick_complete",
            cluster = %self.cluster_id,
            fleet_size = fleet_size,
            launched = launched,
            drains_started = drains_started,
            transitions = transitions,
            duration_ms = duration_ms,
            "Reconciliation tick complete"
        );
    }
}
