//! Collaborator health and readiness
//!
//! The loop reports what it saw of each collaborator every tick: the
//! orchestrator listings behind the snapshot, the provisioner, the drains it
//! is driving and the status write-back. Liveness is the worst collaborator.
//! Readiness follows the last completed tick, so a loop that stopped
//! reconciling stops being ready even if nothing reported a failure.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ticks that may be missed before the loop is considered stalled
pub const STALE_TICKS: u32 = 3;

/// Something the reconciliation loop depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collaborator {
    /// Orchestrator listings and catalog lookups
    Snapshot,
    Provisioner,
    Drain,
    /// Status write-back
    Status,
}

impl Collaborator {
    pub const ALL: [Collaborator; 4] = [
        Collaborator::Snapshot,
        Collaborator::Provisioner,
        Collaborator::Drain,
        Collaborator::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::Snapshot => "snapshot",
            Collaborator::Provisioner => "provisioner",
            Collaborator::Drain => "drain",
            Collaborator::Status => "status",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing intermittently but the loop still makes progress
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Last report for one collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Nodes, instances or instance types the failure concerns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    /// Reports in a row that were not healthy
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_since: Option<DateTime<Utc>>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            subjects: Vec::new(),
            consecutive_failures: 0,
            failing_since: None,
            last_check_timestamp: now.timestamp(),
        }
    }

    /// A failing report carries the failure streak of the previous one
    fn failing(
        previous: Option<&ComponentHealth>,
        status: ComponentStatus,
        message: String,
        mut subjects: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        subjects.sort();
        subjects.dedup();
        let (consecutive_failures, failing_since) = match previous {
            Some(p) if p.status != ComponentStatus::Healthy => (
                p.consecutive_failures.saturating_add(1),
                p.failing_since.or(Some(now)),
            ),
            _ => (1, Some(now)),
        };
        Self {
            status,
            message: Some(message),
            subjects,
            consecutive_failures,
            failing_since,
            last_check_timestamp: now.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status<'a>(
        components: impl IntoIterator<Item = &'a ComponentHealth>,
    ) -> ComponentStatus {
        let mut has_degraded = false;
        for health in components {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }
        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<Collaborator, ComponentHealth>,
    last_tick: Option<DateTime<Utc>>,
}

/// Shared between the loop, which reports, and the API, which reads
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
    stale_after: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::for_tick_interval(std::time::Duration::from_secs(60))
    }

    /// Readiness lapses after `STALE_TICKS` intervals without a completed tick
    pub fn for_tick_interval(interval: std::time::Duration) -> Self {
        let stale_after =
            Duration::from_std(interval.saturating_mul(STALE_TICKS)).unwrap_or(Duration::weeks(1));
        Self {
            state: Arc::new(RwLock::new(HealthState::default())),
            stale_after,
        }
    }

    /// Start tracking a collaborator as healthy unless it already reported
    pub async fn register(&self, collaborator: Collaborator, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state
            .components
            .entry(collaborator)
            .or_insert_with(|| ComponentHealth::healthy(now));
    }

    pub async fn set_healthy(&self, collaborator: Collaborator, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state
            .components
            .insert(collaborator, ComponentHealth::healthy(now));
    }

    /// `subjects` names what is failing, for example node ids with failed
    /// drains or instance types whose launches were refused
    pub async fn set_degraded(
        &self,
        collaborator: Collaborator,
        message: impl Into<String>,
        subjects: Vec<String>,
        now: DateTime<Utc>,
    ) {
        self.report(collaborator, ComponentStatus::Degraded, message.into(), subjects, now)
            .await;
    }

    pub async fn set_unhealthy(
        &self,
        collaborator: Collaborator,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.report(collaborator, ComponentStatus::Unhealthy, message.into(), Vec::new(), now)
            .await;
    }

    async fn report(
        &self,
        collaborator: Collaborator,
        status: ComponentStatus,
        message: String,
        subjects: Vec<String>,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        let health = ComponentHealth::failing(
            state.components.get(&collaborator),
            status,
            message,
            subjects,
            now,
        );
        state.components.insert(collaborator, health);
    }

    /// Mark a reconciliation tick as completed at `now`
    pub async fn record_tick(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.last_tick = Some(state.last_tick.map_or(now, |last| last.max(now)));
    }

    pub async fn component(&self, collaborator: Collaborator) -> Option<ComponentHealth> {
        self.state.read().await.components.get(&collaborator).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: HealthResponse::compute_status(state.components.values()),
            components: state
                .components
                .iter()
                .map(|(c, h)| (c.as_str().to_string(), h.clone()))
                .collect(),
            last_tick_at: state.last_tick,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        self.readiness_at(Utc::now()).await
    }

    /// Ready once a tick has completed recently and no collaborator is
    /// unhealthy
    pub async fn readiness_at(&self, now: DateTime<Utc>) -> ReadinessResponse {
        let state = self.state.read().await;
        let Some(last_tick) = state.last_tick else {
            return ReadinessResponse::not_ready("No reconciliation tick has completed yet");
        };

        let age = now.signed_duration_since(last_tick);
        if age > self.stale_after {
            return ReadinessResponse::not_ready(format!(
                "Last completed tick was {}s ago",
                age.num_seconds()
            ));
        }

        match state
            .components
            .iter()
            .find(|(_, h)| h.status == ComponentStatus::Unhealthy)
        {
            Some((collaborator, health)) => ReadinessResponse::not_ready(format!(
                "{} unhealthy: {}",
                collaborator,
                health.message.as_deref().unwrap_or("no detail")
            )),
            None => ReadinessResponse::ready(),
        }
    }
}
