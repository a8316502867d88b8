//! Scale-up planning

use crate::capacity::CapacityReport;
use crate::config::ScalerConfig;
use crate::models::Resources;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Share of `max_cost_per_hour` the projected run rate may reach
pub const SPEND_CAP_FRACTION: f64 = 0.75;

/// Why a launch was planned
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchReason {
    /// Pods that fit on no existing node
    PendingDemand { requests: Resources, pods: usize },
    /// Spare capacity below the over-provision target
    OverProvision { deficit: Resources },
}

impl fmt::Display for LaunchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchReason::PendingDemand { requests, pods } => {
                write!(f, "pending demand of {} across {} pods", requests, pods)
            }
            LaunchReason::OverProvision { deficit } => {
                write!(f, "over-provision buffer short by {}", deficit)
            }
        }
    }
}

/// Request to launch `count` instances of one type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchAction {
    pub instance_type: String,
    pub count: u32,
    pub reason: LaunchReason,
}

/// Instance types whose recent launches failed or never registered, with
/// the time launches of each may resume
#[derive(Debug, Clone, Default)]
pub struct LaunchBackoff {
    until: BTreeMap<String, DateTime<Utc>>,
}

impl LaunchBackoff {
    /// Skip `instance_type` for `period` from `now`. A zero period does nothing.
    pub fn record_failure(&mut self, instance_type: &str, now: DateTime<Utc>, period: Duration) {
        if period.is_zero() {
            return;
        }
        let Ok(period) = chrono::Duration::from_std(period) else {
            return;
        };
        let until = now + period;
        let entry = self.until.entry(instance_type.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        info!(
            instance_type = %instance_type,
            until = %until,
            "Instance type backed off after failed launch"
        );
    }

    pub fn is_backed_off(&self, instance_type: &str, now: DateTime<Utc>) -> bool {
        self.until
            .get(instance_type)
            .is_some_and(|until| now < *until)
    }

    /// Forget back-offs that have run out
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.until.retain(|_, until| now < *until);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.until.iter().map(|(name, until)| (name.as_str(), *until))
    }
}

struct LaunchBudget<'a> {
    report: &'a CapacityReport,
    backoff: &'a LaunchBackoff,
    remaining: u32,
    /// Projected hourly run rate may not pass this
    spend_limit: Option<f64>,
    spend: f64,
    planned: BTreeMap<String, u32>,
    actions: Vec<LaunchAction>,
}

impl<'a> LaunchBudget<'a> {
    /// Instances of a type that may still be added under its max count
    fn headroom(&self, instance_type: &str) -> u32 {
        let Some(max) = self
            .report
            .catalog
            .get(instance_type)
            .and_then(|p| p.max_count)
        else {
            return u32::MAX;
        };
        let existing = self
            .report
            .by_type
            .get(instance_type)
            .map(|t| t.node_count + t.in_flight)
            .unwrap_or(0) as u32;
        let planned = self.planned.get(instance_type).copied().unwrap_or(0);
        max.saturating_sub(existing + planned)
    }

    fn price(&self, instance_type: &str) -> f64 {
        self.report
            .catalog
            .get(instance_type)
            .and_then(|p| p.cost_per_hour)
            .unwrap_or(0.0)
    }

    /// Instances of a type the spend cap still allows
    fn affordable(&self, instance_type: &str) -> u32 {
        let price = self.price(instance_type);
        match self.spend_limit {
            Some(limit) if price > 0.0 => {
                let room = ((limit - self.spend) / price + 1e-9).floor();
                if room <= 0.0 {
                    0
                } else {
                    room.min(u32::MAX as f64) as u32
                }
            }
            _ => u32::MAX,
        }
    }

    fn launch(&mut self, instance_type: &str, wanted: u64, reason: LaunchReason) {
        if self.backoff.is_backed_off(instance_type, self.report.computed_at) {
            debug!(instance_type = %instance_type, "Instance type backed off, launch deferred");
            return;
        }
        let wanted = wanted.min(u32::MAX as u64) as u32;
        let count = wanted
            .min(self.headroom(instance_type))
            .min(self.affordable(instance_type))
            .min(self.remaining);
        if count < wanted {
            warn!(
                instance_type = %instance_type,
                wanted = wanted,
                allowed = count,
                "Launch capped by type maximum, spend cap or per-tick limit"
            );
        }
        if count == 0 {
            return;
        }
        self.remaining -= count;
        self.spend += self.price(instance_type) * f64::from(count);
        *self.planned.entry(instance_type.to_string()).or_default() += count;
        self.actions.push(LaunchAction {
            instance_type: instance_type.to_string(),
            count,
            reason,
        });
    }

    /// Pick a type for untyped demand: it must fit the largest pod and be
    /// launchable now; prefer the type already most common in the fleet, then
    /// the fastest to boot.
    fn choose_type(&self, largest: &Resources) -> Option<String> {
        self.report
            .catalog
            .values()
            .filter(|p| p.usable_capacity(self.report.reserve_fraction).fits(largest))
            .filter(|p| !self.backoff.is_backed_off(&p.name, self.report.computed_at))
            .filter(|p| self.headroom(&p.name) > 0 && self.affordable(&p.name) > 0)
            .min_by_key(|p| {
                (
                    Reverse(self.report.type_count(&p.name)),
                    p.boot_latency_secs,
                    p.name.clone(),
                )
            })
            .map(|p| p.name.clone())
    }
}

/// Plan launches for pending demand and the over-provision buffer.
/// Types in `backoff` are skipped until their back-off runs out.
pub fn plan(
    report: &CapacityReport,
    config: &ScalerConfig,
    backoff: &LaunchBackoff,
) -> Vec<LaunchAction> {
    let spend_limit = config.max_cost_per_hour.map(|max| max * SPEND_CAP_FRACTION);
    if let Some(limit) = spend_limit {
        if report.hourly_cost >= limit {
            warn!(
                hourly_cost = report.hourly_cost,
                limit = limit,
                "Fleet run rate at spend cap, no launches this tick"
            );
        }
    }
    let mut budget = LaunchBudget {
        report,
        backoff,
        remaining: config.max_launch_per_tick,
        spend_limit,
        spend: report.hourly_cost,
        planned: BTreeMap::new(),
        actions: Vec::new(),
    };

    for (instance_type, demand) in &report.typed_demand {
        let Some(unit) = report.usable_per_instance(instance_type) else {
            warn!(
                instance_type = %instance_type,
                pods = demand.pods,
                "Pending pods select an instance type missing from the catalog"
            );
            continue;
        };
        if !unit.fits(&demand.largest) {
            warn!(
                instance_type = %instance_type,
                largest = %demand.largest,
                "Pending pod does not fit its selected instance type"
            );
            continue;
        }
        if let Some(count) = demand.requests.units_of(&unit) {
            budget.launch(
                instance_type,
                count,
                LaunchReason::PendingDemand {
                    requests: demand.requests,
                    pods: demand.pods,
                },
            );
        }
    }

    let untyped = &report.untyped_demand;
    if !untyped.is_empty() {
        match budget.choose_type(&untyped.largest) {
            Some(instance_type) => {
                let count = report
                    .usable_per_instance(&instance_type)
                    .and_then(|unit| untyped.requests.units_of(&unit))
                    .unwrap_or(0);
                budget.launch(
                    &instance_type,
                    count,
                    LaunchReason::PendingDemand {
                        requests: untyped.requests,
                        pods: untyped.pods,
                    },
                );
            }
            None => warn!(
                largest = %untyped.largest,
                pods = untyped.pods,
                "No launchable instance type fits the largest pending pod"
            ),
        }
    }

    if !report.buffer_deficit.is_zero() {
        if let Some(instance_type) = &report.predominant_type {
            let count = report
                .usable_per_instance(instance_type)
                .and_then(|unit| report.buffer_deficit.units_of(&unit))
                .unwrap_or(0);
            budget.launch(
                instance_type,
                count,
                LaunchReason::OverProvision {
                    deficit: report.buffer_deficit,
                },
            );
        }
    }

    debug!(launches = budget.actions.len(), "Scale-up plan computed");
    budget.actions
}
