//! Scaling engine configuration

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_LAUNCH_BACKOFF_SECS: u64 = 86_400;

/// Scale-down policy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Remove strictly idle nodes only
    #[default]
    IdleBased,
    /// Also remove under-utilized nodes while demand is steady or shrinking
    GrowthBased,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::IdleBased => "idle-based",
            PolicyKind::GrowthBased => "growth-based",
        }
    }
}

/// Configuration consumed by the scaling engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Cloud region the fleet lives in
    #[serde(default)]
    pub region: String,

    /// Cloud account the fleet is billed to
    #[serde(default)]
    pub account: String,

    /// Identifier of this fleet; nodes are matched on `cluster_label`
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Node label carrying the cluster identifier
    #[serde(default = "default_cluster_label")]
    pub cluster_label: String,

    /// Fraction of node capacity held back from scheduling
    #[serde(default = "default_reserve_fraction")]
    pub reserve_fraction: f64,

    /// Seconds of continuous idleness before a node may be removed; 0 disables
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Per-instance-type idle threshold overrides; 0 disables removal for the type
    #[serde(default)]
    pub type_idle_threshold_secs: BTreeMap<String, u64>,

    /// Per-instance-type node count ceilings
    #[serde(default)]
    pub type_max_count: BTreeMap<String, u32>,

    /// Per-instance-type hourly prices, overriding the catalog's
    #[serde(default)]
    pub type_cost_per_hour: BTreeMap<String, f64>,

    /// Hourly spend ceiling for the fleet. Launches stop once the projected
    /// run rate reaches three quarters of it.
    #[serde(default)]
    pub max_cost_per_hour: Option<f64>,

    /// Seconds an instance type is skipped after a failed or unregistered
    /// launch; 0 disables the back-off
    #[serde(default = "default_launch_backoff")]
    pub launch_backoff_secs: u64,

    /// Standing spare capacity, in instances of the predominant type
    #[serde(default = "default_over_provision")]
    pub over_provision: f64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Grace period after launch during which a node is never drained
    #[serde(default = "default_instance_init_time")]
    pub instance_init_time_secs: u64,

    /// Highest utilization at which a node may still be drained
    #[serde(default = "default_drain_utilization_threshold")]
    pub drain_utilization_threshold: f64,

    /// Fraction of the fleet that may start draining in one tick
    #[serde(default = "default_max_scale_in_fraction")]
    pub max_scale_in_fraction: f64,

    /// Exclude daemon/infrastructure pods from load and idle accounting
    #[serde(default = "default_true")]
    pub ignore_system_pods: bool,

    /// Namespace whose pods are treated as system pods
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    #[serde(default)]
    pub scaling_policy: PolicyKind,

    /// Trailing window for demand trend detection (growth-based policy)
    #[serde(default = "default_growth_window")]
    pub growth_window_secs: u64,

    /// Relative demand increase over the window that counts as growth
    #[serde(default = "default_growth_tolerance")]
    pub growth_tolerance: f64,

    #[serde(default = "default_max_launch_per_tick")]
    pub max_launch_per_tick: u32,

    /// Upper bound on any single orchestrator or provisioning call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Attempts per call for transient errors, within one tick
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    /// Treat pods still blocking a drain as evicted after this long
    #[serde(default)]
    pub force_drain_after_secs: Option<u64>,

    /// How long a terminated instance may stay registered before the drain fails
    #[serde(default = "default_termination_timeout")]
    pub termination_timeout_secs: u64,
}

fn default_cluster_id() -> String {
    "default".to_string()
}

fn default_cluster_label() -> String {
    "autoscaler.io/cluster".to_string()
}

fn default_reserve_fraction() -> f64 {
    0.1
}

fn default_idle_threshold() -> u64 {
    600
}

fn default_launch_backoff() -> u64 {
    300
}

fn default_over_provision() -> f64 {
    1.0
}

fn default_tick_interval() -> u64 {
    60
}

fn default_instance_init_time() -> u64 {
    600
}

fn default_drain_utilization_threshold() -> f64 {
    0.3
}

fn default_max_scale_in_fraction() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_system_namespace() -> String {
    "kube-system".to_string()
}

fn default_growth_window() -> u64 {
    1800
}

fn default_growth_tolerance() -> f64 {
    0.05
}

fn default_max_launch_per_tick() -> u32 {
    10
}

fn default_call_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_backoff() -> u64 {
    200
}

fn default_termination_timeout() -> u64 {
    900
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            account: String::new(),
            cluster_id: default_cluster_id(),
            cluster_label: default_cluster_label(),
            reserve_fraction: default_reserve_fraction(),
            idle_threshold_secs: default_idle_threshold(),
            type_idle_threshold_secs: BTreeMap::new(),
            type_max_count: BTreeMap::new(),
            type_cost_per_hour: BTreeMap::new(),
            max_cost_per_hour: None,
            launch_backoff_secs: default_launch_backoff(),
            over_provision: default_over_provision(),
            tick_interval_secs: default_tick_interval(),
            instance_init_time_secs: default_instance_init_time(),
            drain_utilization_threshold: default_drain_utilization_threshold(),
            max_scale_in_fraction: default_max_scale_in_fraction(),
            ignore_system_pods: default_true(),
            system_namespace: default_system_namespace(),
            scaling_policy: PolicyKind::default(),
            growth_window_secs: default_growth_window(),
            growth_tolerance: default_growth_tolerance(),
            max_launch_per_tick: default_max_launch_per_tick(),
            call_timeout_secs: default_call_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            force_drain_after_secs: None,
            termination_timeout_secs: default_termination_timeout(),
        }
    }
}

impl ScalerConfig {
    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_id.trim().is_empty() {
            return Err(ConfigError::invalid("cluster_id", "must not be empty"));
        }
        if self.cluster_label.trim().is_empty() {
            return Err(ConfigError::invalid("cluster_label", "must not be empty"));
        }
        if !(0.0..1.0).contains(&self.reserve_fraction) {
            return Err(ConfigError::invalid(
                "reserve_fraction",
                format!("{} is outside [0, 1)", self.reserve_fraction),
            ));
        }
        if !self.over_provision.is_finite() || self.over_provision < 0.0 {
            return Err(ConfigError::invalid(
                "over_provision",
                format!("{} must be a non-negative number", self.over_provision),
            ));
        }
        if !(0.0..=1.0).contains(&self.drain_utilization_threshold) {
            return Err(ConfigError::invalid(
                "drain_utilization_threshold",
                format!("{} is outside [0, 1]", self.drain_utilization_threshold),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_scale_in_fraction) {
            return Err(ConfigError::invalid(
                "max_scale_in_fraction",
                format!("{} is outside [0, 1]", self.max_scale_in_fraction),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::invalid("tick_interval_secs", "must be positive"));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::invalid("call_timeout_secs", "must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::invalid("retry_attempts", "must be at least 1"));
        }
        if self.scaling_policy == PolicyKind::GrowthBased && self.growth_window_secs == 0 {
            return Err(ConfigError::invalid(
                "growth_window_secs",
                "must be positive for the growth-based policy",
            ));
        }
        if !self.growth_tolerance.is_finite() || self.growth_tolerance < 0.0 {
            return Err(ConfigError::invalid(
                "growth_tolerance",
                "must be a non-negative number",
            ));
        }
        if let Some(max) = self.max_cost_per_hour {
            if !max.is_finite() || max <= 0.0 {
                return Err(ConfigError::invalid(
                    "max_cost_per_hour",
                    format!("{} must be a positive number", max),
                ));
            }
        }
        if let Some((name, cost)) = self
            .type_cost_per_hour
            .iter()
            .find(|(_, cost)| !cost.is_finite() || **cost < 0.0)
        {
            return Err(ConfigError::invalid(
                "type_cost_per_hour",
                format!("{name}: {cost} must be a non-negative number"),
            ));
        }
        if self.launch_backoff_secs > MAX_LAUNCH_BACKOFF_SECS {
            return Err(ConfigError::invalid(
                "launch_backoff_secs",
                format!("must be at most {MAX_LAUNCH_BACKOFF_SECS}"),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn instance_init_time(&self) -> Duration {
        Duration::from_secs(self.instance_init_time_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    pub fn force_drain_after(&self) -> Option<Duration> {
        self.force_drain_after_secs.map(Duration::from_secs)
    }

    pub fn launch_backoff(&self) -> Duration {
        Duration::from_secs(self.launch_backoff_secs)
    }

    pub fn growth_window(&self) -> Duration {
        Duration::from_secs(self.growth_window_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ScalerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_reserve_fraction_out_of_range() {
        let config = ScalerConfig {
            reserve_fraction: 1.0,
            ..ScalerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserve_fraction"));
    }

    #[test]
    fn test_growth_policy_requires_window() {
        let config = ScalerConfig {
            scaling_policy: PolicyKind::GrowthBased,
            growth_window_secs: 0,
            ..ScalerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spend_settings_validated() {
        let config = ScalerConfig {
            max_cost_per_hour: Some(0.0),
            ..ScalerConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("max_cost_per_hour"));

        let mut costs = BTreeMap::new();
        costs.insert("m5.xlarge".to_string(), -1.0);
        let config = ScalerConfig {
            type_cost_per_hour: costs,
            ..ScalerConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("m5.xlarge"));

        let config = ScalerConfig {
            launch_backoff_secs: 7 * 86_400,
            ..ScalerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_kind_deserializes_kebab_case() {
        let kind: PolicyKind = serde_json::from_str("\"growth-based\"").unwrap();
        assert_eq!(kind, PolicyKind::GrowthBased);
        assert_eq!(kind.as_str(), "growth-based");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ScalerConfig =
            serde_json::from_str(r#"{"cluster_id": "prod", "max_scale_in_fraction": 0.5}"#).unwrap();
        assert_eq!(config.cluster_id, "prod");
        assert_eq!(config.max_scale_in_fraction, 0.5);
        assert_eq!(config.idle_threshold_secs, 600);
        assert!(config.ignore_system_pods);
    }
}
