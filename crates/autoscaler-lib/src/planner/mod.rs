//! Scaling decisions
//!
//! Planners are pure functions over a capacity report. They return the
//! actions they want taken and never apply anything themselves.

pub mod policy;
pub mod scale_down;
pub mod scale_up;

pub use policy::{GrowthTracker, ScalingPolicy, Trend};
pub use scale_down::{velocity_cap, DrainAction, DrainReason};
pub use scale_up::{LaunchAction, LaunchBackoff, LaunchReason};

use serde::Serialize;
use std::fmt;

/// A single step the loop will take this tick
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingAction {
    Launch(LaunchAction),
    Drain(DrainAction),
    Terminate { node_id: String, instance_id: String },
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::Launch(launch) => write!(
                f,
                "launch {} x {} ({})",
                launch.count, launch.instance_type, launch.reason
            ),
            ScalingAction::Drain(drain) => {
                write!(f, "drain {} ({})", drain.node_id, drain.reason)
            }
            ScalingAction::Terminate {
                node_id,
                instance_id,
            } => write!(f, "terminate {} (node {})", instance_id, node_id),
        }
    }
}

/// Ordered actions computed for one tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalingPlan {
    pub actions: Vec<ScalingAction>,
}

impl ScalingPlan {
    pub fn push(&mut self, action: ScalingAction) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn launches(&self) -> impl Iterator<Item = &LaunchAction> {
        self.actions.iter().filter_map(|a| match a {
            ScalingAction::Launch(launch) => Some(launch),
            _ => None,
        })
    }

    pub fn drains(&self) -> impl Iterator<Item = &DrainAction> {
        self.actions.iter().filter_map(|a| match a {
            ScalingAction::Drain(drain) => Some(drain),
            _ => None,
        })
    }

    /// Human-readable rendering for status
    pub fn describe(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.to_string()).collect()
    }
}
