//! Scale-down policy strategies
//!
//! `IdleBased` only ever removes strictly idle nodes. `GrowthBased` keeps a
//! trailing window of aggregate demand samples and, once the window shows
//! demand flat or shrinking, also admits under-utilized nodes.

use crate::capacity::CapacityReport;
use crate::config::{PolicyKind, ScalerConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::info;

/// Minimum samples before a trend is reported
const MIN_SAMPLES_FOR_TREND: usize = 3;

/// Demand trend over the trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Not enough history yet
    Warming,
    Growing,
    /// Flat or shrinking
    Steady,
}

/// Rolling demand history with a trend state machine
#[derive(Debug, Clone)]
pub struct GrowthTracker {
    window: Duration,
    tolerance: f64,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    state: Trend,
}

impl GrowthTracker {
    pub fn new(window: Duration, tolerance: f64) -> Self {
        Self {
            window,
            tolerance,
            samples: VecDeque::new(),
            state: Trend::Warming,
        }
    }

    pub fn state(&self) -> Trend {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record a demand sample and re-evaluate the trend
    pub fn observe(&mut self, now: DateTime<Utc>, demand: f64) -> Trend {
        self.expire_old_samples(now);
        self.samples.push_back((now, demand));

        let next = self.evaluate();
        if next != self.state {
            info!(
                from = ?self.state,
                to = ?next,
                samples = self.samples.len(),
                "Demand trend changed"
            );
            self.state = next;
        }
        self.state
    }

    fn expire_old_samples(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return;
        };
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate(&self) -> Trend {
        if self.samples.len() < MIN_SAMPLES_FOR_TREND {
            return Trend::Warming;
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return Trend::Warming;
        };
        let span = crate::capacity::elapsed(last.0, first.0);
        if span < self.window / 2 {
            return Trend::Warming;
        }

        let split = self.samples.len() / 2;
        let older = self.samples.iter().take(split).map(|s| s.1).sum::<f64>() / split as f64;
        let newer = self.samples.iter().skip(split).map(|s| s.1).sum::<f64>()
            / (self.samples.len() - split) as f64;

        let growing = if older <= 0.0 {
            newer > 0.0
        } else {
            newer > older * (1.0 + self.tolerance)
        };
        if growing {
            Trend::Growing
        } else {
            Trend::Steady
        }
    }
}

/// Scale-down strategy selected by configuration
#[derive(Debug, Clone)]
pub enum ScalingPolicy {
    IdleBased,
    GrowthBased(GrowthTracker),
}

impl ScalingPolicy {
    pub fn from_config(config: &ScalerConfig) -> Self {
        match config.scaling_policy {
            PolicyKind::IdleBased => ScalingPolicy::IdleBased,
            PolicyKind::GrowthBased => ScalingPolicy::GrowthBased(GrowthTracker::new(
                config.growth_window(),
                config.growth_tolerance,
            )),
        }
    }

    /// Feed the tick's aggregate demand into the policy state
    pub fn observe(&mut self, report: &CapacityReport, now: DateTime<Utc>) {
        if let ScalingPolicy::GrowthBased(tracker) = self {
            tracker.observe(now, report.total_demand().cpu_millis as f64);
        }
    }

    /// Whether partially loaded nodes may be drained this tick
    pub fn allows_underutilized(&self) -> bool {
        matches!(self, ScalingPolicy::GrowthBased(t) if t.state() == Trend::Steady)
    }

    pub fn trend(&self) -> Option<Trend> {
        match self {
            ScalingPolicy::IdleBased => None,
            ScalingPolicy::GrowthBased(tracker) => Some(tracker.state()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalingPolicy::IdleBased => PolicyKind::IdleBased.as_str(),
            ScalingPolicy::GrowthBased(_) => PolicyKind::GrowthBased.as_str(),
        }
    }

    #[cfg(test)]
    pub(crate) fn steady_for_test() -> Self {
        let mut tracker = GrowthTracker::new(Duration::from_secs(60), 0.05);
        tracker.state = Trend::Steady;
        ScalingPolicy::GrowthBased(tracker)
    }
}
