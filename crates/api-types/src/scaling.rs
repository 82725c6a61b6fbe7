//! Autoscaler rule sets.
//!
//! A rule set bundles the scale-up/scale-down behaviour policies, the
//! replica bounds, and the ordered list of metric sources applied to a
//! horizontal autoscaler. One process-wide default rule set exists; it is an
//! immutable template that callers clone before appending request-specific
//! metrics.

use serde::Deserialize;
use serde::Serialize;

use crate::metrics::MetricMarker;
use crate::metrics::MetricSource;
use crate::metrics::TargetMode;
use crate::metrics::ValueKind;

/// One direction of a scaling behaviour policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBehaviour {
    /// Maximum percentage of pods added/removed within one period.
    pub percent_of_pods: u32,
    /// Policy period in seconds.
    pub period: u32,
    /// Stabilization window in seconds.
    pub stabilization: u32,
}

/// Replica bounds of an autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicaBounds {
    pub min: i32,
    pub max: i32,
}

/// The full rule set applied when creating or reading an autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaRuleSet {
    pub up: ScalingBehaviour,
    pub down: ScalingBehaviour,
    pub replicas: ReplicaBounds,
    pub metrics: Vec<MetricSource>,
}

impl Default for HpaRuleSet {
    fn default() -> Self {
        Self {
            up: ScalingBehaviour {
                percent_of_pods: 100,
                period: 15,
                stabilization: 0,
            },
            down: ScalingBehaviour {
                percent_of_pods: 50,
                period: 60,
                stabilization: 300,
            },
            replicas: ReplicaBounds { min: 1, max: 10 },
            metrics: vec![MetricSource::resource(
                "cpu",
                "CPU",
                TargetMode::Utilization,
                80,
                ValueKind::Percent,
            )],
        }
    }
}

/// Behaviour pair as served to façade clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BehaviourView {
    pub up: ScalingBehaviour,
    pub down: ScalingBehaviour,
}

/// Caller-facing view of an autoscaler: behaviours, bounds, and metric
/// markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HpaView {
    pub behaviours: BehaviourView,
    pub replicas: ReplicaBounds,
    pub metrics: Vec<MetricMarker>,
}

impl HpaRuleSet {
    /// Build the caller-facing view: this rule set's behaviours, the given
    /// bounds, and the markers of this rule set's metrics plus any extras.
    pub fn view(&self, replicas: ReplicaBounds, extra_metrics: &[MetricSource]) -> HpaView {
        let metrics = self
            .metrics
            .iter()
            .chain(extra_metrics)
            .map(MetricSource::to_marker)
            .collect();

        HpaView {
            behaviours: BehaviourView {
                up: self.up,
                down: self.down,
            },
            replicas,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_set_carries_a_cpu_utilization_metric() {
        let defaults = HpaRuleSet::default();
        assert_eq!(defaults.metrics.len(), 1);
        assert_eq!(defaults.metrics[0].to_marker().id, "cpu");
    }

    #[test]
    fn view_appends_extras_without_touching_the_template() {
        let defaults = HpaRuleSet::default();
        let extra = MetricSource::pod("memory", "Memory", "plt_svc_memory_use", 512, ValueKind::Bytes);

        let view = defaults.view(ReplicaBounds { min: 2, max: 8 }, &[extra]);

        assert_eq!(view.metrics.len(), 2);
        assert_eq!(view.metrics[1].id, "memory");
        assert_eq!(view.replicas, ReplicaBounds { min: 2, max: 8 });
        // The template itself must not grow across calls.
        assert_eq!(defaults.metrics.len(), 1);
    }
}
