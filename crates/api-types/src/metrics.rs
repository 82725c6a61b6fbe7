//! Autoscaler metric sources.
//!
//! Models the cluster API's MetricSpec variants used by horizontal
//! autoscalers: built-in resource metrics (cpu/memory) and custom per-pod
//! metrics. Each source has two projections: the wire shape expected by the
//! `autoscaling/v2` API and a reduced marker shape for façade clients.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

/// Metric name carried by the per-instance memory pod metric.
pub const MEMORY_METRIC_NAME: &str = "plt_svc_memory_use";

/// The unit a metric's target value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Ms,
    Bytes,
    Percent,
}

/// Target mode of a resource metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetMode {
    Utilization,
    AverageValue,
    Value,
}

/// A metric source for a horizontal autoscaler.
///
/// `Resource` targets a built-in resource (cpu/memory); `Pod` targets a
/// named custom metric, optionally scoped by a label selector, with an
/// average-value target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricSource {
    Resource {
        id: String,
        name: String,
        mode: TargetMode,
        value: i64,
        unit: ValueKind,
    },
    Pod {
        id: String,
        name: String,
        query: String,
        selector: BTreeMap<String, String>,
        value: i64,
        unit: ValueKind,
    },
}

/// Reduced caller-facing projection of a metric source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricMarker {
    pub id: String,
    pub name: String,
    pub target_value: i64,
    pub target_type: ValueKind,
}

/// Encode a value as a milli-quantity string, scaling by a unit-specific
/// factor first: milliseconds map 1:1, bytes scale by 1000, percentages by
/// 10.
pub fn value_to_quantity(value: i64, unit: ValueKind) -> String {
    match unit {
        ValueKind::Ms => format!("{value}m"),
        ValueKind::Bytes => format!("{}m", value * 1000),
        ValueKind::Percent => format!("{}m", value * 10),
    }
}

impl MetricSource {
    pub fn resource(
        id: impl Into<String>,
        name: impl Into<String>,
        mode: TargetMode,
        value: i64,
        unit: ValueKind,
    ) -> Self {
        Self::Resource {
            id: id.into(),
            name: name.into(),
            mode,
            value,
            unit,
        }
    }

    pub fn pod(
        id: impl Into<String>,
        name: impl Into<String>,
        query: impl Into<String>,
        value: i64,
        unit: ValueKind,
    ) -> Self {
        Self::Pod {
            id: id.into(),
            name: name.into(),
            query: query.into(),
            selector: BTreeMap::new(),
            value,
            unit,
        }
    }

    pub fn with_selector(mut self, labels: BTreeMap<String, String>) -> Self {
        if let Self::Pod { selector, .. } = &mut self {
            *selector = labels;
        }
        self
    }

    /// Project to the `autoscaling/v2` metric-spec wire shape.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Resource {
                name,
                mode,
                value,
                unit,
                ..
            } => {
                let target = match mode {
                    TargetMode::Utilization => json!({
                        "type": "Utilization",
                        "averageUtilization": value,
                    }),
                    TargetMode::AverageValue => json!({
                        "type": "AverageValue",
                        "averageValue": value_to_quantity(*value, *unit),
                    }),
                    TargetMode::Value => json!({
                        "type": "Value",
                        "value": value_to_quantity(*value, *unit),
                    }),
                };
                json!({
                    "type": "Resource",
                    "resource": {
                        "name": name.to_lowercase(),
                        "target": target,
                    }
                })
            }
            Self::Pod {
                query,
                selector,
                value,
                unit,
                ..
            } => {
                let mut metric = json!({ "name": query });
                if !selector.is_empty() {
                    metric["selector"] = json!({ "matchLabels": selector });
                }
                json!({
                    "type": "Pods",
                    "pods": {
                        "metric": metric,
                        "target": {
                            "type": "AverageValue",
                            "averageValue": value_to_quantity(*value, *unit),
                        }
                    }
                })
            }
        }
    }

    /// Project to the reduced marker shape, independent of wire encoding.
    pub fn to_marker(&self) -> MetricMarker {
        let (id, name, value, unit) = match self {
            Self::Resource {
                id,
                name,
                value,
                unit,
                ..
            }
            | Self::Pod {
                id,
                name,
                value,
                unit,
                ..
            } => (id, name, value, unit),
        };
        MetricMarker {
            id: id.clone(),
            name: name.clone(),
            target_value: *value,
            target_type: *unit,
        }
    }
}

/// Recover the per-instance memory metric source from a fetched HPA spec,
/// inverting the milli-quantity byte encoding.
pub fn parse_memory_metric(hpa_spec: &Value) -> Option<MetricSource> {
    let metrics = hpa_spec.get("metrics")?.as_array()?;
    let entry = metrics
        .iter()
        .find(|m| m["pods"]["metric"]["name"] == MEMORY_METRIC_NAME)?;

    let average_value = entry["pods"]["target"]["averageValue"].as_str()?;
    let milli = average_value.strip_suffix('m')?.parse::<i64>().ok()?;

    Some(MetricSource::pod(
        "memory",
        "Memory",
        MEMORY_METRIC_NAME,
        milli / 1000,
        ValueKind::Bytes,
    ))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn resource_utilization_wire_format() {
        let source =
            MetricSource::resource("memory", "Memory", TargetMode::Utilization, 98, ValueKind::Percent);

        assert_eq!(
            source.to_wire(),
            json!({
                "type": "Resource",
                "resource": {
                    "name": "memory",
                    "target": { "type": "Utilization", "averageUtilization": 98 }
                }
            })
        );
    }

    #[test]
    fn resource_marker_format() {
        let source =
            MetricSource::resource("memory", "Memory", TargetMode::Utilization, 98, ValueKind::Percent);

        assert_eq!(
            serde_json::to_value(source.to_marker()).unwrap(),
            json!({
                "id": "memory",
                "name": "Memory",
                "targetValue": 98,
                "targetType": "percent"
            })
        );
    }

    #[test]
    fn resource_average_value_emits_milli_quantity() {
        let source =
            MetricSource::resource("cpu", "CPU", TargetMode::AverageValue, 42, ValueKind::Percent);

        assert_eq!(
            source.to_wire()["resource"]["target"],
            json!({ "type": "AverageValue", "averageValue": "420m" })
        );
    }

    #[test]
    fn pod_metric_wire_format_without_selector() {
        let source = MetricSource::pod(
            "requests",
            "Request Latency",
            "plt_svc_request_latency",
            750,
            ValueKind::Ms,
        );

        assert_eq!(
            source.to_wire(),
            json!({
                "type": "Pods",
                "pods": {
                    "metric": { "name": "plt_svc_request_latency" },
                    "target": { "type": "AverageValue", "averageValue": "750m" }
                }
            })
        );
    }

    #[test]
    fn pod_metric_selector_is_included_when_present() {
        let mut labels = BTreeMap::new();
        labels.insert("instance".to_string(), "plt-46d1bb7e".to_string());

        let source = MetricSource::pod("memory", "Memory", MEMORY_METRIC_NAME, 1024, ValueKind::Bytes)
            .with_selector(labels);

        assert_eq!(
            source.to_wire()["pods"]["metric"]["selector"],
            json!({ "matchLabels": { "instance": "plt-46d1bb7e" } })
        );
    }

    #[test]
    fn quantity_encoding_scales_per_unit() {
        assert_eq!(value_to_quantity(750, ValueKind::Ms), "750m");
        assert_eq!(value_to_quantity(1024, ValueKind::Bytes), "1024000m");
        assert_eq!(value_to_quantity(98, ValueKind::Percent), "980m");
    }

    #[test]
    fn memory_metric_round_trips_through_the_wire_shape() {
        let source =
            MetricSource::pod("memory", "Memory", MEMORY_METRIC_NAME, 1207959552, ValueKind::Bytes);
        let spec = json!({ "metrics": [source.to_wire()] });

        let recovered = parse_memory_metric(&spec).unwrap();
        assert_eq!(recovered.to_marker(), source.to_marker());
    }

    #[test]
    fn parse_memory_metric_ignores_other_metrics() {
        let spec = json!({
            "metrics": [
                { "type": "Resource", "resource": { "name": "cpu" } },
                { "type": "Pods", "pods": { "metric": { "name": "other" } } }
            ]
        });
        assert!(parse_memory_metric(&spec).is_none());
    }
}
