//! Workload provider façade.
//!
//! Translates domain-level operations (machines, controllers, services,
//! ingress routes, gateways, autoscalers) into cluster API calls and
//! reshapes the raw object graph into the reduced projections from
//! `api_types`. All cluster state is fetched on demand; nothing is cached.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::metrics::parse_memory_metric;
use api_types::metrics::MetricSource;
use api_types::metrics::ValueKind;
use api_types::metrics::MEMORY_METRIC_NAME;
use api_types::quantity::parse_data_quantity;
use api_types::scaling::HpaRuleSet;
use api_types::scaling::HpaView;
use api_types::scaling::ReplicaBounds;
use api_types::scaling::ScalingBehaviour;
use api_types::ControllerGroup;
use api_types::ControllerRef;
use api_types::ControllerView;
use api_types::Machine;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::try_join_all;
use reqwest::Method;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::k8s::client::ApiClient;
use crate::k8s::client::ClientError;
use crate::k8s::client::RequestOptions;
use crate::k8s::resolver::controlling_owner;
use crate::k8s::resolver::resource_path;
use crate::k8s::resolver::ControllerResolver;

const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const GATEWAY_API_ROOT: &str = "/apis/gateway.networking.k8s.io/v1";
const HPA_API_ROOT: &str = "/apis/autoscaling/v2";

/// Fraction of the container memory limit targeted by the per-instance
/// memory metric.
const MEMORY_TARGET_RATIO: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("machine {id} not found")]
    MissingMachine { id: String },
    #[error("autoscaler {id} not found")]
    NonExistentHpa { id: String },
    #[error("a non-empty label selector is required")]
    EmptyLabelSelector,
    #[error("at least one service name is required")]
    EmptyServiceList,
    #[error("cluster API request failed")]
    Cluster,
    #[error("controller resolution failed")]
    Resolution,
    #[error("malformed cluster resource: {message}")]
    Malformed { message: String },
}

/// Domain-level access to the workloads of a cluster.
///
/// Owns the immutable default autoscaler rule set; request-specific metrics
/// are appended to a clone, never to the template itself.
pub struct WorkloadProvider {
    client: Arc<ApiClient>,
    resolver: ControllerResolver,
    rules: HpaRuleSet,
}

impl WorkloadProvider {
    pub fn new(client: Arc<ApiClient>, rules: HpaRuleSet) -> Self {
        let resolver = ControllerResolver::new(client.clone());
        Self {
            client,
            resolver,
            rules,
        }
    }

    /// The immutable default autoscaler rule set.
    pub fn default_rules(&self) -> &HpaRuleSet {
        &self.rules
    }

    /// Fetch one machine, with its root controller attached when the pod
    /// has a controlling owner.
    ///
    /// # Errors
    ///
    /// [`ProviderError::MissingMachine`] when the pod does not exist.
    pub async fn get_pod(&self, namespace: &str, id: &str) -> Result<Machine, Report<ProviderError>> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{id}");
        let pod = self
            .client
            .request(&path, RequestOptions::default())
            .await
            .map_err(|err| tag_missing_machine(err, id))?;

        self.machine_from(namespace, &pod).await
    }

    /// List machines, optionally narrowed by an exact label match.
    ///
    /// Controller resolution fans out per pod; one resolution failure fails
    /// the whole listing.
    pub async fn get_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Machine>, Report<ProviderError>> {
        let mut path = format!("/api/v1/namespaces/{namespace}/pods");
        if !labels.is_empty() {
            path = format!("{path}?labelSelector={}", label_selector(labels));
        }

        let listing = self
            .client
            .request(&path, RequestOptions::default())
            .await
            .change_context(ProviderError::Cluster)?;
        let items = items_of(listing)?;

        try_join_all(items.iter().map(|pod| self.machine_from(namespace, pod))).await
    }

    /// Services whose selector is a subset of the supplied labels. The
    /// filter runs client-side over the full service listing.
    pub async fn get_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, Report<ProviderError>> {
        if labels.is_empty() {
            return Err(Report::new(ProviderError::EmptyLabelSelector));
        }

        let path = format!("/api/v1/namespaces/{namespace}/services");
        let listing = self
            .client
            .request(&path, RequestOptions::default())
            .await
            .change_context(ProviderError::Cluster)?;

        Ok(items_of(listing)?
            .into_iter()
            .filter(|service| selector_matches(&service["spec"]["selector"], labels))
            .collect())
    }

    /// Services matching the labels exactly, filtered server-side.
    pub async fn get_services_by_labels(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, Report<ProviderError>> {
        if labels.is_empty() {
            return Err(Report::new(ProviderError::EmptyLabelSelector));
        }

        let path = format!(
            "/api/v1/namespaces/{namespace}/services?labelSelector={}",
            label_selector(labels)
        );
        let listing = self
            .client
            .request(&path, RequestOptions::default())
            .await
            .change_context(ProviderError::Cluster)?;
        items_of(listing)
    }

    pub async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), Report<ProviderError>> {
        let path = format!("/api/v1/namespaces/{namespace}/services/{name}");
        self.client
            .request(&path, RequestOptions::new(Method::DELETE))
            .await
            .change_context(ProviderError::Cluster)?;
        Ok(())
    }

    /// Ingress rules whose HTTP path backends reference any of the given
    /// service names. A rule is reported once even when several of its paths
    /// match.
    pub async fn get_ingress_routes(
        &self,
        namespace: &str,
        service_names: &[String],
    ) -> Result<Vec<Value>, Report<ProviderError>> {
        if service_names.is_empty() {
            return Err(Report::new(ProviderError::EmptyServiceList));
        }

        let path = format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/ingresses");
        let listing = self
            .client
            .request(&path, RequestOptions::default())
            .await
            .change_context(ProviderError::Cluster)?;

        let mut rules = Vec::new();
        for ingress in items_of(listing)? {
            let Some(spec_rules) = ingress["spec"]["rules"].as_array() else {
                continue;
            };
            for rule in spec_rules {
                if rule_references(rule, service_names) {
                    rules.push(rule.clone());
                }
            }
        }
        Ok(rules)
    }

    /// Group the namespace's machines by their root controller.
    ///
    /// With `pod_id` set, only the group containing that machine is
    /// returned.
    pub async fn get_controllers(
        &self,
        namespace: &str,
        pod_id: Option<&str>,
    ) -> Result<Vec<ControllerGroup>, Report<ProviderError>> {
        let machines = self.get_pods(namespace, &BTreeMap::new()).await?;

        let mut groups: Vec<ControllerGroup> = Vec::new();
        for mut machine in machines {
            let Some(controller) = machine.controller.take() else {
                continue;
            };
            match groups.iter_mut().find(|group| {
                group.controller.kind == controller.kind && group.controller.name == controller.name
            }) {
                Some(group) => group.pods.push(machine),
                None => groups.push(ControllerGroup {
                    controller,
                    pods: vec![machine],
                }),
            }
        }

        if let Some(pod_id) = pod_id {
            groups.retain(|group| group.pods.iter().any(|pod| pod.id == pod_id));
        }
        Ok(groups)
    }

    /// Resolve a controller reference to its root and project it.
    pub async fn get_controller(
        &self,
        namespace: &str,
        controller: &ControllerRef,
    ) -> Result<ControllerView, Report<ProviderError>> {
        let resolved = self
            .resolver
            .resolve(namespace, &controller.name, &controller.api_version, &controller.kind)
            .await
            .change_context(ProviderError::Resolution)?;
        Ok(project_controller(&resolved, &controller.api_version))
    }

    /// Set the replica count of the root controller behind a reference.
    ///
    /// The full resolved object is written back; a stale resourceVersion
    /// surfaces as a cluster conflict error.
    pub async fn update_controller(
        &self,
        namespace: &str,
        controller: &ControllerRef,
        replicas: i64,
    ) -> Result<ControllerView, Report<ProviderError>> {
        let mut resolved = self
            .resolver
            .resolve(namespace, &controller.name, &controller.api_version, &controller.kind)
            .await
            .change_context(ProviderError::Resolution)?;

        let kind = resolved["kind"]
            .as_str()
            .unwrap_or(&controller.kind)
            .to_string();
        let api_version = resolved["apiVersion"]
            .as_str()
            .unwrap_or(&controller.api_version)
            .to_string();
        let name = resolved["metadata"]["name"]
            .as_str()
            .or_else(|| resolved["name"].as_str())
            .unwrap_or(&controller.name)
            .to_string();

        resolved["spec"]["replicas"] = json!(replicas);
        debug!(kind = %kind, name = %name, replicas, "updating controller scale");

        let path = resource_path(namespace, &name, &api_version, &kind);
        let updated = self
            .client
            .request(
                &path,
                RequestOptions::new(Method::PUT).json(resolved),
            )
            .await
            .change_context(ProviderError::Cluster)?;
        Ok(project_controller(&updated, &api_version))
    }

    /// Merge the given labels into a pod's metadata via a strategic merge
    /// patch.
    pub async fn set_machine_labels(
        &self,
        namespace: &str,
        id: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Report<ProviderError>> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{id}");
        let patch = json!({ "metadata": { "labels": labels } });

        self.client
            .request(
                &path,
                RequestOptions::new(Method::PATCH)
                    .json(patch)
                    .content_type(STRATEGIC_MERGE_PATCH),
            )
            .await
            .map_err(|err| tag_missing_machine(err, id))?;
        Ok(())
    }

    pub async fn list_all_gateways(&self) -> Result<Vec<Value>, Report<ProviderError>> {
        let listing = self
            .client
            .request(
                &format!("{GATEWAY_API_ROOT}/gateways"),
                RequestOptions::default(),
            )
            .await
            .change_context(ProviderError::Cluster)?;
        items_of(listing)
    }

    pub async fn list_gateways(&self, namespace: &str) -> Result<Vec<Value>, Report<ProviderError>> {
        let listing = self
            .client
            .request(
                &format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/gateways"),
                RequestOptions::default(),
            )
            .await
            .change_context(ProviderError::Cluster)?;
        items_of(listing)
    }

    pub async fn get_gateway(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Value, Report<ProviderError>> {
        self.client
            .request(
                &format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/gateways/{name}"),
                RequestOptions::default(),
            )
            .await
            .change_context(ProviderError::Cluster)
    }

    pub async fn get_httproute(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Value, Report<ProviderError>> {
        self.client
            .request(
                &format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/httproutes/{name}"),
                RequestOptions::default(),
            )
            .await
            .change_context(ProviderError::Cluster)
    }

    /// Create the route when absent, otherwise replace it with the
    /// resourceVersion carried over from the live object.
    pub async fn apply_httproute(
        &self,
        namespace: &str,
        mut manifest: Value,
    ) -> Result<Value, Report<ProviderError>> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| {
                Report::new(ProviderError::Malformed {
                    message: "HTTPRoute manifest is missing metadata.name".to_string(),
                })
            })?
            .to_string();

        let item_path = format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/httproutes/{name}");
        match self.client.request(&item_path, RequestOptions::default()).await {
            Ok(existing) => {
                if let Some(version) = existing["metadata"]["resourceVersion"].as_str() {
                    manifest["metadata"]["resourceVersion"] = json!(version);
                }
                self.client
                    .request(&item_path, RequestOptions::new(Method::PUT).json(manifest))
                    .await
                    .change_context(ProviderError::Cluster)
            }
            Err(err) if err.current_context().is_not_found() => self
                .client
                .request(
                    &format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/httproutes"),
                    RequestOptions::new(Method::POST).json(manifest),
                )
                .await
                .change_context(ProviderError::Cluster),
            Err(err) => Err(err.change_context(ProviderError::Cluster)),
        }
    }

    pub async fn delete_httproute(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), Report<ProviderError>> {
        self.client
            .request(
                &format!("{GATEWAY_API_ROOT}/namespaces/{namespace}/httproutes/{name}"),
                RequestOptions::new(Method::DELETE),
            )
            .await
            .change_context(ProviderError::Cluster)?;
        Ok(())
    }

    /// Create an autoscaler for an application from the default rule set
    /// plus a per-instance memory metric derived from the pod's memory
    /// limit.
    pub async fn create_hpa(
        &self,
        namespace: &str,
        name: &str,
        pod_id: &str,
        replicas: ReplicaBounds,
    ) -> Result<HpaView, Report<ProviderError>> {
        let pod_path = format!("/api/v1/namespaces/{namespace}/pods/{pod_id}");
        let pod = self
            .client
            .request(&pod_path, RequestOptions::default())
            .await
            .map_err(|err| tag_missing_machine(err, pod_id))?;

        let extras: Vec<MetricSource> = memory_metric_for(&pod, pod_id).into_iter().collect();

        let rules = self.rules.clone();
        let manifest = build_hpa_manifest(namespace, name, replicas, &rules, &extras);
        self.client
            .request(
                &format!("{HPA_API_ROOT}/namespaces/{namespace}/horizontalpodautoscalers"),
                RequestOptions::new(Method::POST).json(manifest),
            )
            .await
            .change_context(ProviderError::Cluster)?;

        Ok(rules.view(replicas, &extras))
    }

    /// # Errors
    ///
    /// [`ProviderError::NonExistentHpa`] when no autoscaler with that name
    /// exists.
    pub async fn get_hpa(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<HpaView, Report<ProviderError>> {
        let hpa = self.fetch_hpa(namespace, id).await?;
        Ok(self.view_of(&hpa))
    }

    /// Read-modify-write the replica bounds of an existing autoscaler.
    pub async fn update_hpa(
        &self,
        namespace: &str,
        id: &str,
        replicas: ReplicaBounds,
    ) -> Result<HpaView, Report<ProviderError>> {
        let mut hpa = self.fetch_hpa(namespace, id).await?;
        hpa["spec"]["minReplicas"] = json!(replicas.min);
        hpa["spec"]["maxReplicas"] = json!(replicas.max);

        let path = format!("{HPA_API_ROOT}/namespaces/{namespace}/horizontalpodautoscalers/{id}");
        let updated = self
            .client
            .request(&path, RequestOptions::new(Method::PUT).json(hpa))
            .await
            .change_context(ProviderError::Cluster)?;
        Ok(self.view_of(&updated))
    }

    async fn fetch_hpa(&self, namespace: &str, id: &str) -> Result<Value, Report<ProviderError>> {
        let path = format!("{HPA_API_ROOT}/namespaces/{namespace}/horizontalpodautoscalers/{id}");
        self.client
            .request(&path, RequestOptions::default())
            .await
            .map_err(|err| {
                if err.current_context().is_not_found() {
                    err.change_context(ProviderError::NonExistentHpa { id: id.to_string() })
                } else {
                    err.change_context(ProviderError::Cluster)
                }
            })
    }

    fn view_of(&self, hpa: &Value) -> HpaView {
        let replicas = ReplicaBounds {
            min: hpa["spec"]["minReplicas"].as_i64().unwrap_or(1) as i32,
            max: hpa["spec"]["maxReplicas"].as_i64().unwrap_or(1) as i32,
        };
        let extras: Vec<MetricSource> = parse_memory_metric(&hpa["spec"]).into_iter().collect();
        self.rules.view(replicas, &extras)
    }

    async fn machine_from(
        &self,
        namespace: &str,
        pod: &Value,
    ) -> Result<Machine, Report<ProviderError>> {
        let controller = match controlling_owner(pod) {
            Some(owner) => Some(
                self.resolver
                    .resolve(namespace, &owner.name, &owner.api_version, &owner.kind)
                    .await
                    .map(|resolved| project_controller(&resolved, &owner.api_version))
                    .change_context(ProviderError::Resolution)?,
            ),
            None => None,
        };
        project_machine(pod, controller)
    }
}

fn tag_missing_machine(err: Report<ClientError>, id: &str) -> Report<ProviderError> {
    if err.current_context().is_not_found() {
        err.change_context(ProviderError::MissingMachine { id: id.to_string() })
    } else {
        err.change_context(ProviderError::Cluster)
    }
}

/// `k=v,k2=v2` form of a label set, as the cluster API's `labelSelector`
/// query parameter expects.
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when every selector entry is present in `labels` with an equal
/// value. A missing or empty selector never matches.
pub(crate) fn selector_matches(selector: &Value, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector.as_object() else {
        return false;
    };
    if selector.is_empty() {
        return false;
    }
    selector.iter().all(|(key, value)| {
        value
            .as_str()
            .is_some_and(|value| labels.get(key).map(String::as_str) == Some(value))
    })
}

fn rule_references(rule: &Value, service_names: &[String]) -> bool {
    let Some(paths) = rule["http"]["paths"].as_array() else {
        return false;
    };
    paths.iter().any(|path| {
        path["backend"]["service"]["name"]
            .as_str()
            .is_some_and(|name| service_names.iter().any(|candidate| candidate == name))
    })
}

fn items_of(listing: Value) -> Result<Vec<Value>, Report<ProviderError>> {
    match listing.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(Report::new(ProviderError::Malformed {
            message: "listing response carries no items array".to_string(),
        })),
    }
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

pub(crate) fn project_machine(
    pod: &Value,
    controller: Option<ControllerView>,
) -> Result<Machine, Report<ProviderError>> {
    let id = pod["metadata"]["name"]
        .as_str()
        .ok_or_else(|| {
            Report::new(ProviderError::Malformed {
                message: "pod is missing metadata.name".to_string(),
            })
        })?
        .to_string();

    let first_container = &pod["spec"]["containers"][0];
    Ok(Machine {
        id,
        status: pod["status"]["phase"].as_str().map(String::from),
        private_ip: pod["status"]["podIP"].as_str().map(String::from),
        start_time: serde_json::from_value::<DateTime<Utc>>(pod["status"]["startTime"].clone())
            .ok(),
        labels: string_map(&pod["metadata"]["labels"]),
        image: first_container["image"].as_str().map(String::from),
        resources: match &first_container["resources"] {
            Value::Null => None,
            resources => Some(resources.clone()),
        },
        controller,
    })
}

pub(crate) fn project_controller(resource: &Value, fallback_api_version: &str) -> ControllerView {
    ControllerView {
        kind: resource["kind"].as_str().unwrap_or_default().to_string(),
        api_version: resource["apiVersion"]
            .as_str()
            .unwrap_or(fallback_api_version)
            .to_string(),
        name: resource["metadata"]["name"]
            .as_str()
            .or_else(|| resource["name"].as_str())
            .unwrap_or_default()
            .to_string(),
        replicas: resource["spec"]["replicas"].as_i64(),
        labels: string_map(&resource["metadata"]["labels"]),
        annotations: string_map(&resource["metadata"]["annotations"]),
    }
}

/// Per-instance memory pod metric: nine tenths of the first container's
/// memory limit, scoped to the instance by label selector. Absent when the
/// pod carries no memory limit.
fn memory_metric_for(pod: &Value, pod_id: &str) -> Option<MetricSource> {
    let limit = pod["spec"]["containers"][0]["resources"]["limits"]["memory"].as_str()?;
    let bytes = parse_data_quantity(limit).ok()?.to_bytes();
    let target = (bytes * MEMORY_TARGET_RATIO) as i64;

    let mut selector = BTreeMap::new();
    selector.insert("instance".to_string(), pod_id.to_string());
    Some(
        MetricSource::pod("memory", "Memory", MEMORY_METRIC_NAME, target, ValueKind::Bytes)
            .with_selector(selector),
    )
}

fn behaviour_wire(behaviour: &ScalingBehaviour) -> Value {
    json!({
        "stabilizationWindowSeconds": behaviour.stabilization,
        "policies": [{
            "type": "Percent",
            "value": behaviour.percent_of_pods,
            "periodSeconds": behaviour.period,
        }]
    })
}

fn build_hpa_manifest(
    namespace: &str,
    name: &str,
    replicas: ReplicaBounds,
    rules: &HpaRuleSet,
    extras: &[MetricSource],
) -> Value {
    let metrics: Vec<Value> = rules
        .metrics
        .iter()
        .chain(extras)
        .map(MetricSource::to_wire)
        .collect();

    json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "scaleTargetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": name,
            },
            "minReplicas": replicas.min,
            "maxReplicas": replicas.max,
            "behavior": {
                "scaleUp": behaviour_wire(&rules.up),
                "scaleDown": behaviour_wire(&rules.down),
            },
            "metrics": metrics,
        }
    })
}
