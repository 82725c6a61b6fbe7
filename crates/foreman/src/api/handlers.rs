//! Workload route handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::ControllerGroup;
use api_types::ControllerRef;
use api_types::ControllerView;
use api_types::Machine;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use poem::Request;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use super::errors::provider_error;
use crate::k8s::WorkloadProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerQuery {
    pub api_version: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllersQuery {
    pub pod_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplicaUpdate {
    pub replicas: i64,
}

#[derive(Debug, Deserialize)]
pub struct LabelPatch {
    pub labels: BTreeMap<String, String>,
}

#[handler]
pub async fn get_pod(
    Path((namespace, id)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Machine>> {
    let machine = provider
        .get_pod(&namespace, &id)
        .await
        .map_err(provider_error)?;
    Ok(Json(machine))
}

#[handler]
pub async fn patch_pod_labels(
    Path((namespace, id)): Path<(String, String)>,
    Json(patch): Json<LabelPatch>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<StatusCode> {
    provider
        .set_machine_labels(&namespace, &id, &patch.labels)
        .await
        .map_err(provider_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
pub async fn get_controllers(
    Path(namespace): Path<String>,
    Query(query): Query<ControllersQuery>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Vec<ControllerGroup>>> {
    let groups = provider
        .get_controllers(&namespace, query.pod_id.as_deref())
        .await
        .map_err(provider_error)?;
    Ok(Json(groups))
}

#[handler]
pub async fn get_controller(
    Path((namespace, id)): Path<(String, String)>,
    Query(query): Query<ControllerQuery>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<ControllerView>> {
    let reference = ControllerRef {
        kind: query.kind,
        api_version: query.api_version,
        name: id,
    };
    let controller = provider
        .get_controller(&namespace, &reference)
        .await
        .map_err(provider_error)?;
    Ok(Json(controller))
}

#[handler]
pub async fn update_controller_replicas(
    Path((namespace, id)): Path<(String, String)>,
    Query(query): Query<ControllerQuery>,
    Json(update): Json<ReplicaUpdate>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<ControllerView>> {
    let reference = ControllerRef {
        kind: query.kind,
        api_version: query.api_version,
        name: id,
    };
    let controller = provider
        .update_controller(&namespace, &reference, update.replicas)
        .await
        .map_err(provider_error)?;
    Ok(Json(controller))
}

#[handler]
pub async fn get_services(
    Path(namespace): Path<String>,
    req: &Request,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Vec<Value>>> {
    let labels = label_pairs(req.uri().query(), "labels");
    let services = provider
        .get_services(&namespace, &labels)
        .await
        .map_err(provider_error)?;
    Ok(Json(services))
}

#[handler]
pub async fn delete_service(
    Path((namespace, name)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<StatusCode> {
    provider
        .delete_service(&namespace, &name)
        .await
        .map_err(provider_error)?;
    Ok(StatusCode::NO_CONTENT)
}

///// Combined view of a namespace: its machines, the services selecting
/// them, and the ingress rules routing to those services.
#[handler]
pub async fn get_state(
    Path(namespace): Path<String>,
    req: &Request,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Value>> {
    let selector = label_pairs(req.uri().query(), "podSelector");

    let pods = provider
        .get_pods(&namespace, &selector)
        .await
        .map_err(provider_error)?;
    let services = provider
        .get_services(&namespace, &selector)
        .await
        .map_err(provider_error)?;

    let service_names: Vec<String> = services
        .iter()
        .filter_map(|service| service["metadata"]["name"].as_str().map(String::from))
        .collect();
    let ingress_rules = if service_names.is_empty() {
        Vec::new()
    } else {
        provider
            .get_ingress_routes(&namespace, &service_names)
            .await
            .map_err(provider_error)?
    };

    Ok(Json(json!({
        "pods": pods,
        "services": services,
        "ingresses": ingress_rules,
    })))
}

/// Collect a repeated `<param>=k=v` query parameter into a label map.
///
/// Callers pass label pairs as whole values (`labels=app=web`), usually
/// with the inner `=` percent-encoded; both spellings are accepted.
pub(crate) fn label_pairs(query: Option<&str>, param: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        if key != param {
            continue;
        }
        if let Some((label, label_value)) = value.split_once('=') {
            labels.insert(label.to_string(), label_value.to_string());
        }
    }
    labels
}
