//! Autoscaler route handlers.

use std::sync::Arc;

use api_types::scaling::HpaView;
use api_types::scaling::ReplicaBounds;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use super::errors::provider_error;
use crate::k8s::WorkloadProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScalingRequest {
    pub name: String,
    pub pod_id: String,
    pub min_replicas: i32,
    pub max_replicas: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScalingRequest {
    pub min_replicas: i32,
    pub max_replicas: i32,
}

/// The rule set applied to newly created autoscalers.
#[handler]
pub async fn get_scaling_defaults(
    Path(_namespace): Path<String>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> Json<Value> {
    let rules = provider.default_rules();
    Json(json!({ "defaults": rules.view(rules.replicas, &[]) }))
}

#[handler]
pub async fn create_scaling(
    Path(namespace): Path<String>,
    Json(request): Json<CreateScalingRequest>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<HpaView>> {
    // Both bounds at zero means the caller opted out of autoscaling. Nothing
    // is created and an empty rule view is returned.
    if request.min_replicas == 0 && request.max_replicas == 0 {
        return Ok(Json(HpaView::default()));
    }

    let view = provider
        .create_hpa(
            &namespace,
            &request.name,
            &request.pod_id,
            ReplicaBounds {
                min: request.min_replicas,
                max: request.max_replicas,
            },
        )
        .await
        .map_err(provider_error)?;
    Ok(Json(view))
}

#[handler]
pub async fn get_scaling(
    Path((namespace, id)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<HpaView>> {
    let view = provider
        .get_hpa(&namespace, &id)
        .await
        .map_err(provider_error)?;
    Ok(Json(view))
}

#[handler]
pub async fn update_scaling(
    Path((namespace, id)): Path<(String, String)>,
    Json(request): Json<UpdateScalingRequest>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<HpaView>> {
    let view = provider
        .update_hpa(
            &namespace,
            &id,
            ReplicaBounds {
                min: request.min_replicas,
                max: request.max_replicas,
            },
        )
        .await
        .map_err(provider_error)?;
    Ok(Json(view))
}
