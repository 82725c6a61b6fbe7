//! Gateway API route handlers.

use std::sync::Arc;

use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use serde_json::Value;

use super::errors::provider_error;
use crate::k8s::WorkloadProvider;

#[handler]
pub async fn list_all_gateways(
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Vec<Value>>> {
    let gateways = provider.list_all_gateways().await.map_err(provider_error)?;
    Ok(Json(gateways))
}

#[handler]
pub async fn list_gateways(
    Path(namespace): Path<String>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Vec<Value>>> {
    let gateways = provider
        .list_gateways(&namespace)
        .await
        .map_err(provider_error)?;
    Ok(Json(gateways))
}

#[handler]
pub async fn get_gateway(
    Path((namespace, name)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Value>> {
    let gateway = provider
        .get_gateway(&namespace, &name)
        .await
        .map_err(provider_error)?;
    Ok(Json(gateway))
}

#[handler]
pub async fn get_httproute(
    Path((namespace, name)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Value>> {
    let route = provider
        .get_httproute(&namespace, &name)
        .await
        .map_err(provider_error)?;
    Ok(Json(route))
}

#[handler]
pub async fn apply_httproute(
    Path(namespace): Path<String>,
    Json(manifest): Json<Value>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<Json<Value>> {
    let applied = provider
        .apply_httproute(&namespace, manifest)
        .await
        .map_err(provider_error)?;
    Ok(Json(applied))
}

#[handler]
pub async fn delete_httproute(
    Path((namespace, name)): Path<(String, String)>,
    provider: Data<&Arc<WorkloadProvider>>,
) -> poem::Result<StatusCode> {
    provider
        .delete_httproute(&namespace, &name)
        .await
        .map_err(provider_error)?;
    Ok(StatusCode::NO_CONTENT)
}
