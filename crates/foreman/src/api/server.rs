use std::sync::Arc;

use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::patch;
use poem::put;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::gateways;
use super::handlers;
use super::scaling;
use crate::k8s::WorkloadProvider;

/// HTTP façade over the workload provider
pub struct ApiServer {
    provider: Arc<WorkloadProvider>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(provider: Arc<WorkloadProvider>, listen_addr: String) -> Self {
        Self {
            provider,
            listen_addr,
        }
    }

    /// Start the façade server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP façade on {}", self.listen_addr);

        let app = routes(self.provider);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Façade server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Façade server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = &mut shutdown_rx => {
                info!("Façade server shutdown requested");
                Ok(())
            }
        }
    }
}

fn routes(provider: Arc<WorkloadProvider>) -> impl poem::Endpoint {
    Route::new()
        .at("/pods/:namespace/:id", get(handlers::get_pod))
        .at(
            "/pods/:namespace/:id/labels",
            patch(handlers::patch_pod_labels),
        )
        .at("/controllers/:namespace", get(handlers::get_controllers))
        .at(
            "/controllers/:namespace/:id",
            get(handlers::get_controller).post(handlers::update_controller_replicas),
        )
        .at("/services/:namespace", get(handlers::get_services))
        .at(
            "/services/:namespace/:name",
            delete(handlers::delete_service),
        )
        .at("/state/:namespace", get(handlers::get_state))
        .at(
            "/scaling/:namespace",
            get(scaling::get_scaling_defaults).post(scaling::create_scaling),
        )
        .at(
            "/scaling/:namespace/:id",
            get(scaling::get_scaling).post(scaling::update_scaling),
        )
        .at("/gateway/gateways", get(gateways::list_all_gateways))
        .at(
            "/gateway/gateways/:namespace",
            get(gateways::list_gateways),
        )
        .at(
            "/gateway/gateways/:namespace/:name",
            get(gateways::get_gateway),
        )
        .at(
            "/gateway/httproutes/:namespace",
            put(gateways::apply_httproute),
        )
        .at(
            "/gateway/httproutes/:namespace/:name",
            get(gateways::get_httproute).delete(gateways::delete_httproute),
        )
        .data(provider)
        .with(Tracing)
}

#[cfg(test)]
mod tests {
    use api_types::scaling::HpaRuleSet;
    use poem::test::TestClient;
    use serde_json::json;

    use super::*;
    use crate::k8s::client::ClientConfig;
    use crate::k8s::client::ClusterAuth;
    use crate::k8s::testutil::FixtureServer;
    use crate::k8s::testutil::Reply;
    use crate::k8s::ApiClient;

    fn provider_for(server: &FixtureServer) -> Arc<WorkloadProvider> {
        let client = ApiClient::new(ClientConfig {
            api_url: server.url(),
            ca_cert_pem: None,
            auth: ClusterAuth::BearerToken("fake-token".to_string()),
            allow_self_signed: true,
        })
        .unwrap();
        Arc::new(WorkloadProvider::new(
            Arc::new(client),
            HpaRuleSet::default(),
        ))
    }

    #[tokio::test]
    async fn a_missing_machine_serves_a_404_with_a_code() {
        let cluster = FixtureServer::spawn(vec![]).await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli.get("/pods/default/ghost").send().await;
        resp.assert_status(poem::http::StatusCode::NOT_FOUND);
        let body = resp.json().await;
        assert_eq!(body.value().object().get("code").string(), "FOREMAN_MISSING_MACHINE");
    }

    #[tokio::test]
    async fn services_without_labels_serve_a_400() {
        let cluster = FixtureServer::spawn(vec![]).await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli.get("/services/default").send().await;
        resp.assert_status(poem::http::StatusCode::BAD_REQUEST);
        let body = resp.json().await;
        assert_eq!(
            body.value().object().get("code").string(),
            "FOREMAN_EMPTY_LABEL_SELECTOR"
        );
        assert_eq!(cluster.total_requests(), 0);
    }

    #[tokio::test]
    async fn a_live_pod_is_served_as_a_machine() {
        let cluster = FixtureServer::spawn(vec![(
            "GET /api/v1/namespaces/default/pods/web-5d4f-abcde",
            Reply::Json {
                status: 200,
                body: json!({
                    "metadata": { "name": "web-5d4f-abcde", "labels": { "app": "web" } },
                    "status": { "phase": "Running", "podIP": "10.1.2.3" },
                    "spec": { "containers": [{ "image": "registry.local/web:1.4.2" }] },
                })
                .to_string(),
            },
        )])
        .await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli.get("/pods/default/web-5d4f-abcde").send().await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        let machine = body.value().object();
        assert_eq!(machine.get("id").string(), "web-5d4f-abcde");
        assert_eq!(machine.get("privateIp").string(), "10.1.2.3");
    }

    #[tokio::test]
    async fn scaling_defaults_are_served_without_touching_the_cluster() {
        let cluster = FixtureServer::spawn(vec![]).await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli.get("/scaling/default").send().await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        let defaults = body.value().object().get("defaults").object();
        assert_eq!(defaults.get("metrics").array().len(), 1);
        assert_eq!(cluster.total_requests(), 0);
    }

    #[tokio::test]
    async fn zero_replica_bounds_skip_autoscaler_creation() {
        let cluster = FixtureServer::spawn(vec![]).await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli
            .post("/scaling/default")
            .body_json(&json!({
                "name": "web",
                "podId": "web-5d4f-abcde",
                "minReplicas": 0,
                "maxReplicas": 0,
            }))
            .send()
            .await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        assert_eq!(body.value().object().get("metrics").array().len(), 0);
        assert_eq!(cluster.total_requests(), 0);
    }

    #[tokio::test]
    async fn namespace_state_serves_pods_services_and_ingresses() {
        let cluster = FixtureServer::spawn(vec![
            (
                "GET /api/v1/namespaces/default/pods?labelSelector=app=web",
                Reply::Json {
                    status: 200,
                    body: json!({ "items": [] }).to_string(),
                },
            ),
            (
                "GET /api/v1/namespaces/default/services",
                Reply::Json {
                    status: 200,
                    body: json!({ "items": [] }).to_string(),
                },
            ),
        ])
        .await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli.get("/state/default?podSelector=app%3Dweb").send().await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        let state = body.value().object();
        assert_eq!(state.get("pods").array().len(), 0);
        assert_eq!(state.get("services").array().len(), 0);
        assert_eq!(state.get("ingresses").array().len(), 0);
    }

    #[tokio::test]
    async fn pod_labels_are_patched_from_a_wrapped_body() {
        let cluster = FixtureServer::spawn(vec![(
            "PATCH /api/v1/namespaces/default/pods/web-5d4f-abcde",
            Reply::Json {
                status: 200,
                body: json!({ "metadata": { "name": "web-5d4f-abcde" } }).to_string(),
            },
        )])
        .await;
        let cli = TestClient::new(routes(provider_for(&cluster)));

        let resp = cli
            .patch("/pods/default/web-5d4f-abcde/labels")
            .body_json(&json!({ "labels": { "tier": "canary" } }))
            .send()
            .await;
        resp.assert_status(poem::http::StatusCode::NO_CONTENT);

        let recorded = cluster
            .last_request("PATCH /api/v1/namespaces/default/pods/web-5d4f-abcde")
            .unwrap();
        let sent: serde_json::Value = serde_json::from_str(&recorded.body).unwrap();
        assert_eq!(sent["metadata"]["labels"]["tier"], "canary");
    }
}
