//! Controller-ownership resolution.
//!
//! Given a resource and its immediate owner reference, finds the top-most
//! controlling resource by walking `metadata.ownerReferences` across API
//! groups and versions. The walk is an explicit bounded loop with a visited
//! set: clusters guarantee ownership chains are acyclic and finite, but a
//! misconfigured cluster must not be able to pin this service in a loop.

use std::collections::HashSet;
use std::sync::Arc;

use api_types::OwnerReference;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::k8s::client::ApiClient;
use crate::k8s::client::ClientError;
use crate::k8s::client::RequestOptions;

/// Upper bound on owner-chain length before resolution is abandoned.
const MAX_OWNERSHIP_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to fetch {kind}/{name}")]
    Fetch { kind: String, name: String },
    #[error("ownership cycle detected at {kind}/{name}")]
    OwnershipCycle { kind: String, name: String },
    #[error("ownership chain for {kind}/{name} exceeds depth {max}")]
    ChainTooDeep {
        kind: String,
        name: String,
        max: usize,
    },
}

/// Walks owner-reference chains to their root via the API client.
pub struct ControllerResolver {
    client: Arc<ApiClient>,
}

impl ControllerResolver {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Resolve the top-most controlling resource starting from the given
    /// reference.
    ///
    /// A failure while fetching a *parent* is logged and swallowed: the last
    /// successfully fetched resource is returned, on the reasoning that a
    /// stale partial chain is more useful to the caller than a hard
    /// failure. Only the initial fetch propagates its error.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Fetch`] if the initial resource cannot be fetched
    /// - [`ResolveError::OwnershipCycle`] when a (kind, name) pair repeats
    /// - [`ResolveError::ChainTooDeep`] past [`MAX_OWNERSHIP_DEPTH`] hops
    pub async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
        kind: &str,
    ) -> Result<Value, Report<ResolveError>> {
        let mut visited: HashSet<(String, String)> = HashSet::new();
        visited.insert((kind.to_string(), name.to_string()));

        let mut current = self
            .fetch(namespace, name, api_version, kind)
            .await
            .change_context(ResolveError::Fetch {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;

        loop {
            let Some(owner) = controlling_owner(&current) else {
                return Ok(current);
            };

            debug!(
                owner_kind = %owner.kind,
                owner_name = %owner.name,
                "following controlling owner"
            );

            if !visited.insert((owner.kind.clone(), owner.name.clone())) {
                return Err(Report::new(ResolveError::OwnershipCycle {
                    kind: owner.kind,
                    name: owner.name,
                }));
            }
            if visited.len() > MAX_OWNERSHIP_DEPTH {
                return Err(Report::new(ResolveError::ChainTooDeep {
                    kind: owner.kind,
                    name: owner.name,
                    max: MAX_OWNERSHIP_DEPTH,
                }));
            }

            match self
                .fetch(namespace, &owner.name, &owner.api_version, &owner.kind)
                .await
            {
                Ok(parent) => current = parent,
                Err(err) => {
                    // A disappeared parent leaves a stale chain behind;
                    // return what we have rather than failing the caller.
                    warn!(
                        owner_kind = %owner.kind,
                        owner_name = %owner.name,
                        error = ?err,
                        "unable to fetch parent controller, returning last known resource"
                    );
                    return Ok(current);
                }
            }
        }
    }

    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
        kind: &str,
    ) -> Result<Value, Report<ClientError>> {
        let path = resource_path(namespace, name, api_version, kind);
        let mut resource = self.client.request(&path, RequestOptions::default()).await?;

        // Owner references and fetched resources carry their name in
        // different places; inject a top-level name so both read alike.
        if resource.get("name").is_none() {
            resource["name"] = Value::String(name.to_string());
        }

        Ok(resource)
    }
}

/// The at-most-one owner reference marked as controlling, if any.
pub(crate) fn controlling_owner(resource: &Value) -> Option<OwnerReference> {
    resource
        .get("metadata")?
        .get("ownerReferences")?
        .as_array()?
        .iter()
        .filter_map(|owner| serde_json::from_value::<OwnerReference>(owner.clone()).ok())
        .find(|owner| owner.controller)
}

/// Path of a namespaced resource: grouped API versions target the `/apis`
/// root, the core version targets `/api`; the kind is lower-cased and
/// pluralized.
pub(crate) fn resource_path(namespace: &str, name: &str, api_version: &str, kind: &str) -> String {
    let root = if api_version.contains('/') {
        format!("/apis/{api_version}")
    } else {
        format!("/api/{api_version}")
    };
    format!("{root}/namespaces/{namespace}/{}/{name}", pluralize(kind))
}

/// Lower-case and pluralize a resource kind the way the cluster API names
/// its collections (Ingress -> ingresses, NetworkPolicy -> networkpolicies).
pub(crate) fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else if lower.ends_with('s') || lower.ends_with('x') {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::k8s::client::ClientConfig;
    use crate::k8s::client::ClusterAuth;
    use crate::k8s::testutil::FixtureServer;
    use crate::k8s::testutil::Reply;

    fn resolver_for(server: &FixtureServer) -> ControllerResolver {
        let client = ApiClient::new(ClientConfig {
            api_url: server.url(),
            ca_cert_pem: None,
            auth: ClusterAuth::BearerToken("fake-token".to_string()),
            allow_self_signed: true,
        })
        .unwrap();
        ControllerResolver::new(Arc::new(client))
    }

    fn owned(kind: &str, name: &str, owner: Option<(&str, &str, &str)>) -> String {
        let mut metadata = json!({ "name": name });
        if let Some((owner_kind, owner_api_version, owner_name)) = owner {
            metadata["ownerReferences"] = json!([{
                "kind": owner_kind,
                "apiVersion": owner_api_version,
                "name": owner_name,
                "controller": true
            }]);
        }
        json!({ "kind": kind, "metadata": metadata }).to_string()
    }

    #[test]
    fn pluralize_follows_collection_naming() {
        assert_eq!(pluralize("Deployment"), "deployments");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize("StatefulSet"), "statefulsets");
    }

    #[test]
    fn resource_paths_distinguish_core_and_grouped_apis() {
        assert_eq!(
            resource_path("default", "web", "v1", "ReplicationController"),
            "/api/v1/namespaces/default/replicationcontrollers/web"
        );
        assert_eq!(
            resource_path("default", "web", "apps/v1", "Deployment"),
            "/apis/apps/v1/namespaces/default/deployments/web"
        );
    }

    #[tokio::test]
    async fn walks_the_chain_to_the_root_controller() {
        let server = FixtureServer::spawn(vec![
            (
                "GET /apis/apps/v1/namespaces/default/replicasets/web-5d4f",
                Reply::Json {
                    status: 200,
                    body: owned("ReplicaSet", "web-5d4f", Some(("Deployment", "apps/v1", "web"))),
                },
            ),
            (
                "GET /apis/apps/v1/namespaces/default/deployments/web",
                Reply::Json {
                    status: 200,
                    body: owned("Deployment", "web", None),
                },
            ),
        ])
        .await;

        let resolver = resolver_for(&server);
        let root = resolver
            .resolve("default", "web-5d4f", "apps/v1", "ReplicaSet")
            .await
            .unwrap();

        assert_eq!(root["kind"], "Deployment");
        assert_eq!(root["metadata"]["name"], "web");
    }

    #[tokio::test]
    async fn resolution_is_idempotent_against_unchanged_fixtures() {
        let server = FixtureServer::spawn(vec![
            (
                "GET /apis/apps/v1/namespaces/default/replicasets/web-5d4f",
                Reply::Json {
                    status: 200,
                    body: owned("ReplicaSet", "web-5d4f", Some(("Deployment", "apps/v1", "web"))),
                },
            ),
            (
                "GET /apis/apps/v1/namespaces/default/deployments/web",
                Reply::Json {
                    status: 200,
                    body: owned("Deployment", "web", None),
                },
            ),
        ])
        .await;

        let resolver = resolver_for(&server);
        let first = resolver
            .resolve("default", "web-5d4f", "apps/v1", "ReplicaSet")
            .await
            .unwrap();
        let second = resolver
            .resolve("default", "web-5d4f", "apps/v1", "ReplicaSet")
            .await
            .unwrap();

        similar_asserts::assert_eq!(first, second);
    }

    #[test_log::test(tokio::test)]
    async fn a_missing_parent_yields_the_last_known_resource() {
        // The deployment is gone; only the replicaset still answers.
        let server = FixtureServer::spawn(vec![(
            "GET /apis/apps/v1/namespaces/default/replicasets/web-5d4f",
            Reply::Json {
                status: 200,
                body: owned("ReplicaSet", "web-5d4f", Some(("Deployment", "apps/v1", "web"))),
            },
        )])
        .await;

        let resolver = resolver_for(&server);
        let resource = resolver
            .resolve("default", "web-5d4f", "apps/v1", "ReplicaSet")
            .await
            .unwrap();

        assert_eq!(resource["kind"], "ReplicaSet");
    }

    #[tokio::test]
    async fn a_missing_initial_resource_propagates() {
        let server = FixtureServer::spawn(vec![]).await;

        let resolver = resolver_for(&server);
        let err = resolver
            .resolve("default", "ghost", "apps/v1", "Deployment")
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            ResolveError::Fetch { .. }
        ));
    }

    #[tokio::test]
    async fn an_ownership_cycle_fails_with_a_distinct_error() {
        let server = FixtureServer::spawn(vec![
            (
                "GET /apis/apps/v1/namespaces/default/deployments/a",
                Reply::Json {
                    status: 200,
                    body: owned("Deployment", "a", Some(("Deployment", "apps/v1", "b"))),
                },
            ),
            (
                "GET /apis/apps/v1/namespaces/default/deployments/b",
                Reply::Json {
                    status: 200,
                    body: owned("Deployment", "b", Some(("Deployment", "apps/v1", "a"))),
                },
            ),
        ])
        .await;

        let resolver = resolver_for(&server);
        let err = resolver
            .resolve("default", "a", "apps/v1", "Deployment")
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            ResolveError::OwnershipCycle { .. }
        ));
        // bounded: two fetches, then the repeat is caught before a third
        assert_eq!(
            server.hits("GET /apis/apps/v1/namespaces/default/deployments/a"),
            1
        );
    }
}
