//! Shared domain type definitions
//!
//! This crate contains the shared type definitions used across the foreman
//! project: reduced pod and controller projections served by the workload
//! provider, owner-reference metadata, event-stream labels, and the
//! quantity/metric/scaling models used for autoscaler management.

pub mod metrics;
pub mod quantity;
pub mod scaling;

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Reduced pod projection returned by the workload provider.
///
/// This is the caller-facing shape of a pod: identity, lifecycle phase,
/// addressing, labels, first-container image/resources, and the resolved
/// root controller when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Raw resource limits/requests of the first container, as reported by
    /// the cluster API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerView>,
}

/// Reduced projection of a workload controller (Deployment, ReplicaSet,
/// StatefulSet, ReplicationController, ...).
///
/// Derived from the raw resolved resource on every query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControllerView {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A controller together with the machines currently attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerGroup {
    #[serde(flatten)]
    pub controller: ControllerView,
    pub pods: Vec<Machine>,
}

/// Caller-supplied reference identifying a controller resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
}

/// An owner reference as carried in `metadata.ownerReferences`.
///
/// At most one entry in a resource's owner list is marked `controller`;
/// that is a cluster invariant this system assumes and does not enforce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

/// Label triple classifying a watch-stream event for export grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLabels {
    pub event_type: Option<String>,
    pub name: Option<String>,
    pub resource: Option<String>,
}
