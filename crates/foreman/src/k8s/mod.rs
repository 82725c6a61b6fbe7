//! Cluster API access: transport client, controller-ownership resolution,
//! and the workload provider façade built on top of both.

pub mod client;
pub mod provider;
pub mod resolver;

pub use client::ApiClient;
pub use client::ClientConfig;
pub use client::ClusterAuth;
pub use provider::WorkloadProvider;
