//! HTTP façade: thin poem adapters over the workload provider.

pub mod errors;
pub mod gateways;
pub mod handlers;
pub mod scaling;
pub mod server;

pub use server::ApiServer;
