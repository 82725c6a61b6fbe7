mod api;
mod config;
mod export;
mod k8s;
mod logging;

use std::sync::Arc;

use api_types::scaling::HpaRuleSet;
use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::api::ApiServer;
use crate::config::Args;
use crate::export::sink::SinkClient;
use crate::export::EventExporter;
use crate::k8s::ApiClient;
use crate::k8s::WorkloadProvider;

#[derive(Debug, Error)]
enum BootError {
    #[error("failed to load cluster credentials")]
    Credentials,
    #[error("failed to build the cluster API client")]
    Client,
    #[error("a sink URL is required unless event export is disabled")]
    MissingSinkUrl,
    #[error("failed to build the event sink client")]
    Sink,
    #[error("facade server failed")]
    Server,
    #[error("event export failed")]
    Export,
    #[error("failed to wait for the shutdown signal")]
    Signal,
}

#[tokio::main]
async fn main() -> Result<(), Report<BootError>> {
    logging::init();

    let args = Args::parse();
    info!("Starting foreman v{}", env!("CARGO_PKG_VERSION"));

    let cluster_config =
        config::load_cluster_credentials(&args).change_context(BootError::Credentials)?;
    let client = Arc::new(ApiClient::new(cluster_config).change_context(BootError::Client)?);
    let provider = Arc::new(WorkloadProvider::new(client.clone(), HpaRuleSet::default()));

    let export_signal = CancellationToken::new();
    let exporter = if args.disable_event_export {
        info!("Event export is disabled");
        None
    } else {
        let sink_url = args
            .log_sink_url
            .as_deref()
            .ok_or_else(|| Report::new(BootError::MissingSinkUrl))?;
        let sink = SinkClient::new(sink_url).change_context(BootError::Sink)?;
        let exporter = EventExporter::new(client, sink, args.namespace.clone());
        let signal = export_signal.clone();
        Some(tokio::spawn(async move { exporter.run(signal).await }))
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = ApiServer::new(provider, args.listen_addr.clone());
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .change_context(BootError::Signal)?;
    info!("Shutdown signal received");

    export_signal.cancel();
    if shutdown_tx.send(()).is_err() {
        warn!("Facade server already stopped");
    }

    server_task
        .await
        .change_context(BootError::Server)?
        .change_context(BootError::Server)?;
    if let Some(exporter) = exporter {
        exporter
            .await
            .change_context(BootError::Export)?
            .change_context(BootError::Export)?;
    }

    info!("Shutdown complete");
    Ok(())
}
