use std::fs;
use std::path::PathBuf;

use base64::prelude::Engine;
use base64::prelude::BASE64_STANDARD;
use clap::Parser;
use clap::ValueEnum;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;

use crate::k8s::client::ClientConfig;
use crate::k8s::client::ClusterAuth;

/// How the service authenticates against the cluster API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthType {
    /// Bearer token from a mounted service-account token file.
    Token,
    /// Mutual-TLS client certificate and key, base64-encoded in the
    /// environment.
    ClientCert,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "foreman",
    about = "Control-plane facade over a Kubernetes-compatible cluster API",
    version
)]
pub struct Args {
    #[arg(
        long,
        env = "FOREMAN_LISTEN_ADDR",
        default_value = "0.0.0.0:3042",
        help = "Address the HTTP facade listens on"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "FOREMAN_NAMESPACE",
        default_value = "default",
        help = "Namespace served by the workload provider and watched for events"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = "FOREMAN_DISABLE_EVENT_EXPORT",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Disable the event export pipeline entirely"
    )]
    pub disable_event_export: bool,

    #[arg(
        long,
        env = "FOREMAN_LOG_SINK_URL",
        help = "Base URL of the downstream event sink; required unless event export is disabled"
    )]
    pub log_sink_url: Option<String>,

    #[arg(
        long,
        env = "FOREMAN_K8S_AUTH_TYPE",
        value_enum,
        default_value_t = AuthType::Token,
        help = "Cluster API authentication mode"
    )]
    pub k8s_auth_type: AuthType,

    #[arg(
        long,
        env = "FOREMAN_K8S_API_URL",
        default_value = "https://kubernetes.default.svc",
        help = "Base URL of the cluster API"
    )]
    pub k8s_api_url: String,

    #[arg(
        long,
        env = "FOREMAN_K8S_CA_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
        help = "Path to the cluster CA certificate"
    )]
    pub k8s_ca_path: PathBuf,

    #[arg(
        long,
        env = "FOREMAN_K8S_TOKEN_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token",
        help = "Path to the mounted service-account token (token auth)"
    )]
    pub k8s_token_path: PathBuf,

    #[arg(
        long,
        env = "FOREMAN_K8S_ALLOW_SELFSIGNED_CERT",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Accept self-signed cluster API server certificates"
    )]
    pub k8s_allow_selfsigned_cert: bool,

    #[arg(
        long,
        env = "FOREMAN_K8S_CLIENT_CERT",
        help = "Base64-encoded client certificate PEM (client-cert auth)"
    )]
    pub k8s_client_cert: Option<String>,

    #[arg(
        long,
        env = "FOREMAN_K8S_CLIENT_KEY",
        help = "Base64-encoded client key PEM (client-cert auth)"
    )]
    pub k8s_client_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read credential file: {path}")]
    UnreadableFile { path: String },
    #[error("client certificate and key are required for client-cert authentication")]
    MissingClientCredentials,
    #[error("client credentials are not valid base64")]
    InvalidClientCredentials,
}

/// Load the credential material referenced by the arguments and assemble the
/// cluster client configuration.
pub fn load_cluster_credentials(args: &Args) -> Result<ClientConfig, Report<ConfigError>> {
    let ca_cert_pem = fs::read(&args.k8s_ca_path).change_context(ConfigError::UnreadableFile {
        path: args.k8s_ca_path.display().to_string(),
    })?;

    let auth = match args.k8s_auth_type {
        AuthType::Token => {
            let token = fs::read_to_string(&args.k8s_token_path).change_context(
                ConfigError::UnreadableFile {
                    path: args.k8s_token_path.display().to_string(),
                },
            )?;
            ClusterAuth::BearerToken(token.trim().to_string())
        }
        AuthType::ClientCert => {
            let (cert, key) = args
                .k8s_client_cert
                .as_deref()
                .zip(args.k8s_client_key.as_deref())
                .ok_or_else(|| Report::new(ConfigError::MissingClientCredentials))?;

            let cert_pem = BASE64_STANDARD
                .decode(cert.trim())
                .change_context(ConfigError::InvalidClientCredentials)?;
            let key_pem = BASE64_STANDARD
                .decode(key.trim())
                .change_context(ConfigError::InvalidClientCredentials)?;
            ClusterAuth::ClientCertificate { cert_pem, key_pem }
        }
    };

    Ok(ClientConfig {
        api_url: args.k8s_api_url.trim_end_matches('/').to_string(),
        ca_cert_pem: Some(ca_cert_pem),
        auth,
        allow_self_signed: args.k8s_allow_selfsigned_cert,
    })
}
