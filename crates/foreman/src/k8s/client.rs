//! Low-level transport to the cluster API.
//!
//! One shared connection pool (HTTP/2-capable, rustls) serves both single
//! request/response calls and long-lived watch streams. Cluster API servers
//! terminate idle or long-lived HTTP/2 sessions (GOAWAY); because watch and
//! control traffic share the pool, a torn-down session must not fail an
//! ordinary request, so transport-level errors are absorbed with a bounded
//! backoff retry. HTTP-level errors (status > 299) propagate immediately and
//! are never retried.

use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::ACCEPT;
use reqwest::header::AUTHORIZATION;
use reqwest::header::CONTENT_TYPE;
use reqwest::Certificate;
use reqwest::Identity;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

const USER_AGENT: &str = concat!("foreman/v", env!("CARGO_PKG_VERSION"));

/// Additional attempts after the first transport failure.
const MAX_TRANSPORT_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Errors surfaced by the cluster API client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The cluster API answered with a non-2xx status.
    #[error("cluster API returned status {status}: {body}")]
    Api { status: u16, body: String },
    /// A connection-level failure that survived the retry budget.
    #[error("transport failure talking to the cluster API: {message}")]
    Transport { message: String },
    /// The response body could not be decoded as JSON.
    #[error("failed to decode cluster API response: {message}")]
    Decode { message: String },
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
}

impl ClientError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Cluster API authentication material.
#[derive(Debug, Clone)]
pub enum ClusterAuth {
    BearerToken(String),
    ClientCertificate { cert_pem: Vec<u8>, key_pem: Vec<u8> },
}

/// Construction inputs for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the cluster API, no trailing slash.
    pub api_url: String,
    /// PEM bundle of the cluster CA. `None` only for plain-HTTP endpoints.
    pub ca_cert_pem: Option<Vec<u8>>,
    pub auth: ClusterAuth,
    /// Accept self-signed server certificates.
    pub allow_self_signed: bool,
}

/// Per-request overrides for [`ApiClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn content_type(mut self, value: &'static str) -> Self {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
        self
    }
}

/// Authenticated client for the cluster API.
///
/// Cheap to clone behind an `Arc`; all callers share one connection pool,
/// which is the sole point of TLS/auth configuration reuse.
pub struct ApiClient {
    http: reqwest::Client,
    api_url: String,
    bearer: Option<HeaderValue>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, Report<ClientError>> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(config.allow_self_signed)
            .user_agent(USER_AGENT);

        if let Some(ca) = &config.ca_cert_pem {
            let ca = Certificate::from_pem(ca).change_context(ClientError::Configuration {
                message: "CA certificate is not valid PEM".to_string(),
            })?;
            builder = builder.add_root_certificate(ca);
        }

        let bearer = match &config.auth {
            ClusterAuth::BearerToken(token) => Some(
                HeaderValue::from_str(&format!("Bearer {token}")).change_context(
                    ClientError::Configuration {
                        message: "bearer token contains invalid header characters".to_string(),
                    },
                )?,
            ),
            ClusterAuth::ClientCertificate { cert_pem, key_pem } => {
                let mut identity_pem = Vec::with_capacity(key_pem.len() + cert_pem.len() + 1);
                identity_pem.extend_from_slice(key_pem);
                identity_pem.push(b'\n');
                identity_pem.extend_from_slice(cert_pem);
                let identity = Identity::from_pem(&identity_pem).change_context(
                    ClientError::Configuration {
                        message: "client certificate/key are not valid PEM".to_string(),
                    },
                )?;
                builder = builder.identity(identity);
                None
            }
        };

        let http = builder.build().change_context(ClientError::Configuration {
            message: "failed to build HTTP client".to_string(),
        })?;

        Ok(Self {
            http,
            api_url: config.api_url,
            bearer,
        })
    }

    /// Issue a single call against the cluster API.
    ///
    /// Resolves with the parsed JSON body on any status <= 299. Transport
    /// failures are retried up to [`MAX_TRANSPORT_RETRIES`] additional times
    /// with exponential backoff; HTTP error responses are never retried.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Api`] on a non-2xx response (status and raw body)
    /// - [`ClientError::Transport`] once the retry budget is exhausted
    pub async fn request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, Report<ClientError>> {
        let url = format!("{}{}", self.api_url, path);

        let mut delay = INITIAL_BACKOFF;
        let mut attempt: u32 = 0;
        let response = loop {
            attempt += 1;
            match self.send(&url, &options).await {
                Ok(response) => break response,
                Err(err) if attempt <= MAX_TRANSPORT_RETRIES => {
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transport failure, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    return Err(Report::new(ClientError::Transport {
                        message: err.to_string(),
                    }));
                }
            }
        };

        let status = response.status().as_u16();
        if status > 299 {
            let body = response.text().await.unwrap_or_default();
            return Err(Report::new(ClientError::Api { status, body }));
        }

        let text = response
            .text()
            .await
            .map_err(|err| Report::new(ClientError::Transport {
                message: err.to_string(),
            }))?;
        if text.trim().is_empty() {
            // DELETE and some PATCH calls come back bodyless
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).change_context(ClientError::Decode {
            message: format!("{url} returned a non-JSON body"),
        })
    }

    /// Open a long-lived watch stream.
    ///
    /// The returned stream has no body timeout and ends when the server
    /// closes the connection or the supplied token is cancelled. Stream
    /// opens are not retried here; the consumer restarts from scratch.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Api`] if the initial response is non-2xx
    /// - [`ClientError::Transport`] if the connection cannot be established
    pub async fn stream(
        &self,
        path: &str,
        signal: CancellationToken,
        headers: HeaderMap,
    ) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, Report<ClientError>> {
        let url = format!("{}{}", self.api_url, path);
        debug!(url = %url, "opening watch stream");

        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json;stream=watch");
        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, bearer.clone());
        }
        for (name, value) in headers.iter() {
            request = request.header(name, value.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|err| Report::new(ClientError::Transport {
                message: err.to_string(),
            }))?;

        let status = response.status().as_u16();
        if status > 299 {
            let body = response.text().await.unwrap_or_default();
            return Err(Report::new(ClientError::Api { status, body }));
        }

        Ok(response
            .bytes_stream()
            .take_until(signal.cancelled_owned())
            .boxed())
    }

    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .http
            .request(options.method.clone(), url)
            .header(ACCEPT, "application/json");

        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, bearer.clone());
        }

        if let Some(body) = &options.body {
            if !options.headers.contains_key(CONTENT_TYPE) {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body.to_string());
        }

        for (name, value) in options.headers.iter() {
            request = request.header(name, value.clone());
        }

        request.send().await
    }
}
