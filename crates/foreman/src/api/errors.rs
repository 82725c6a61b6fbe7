use core::error::Error;

use error_stack::Report;
use poem::http::StatusCode;
use poem::Response;
use serde_json::json;

use crate::k8s::client::ClientError;
use crate::k8s::provider::ProviderError;

/// Façade server errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Map a provider failure to an HTTP response with a `{code, message}`
/// body. Not-found conditions become 404, validation failures 400, and
/// cluster authentication refusals keep their original status; everything
/// else is a 500.
pub(crate) fn provider_error(err: Report<ProviderError>) -> poem::Error {
    let (status, code) = match err.current_context() {
        ProviderError::MissingMachine { .. } => (404, "FOREMAN_MISSING_MACHINE"),
        ProviderError::NonExistentHpa { .. } => (404, "FOREMAN_NONEXISTENT_HPA"),
        ProviderError::EmptyLabelSelector => (400, "FOREMAN_EMPTY_LABEL_SELECTOR"),
        ProviderError::EmptyServiceList => (400, "FOREMAN_EMPTY_SERVICE_LIST"),
        ProviderError::Malformed { .. } => (400, "FOREMAN_MALFORMED_RESOURCE"),
        ProviderError::Cluster | ProviderError::Resolution => {
            match err.downcast_ref::<ClientError>().and_then(ClientError::status) {
                Some(status @ (401 | 403)) => (status, "FOREMAN_CLUSTER_DENIED"),
                _ => (500, "FOREMAN_CLUSTER_FAILURE"),
            }
        }
    };

    let body = json!({
        "code": code,
        "message": err.current_context().to_string(),
    });
    poem::Error::from_response(
        Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .content_type("application/json")
            .body(body.to_string()),
    )
}
