//! Downstream event sink client.

use api_types::EventLabels;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink is unreachable: {message}")]
    Unreachable { message: String },
    #[error("event sink rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("failed to build the sink HTTP client")]
    Configuration,
}

/// HTTP client for the event sink: a liveness probe at `/` and an event
/// intake at `/events`.
#[derive(Clone)]
pub struct SinkClient {
    http: reqwest::Client,
    base_url: String,
}

impl SinkClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Report<SinkError>> {
        let http = reqwest::Client::builder()
            .build()
            .change_context(SinkError::Configuration)?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { http, base_url })
    }

    /// Liveness probe; any 2xx answer counts as alive.
    pub async fn probe(&self) -> Result<(), Report<SinkError>> {
        let response = self
            .http
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .map_err(|err| {
                Report::new(SinkError::Unreachable {
                    message: err.to_string(),
                })
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Report::new(SinkError::Rejected { status }));
        }
        Ok(())
    }

    /// Deliver one event group. Events are the raw watch-line strings, not
    /// re-serialized objects. Only 200 and 204 count as accepted.
    pub async fn forward(
        &self,
        labels: &EventLabels,
        events: &[String],
    ) -> Result<(), Report<SinkError>> {
        let body = json!({ "labels": labels, "events": events });
        let response = self
            .http
            .post(format!("{}/events", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                Report::new(SinkError::Unreachable {
                    message: err.to_string(),
                })
            })?;

        match response.status().as_u16() {
            200 | 204 => Ok(()),
            status => Err(Report::new(SinkError::Rejected { status })),
        }
    }
}
