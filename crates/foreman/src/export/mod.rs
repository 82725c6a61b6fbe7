//! Continuous event export.
//!
//! Consumes a live cluster watch stream of namespace events as NDJSON,
//! groups the complete lines of each network read by their subject, and
//! forwards each group to the downstream sink. Forwarding is
//! fire-and-continue: one group's delivery failure never blocks its
//! siblings or the stream. When the watch connection drops, the pipeline
//! tears itself down and opens a fresh one after a short pause, until
//! cancellation is requested.

pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use api_types::EventLabels;
use bytes::Buf;
use bytes::BytesMut;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::export::sink::SinkClient;
use crate::export::sink::SinkError;
use crate::k8s::client::ApiClient;

const RESTART_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("event sink failed its liveness probe")]
    SinkUnavailable,
    #[error("failed to open the event watch stream")]
    WatchStream,
}

/// Outcome of forwarding one event group.
#[derive(Debug)]
pub struct ForwardReport {
    pub labels: EventLabels,
    pub forwarded: usize,
    pub outcome: Result<(), Report<SinkError>>,
}

/// One complete watch line: the raw text as read from the wire, which is
/// what gets forwarded, and the label triple extracted from it.
#[derive(Debug)]
struct WatchLine {
    raw: String,
    labels: EventLabels,
}

/// The export pipeline for one namespace.
pub struct EventExporter {
    client: Arc<ApiClient>,
    sink: SinkClient,
    namespace: String,
}

impl EventExporter {
    pub fn new(client: Arc<ApiClient>, sink: SinkClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            sink,
            namespace: namespace.into(),
        }
    }

    /// Probe the sink, then pump watch connections until cancelled.
    ///
    /// # Errors
    ///
    /// [`ExportError::SinkUnavailable`] when the startup probe fails; after
    /// that point stream faults restart the pipeline instead of erroring.
    pub async fn run(self, signal: CancellationToken) -> Result<(), Report<ExportError>> {
        self.sink
            .probe()
            .await
            .change_context(ExportError::SinkUnavailable)?;
        info!(namespace = %self.namespace, "event export started");

        loop {
            if let Err(err) = self.pump(signal.clone()).await {
                warn!(error = ?err, "event watch stream failed, restarting");
            }
            if signal.is_cancelled() {
                info!("event export stopped");
                return Ok(());
            }
            tokio::time::sleep(RESTART_PAUSE).await;
        }
    }

    /// One watch connection: open the stream and flush every network read
    /// as a batch of grouped forwards.
    async fn pump(&self, signal: CancellationToken) -> Result<(), Report<ExportError>> {
        let path = format!(
            "/apis/events.k8s.io/v1/namespaces/{}/events?watch=1",
            self.namespace
        );
        let mut stream = self
            .client
            .stream(&path, signal, HeaderMap::new())
            .await
            .change_context(ExportError::WatchStream)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.change_context(ExportError::WatchStream)?;
            buffer.extend_from_slice(&chunk);

            let lines = parse_lines(drain_lines(&mut buffer));
            if lines.is_empty() {
                continue;
            }
            for report in self.forward_batch(lines).await {
                match &report.outcome {
                    Ok(()) => info!(
                        labels = ?report.labels,
                        forwarded = report.forwarded,
                        "event group delivered"
                    ),
                    Err(err) => warn!(
                        labels = ?report.labels,
                        error = ?err,
                        "event group delivery failed"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Forward every group of one flush batch, settling all of them.
    async fn forward_batch(&self, lines: Vec<WatchLine>) -> Vec<ForwardReport> {
        let groups = group_events(lines);
        join_all(groups.into_iter().map(|(labels, group)| async move {
            let outcome = self.sink.forward(&labels, &group).await;
            ForwardReport {
                labels,
                forwarded: group.len(),
                outcome,
            }
        }))
        .await
    }
}

/// Split off every complete line, leaving a trailing partial line in the
/// buffer for the next read.
fn drain_lines(buffer: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
        let line = buffer.split_to(pos);
        buffer.advance(1);
        let line = String::from_utf8_lossy(&line).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Extract labels from each watch line, skipping (and logging) anything
/// that is not JSON. The raw text is kept untouched; the parsed form is
/// only used for labelling, so the sink receives the lines byte for byte.
fn parse_lines(lines: Vec<String>) -> Vec<WatchLine> {
    lines
        .into_iter()
        .filter_map(|raw| match serde_json::from_str::<Value>(&raw) {
            Ok(event) => Some(WatchLine {
                labels: labels_of(&event),
                raw,
            }),
            Err(err) => {
                warn!(error = %err, line = %raw, "skipping malformed watch line");
                None
            }
        })
        .collect()
}

/// Label triple of one watch event: the watch type, the subject's name
/// (preferring `regarding.name` over `metadata.name`), and the subject
/// kind.
fn labels_of(event: &Value) -> EventLabels {
    let object = &event["object"];
    EventLabels {
        event_type: event["type"].as_str().map(String::from),
        name: object["regarding"]["name"]
            .as_str()
            .or_else(|| object["metadata"]["name"].as_str())
            .map(String::from),
        resource: object["regarding"]["kind"].as_str().map(String::from),
    }
}

/// Group a flush batch by label triple, preserving first-seen order.
fn group_events(lines: Vec<WatchLine>) -> Vec<(EventLabels, Vec<String>)> {
    let mut groups: Vec<(EventLabels, Vec<String>)> = Vec::new();
    for line in lines {
        match groups
            .iter_mut()
            .find(|(existing, _)| *existing == line.labels)
        {
            Some((_, group)) => group.push(line.raw),
            None => groups.push((line.labels, vec![line.raw])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::k8s::client::ClientConfig;
    use crate::k8s::client::ClusterAuth;
    use crate::k8s::testutil::FixtureServer;
    use crate::k8s::testutil::Reply;

    fn client_for(server: &FixtureServer) -> Arc<ApiClient> {
        Arc::new(
            ApiClient::new(ClientConfig {
                api_url: server.url(),
                ca_cert_pem: None,
                auth: ClusterAuth::BearerToken("fake-token".to_string()),
                allow_self_signed: true,
            })
            .unwrap(),
        )
    }

    fn watch_line(event_type: &str, name: &str, kind: &str) -> Value {
        json!({
            "type": event_type,
            "object": {
                "regarding": { "name": name, "kind": kind },
                "metadata": { "name": format!("{name}.18a") },
            }
        })
    }

    #[test]
    fn drain_lines_keeps_a_trailing_partial_line() {
        let mut buffer = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\n{\"c\""[..]);

        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(&buffer[..], b"{\"c\"");

        buffer.extend_from_slice(b":3}\n");
        assert_eq!(drain_lines(&mut buffer), vec!["{\"c\":3}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let events = parse_lines(vec![
            "{\"type\":\"ADDED\"}".to_string(),
            "not json at all".to_string(),
            "{\"type\":\"DELETED\"}".to_string(),
        ]);
        assert_eq!(events.len(), 2);
    }

    fn lines_from(events: &[Value]) -> Vec<WatchLine> {
        parse_lines(events.iter().map(Value::to_string).collect())
    }

    #[test]
    fn identical_label_triples_share_one_group() {
        let lines = lines_from(&[
            watch_line("ADDED", "web-5d4f-a", "Pod"),
            watch_line("ADDED", "web-5d4f-a", "Pod"),
        ]);
        let groups = group_events(lines);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn any_differing_label_splits_the_group() {
        let lines = lines_from(&[
            watch_line("ADDED", "web-5d4f-a", "Pod"),
            watch_line("MODIFIED", "web-5d4f-a", "Pod"),
            watch_line("ADDED", "web-5d4f-b", "Pod"),
            watch_line("ADDED", "web-5d4f-a", "Service"),
        ]);
        let groups = group_events(lines);
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn grouping_preserves_the_raw_line_text() {
        // Whitespace and key order of the incoming line must survive into
        // the group untouched.
        let raw = "{\"type\": \"ADDED\", \"object\": {\"regarding\": {\"name\": \"a\"}}}";
        let lines = parse_lines(vec![raw.to_string()]);
        let groups = group_events(lines);
        assert_eq!(groups[0].1, vec![raw.to_string()]);
    }

    #[test]
    fn subject_name_prefers_regarding_over_metadata() {
        let labels = labels_of(&watch_line("ADDED", "web-5d4f-a", "Pod"));
        assert_eq!(labels.name.as_deref(), Some("web-5d4f-a"));

        let bare = json!({
            "type": "ADDED",
            "object": { "metadata": { "name": "fallback" } },
        });
        assert_eq!(labels_of(&bare).name.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn a_failed_probe_stops_startup() {
        let sink_server = FixtureServer::spawn(vec![(
            "GET /",
            Reply::Json {
                status: 503,
                body: String::new(),
            },
        )])
        .await;
        let cluster = FixtureServer::spawn(vec![]).await;

        let exporter = EventExporter::new(
            client_for(&cluster),
            SinkClient::new(sink_server.url()).unwrap(),
            "default",
        );
        let err = exporter.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err.current_context(),
            ExportError::SinkUnavailable
        ));
        assert_eq!(cluster.total_requests(), 0);
    }

    #[tokio::test]
    async fn one_groups_failure_does_not_block_its_siblings() {
        let sink_server = FixtureServer::spawn(vec![(
            "POST /events",
            Reply::Json {
                status: 500,
                body: String::new(),
            },
        )])
        .await;
        let cluster = FixtureServer::spawn(vec![]).await;
        let exporter = EventExporter::new(
            client_for(&cluster),
            SinkClient::new(sink_server.url()).unwrap(),
            "default",
        );

        let lines = lines_from(&[
            watch_line("ADDED", "web-5d4f-a", "Pod"),
            watch_line("DELETED", "web-5d4f-b", "Pod"),
        ]);
        let reports = exporter.forward_batch(lines).await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| report.outcome.is_err()));
        assert_eq!(sink_server.hits("POST /events"), 2);
    }

    #[tokio::test]
    async fn events_are_forwarded_as_raw_line_strings() {
        let sink_server = FixtureServer::spawn(vec![(
            "POST /events",
            Reply::Json {
                status: 204,
                body: String::new(),
            },
        )])
        .await;
        let cluster = FixtureServer::spawn(vec![]).await;
        let exporter = EventExporter::new(
            client_for(&cluster),
            SinkClient::new(sink_server.url()).unwrap(),
            "default",
        );

        let raw = watch_line("ADDED", "web-5d4f-a", "Pod").to_string();
        exporter
            .forward_batch(parse_lines(vec![raw.clone()]))
            .await;

        let delivery = sink_server.last_request("POST /events").unwrap();
        let sent: Value = serde_json::from_str(&delivery.body).unwrap();
        let event = &sent["events"][0];
        assert!(event.is_string(), "expected a raw JSON string: {event}");
        assert_eq!(event.as_str().unwrap(), raw);
    }

    #[test_log::test(tokio::test)]
    async fn a_watch_connection_is_flushed_group_by_group() {
        let lines = format!(
            "{}\n{}\n{}\n",
            watch_line("ADDED", "web-5d4f-a", "Pod"),
            watch_line("ADDED", "web-5d4f-a", "Pod"),
            watch_line("DELETED", "web-5d4f-b", "Pod"),
        );
        let cluster = FixtureServer::spawn(vec![(
            "GET /apis/events.k8s.io/v1/namespaces/default/events?watch=1",
            Reply::Json {
                status: 200,
                body: lines,
            },
        )])
        .await;
        let sink_server = FixtureServer::spawn(vec![(
            "POST /events",
            Reply::Json {
                status: 204,
                body: String::new(),
            },
        )])
        .await;

        let exporter = EventExporter::new(
            client_for(&cluster),
            SinkClient::new(sink_server.url()).unwrap(),
            "default",
        );
        exporter.pump(CancellationToken::new()).await.unwrap();

        // two distinct label triples in one flush batch
        assert_eq!(sink_server.hits("POST /events"), 2);
        let delivery = sink_server.last_request("POST /events").unwrap();
        let sent: Value = serde_json::from_str(&delivery.body).unwrap();
        assert_eq!(sent["labels"]["eventType"], "DELETED");
        assert_eq!(sent["events"].as_array().unwrap().len(), 1);
    }
}
