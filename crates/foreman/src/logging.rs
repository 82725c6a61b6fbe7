//! Global tracing setup for the foreman binary.

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Directives applied when `RUST_LOG` is unset. Connection-level chatter
/// from the HTTP stack is capped at WARN so watch reconnects stay readable.
const DEFAULT_DIRECTIVES: &str = "info,hyper_util=warn,reqwest=warn";

/// Install the global subscriber, formatting to stderr.
pub(crate) fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}
