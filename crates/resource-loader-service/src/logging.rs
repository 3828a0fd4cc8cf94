//! Structured log output shared by the binary and embedders.

use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::registry::LookupSpan;

/// A JSON-lines formatting layer.
///
/// Event fields are flattened into the top level of each line, and the fields of the
/// current span (e.g. the `url` of a load) are attached under `span`.
pub fn json_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
}
