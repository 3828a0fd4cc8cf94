//! Statsd metrics for the loader and the experiment harness.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro. Until
//! [`configure_statsd`] has been called, every metric is dropped.
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::ops::Deref;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, MetricSink, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches a fixed set of tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    /// Tags sent with every metric, e.g. the host name.
    global_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn new<T>(prefix: &str, sink: T, global_tags: BTreeMap<String, String>) -> Self
    where
        T: MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            global_tags,
        }
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.global_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// Reports all metrics of this process to the statsd server at `host`.
///
/// Only the first call takes effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    global_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host did not resolve to any address");
    };
    tracing::info!(%addr, prefix, "reporting metrics to statsd");

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    if METRICS_CLIENT
        .set(MetricsClient::new(prefix, sink, global_tags))
        .is_err()
    {
        tracing::warn!("statsd client was already configured");
    }
    Ok(())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    // counters
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // gauges
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // timers
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // histograms
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

#[cfg(test)]
mod tests {
    use cadence::SpyMetricSink;

    use super::prelude::*;
    use super::*;

    #[test]
    fn test_global_tags() {
        let (received, sink) = SpyMetricSink::new();
        let tags = BTreeMap::from([("host".to_owned(), "test-host".to_owned())]);
        let client = MetricsClient::new("resource_loader", sink, tags);

        client.send_metric(
            client
                .count_with_tags("loader.merged", 1)
                .with_tag("same_options", "true"),
        );

        let line = String::from_utf8(received.try_recv().unwrap()).unwrap();
        assert_eq!(
            line,
            "resource_loader.loader.merged:1|c|#same_options:true,host:test-host"
        );
    }
}
