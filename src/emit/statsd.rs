use std::net::UdpSocket;

use anyhow::{Context, Result};
use cadence::{
    BufferedUdpMetricSink, Distributed, Histogrammed, QueuingMetricSink, StatsdClient,
};
use tracing::warn;

use crate::config::Config;
use crate::probe::Readings;
use crate::procscan::{ServerProcess, ServerProcessCollection};

use super::worker_metric_name;

/// DogStatsD emitter.
///
/// Readings go out as histograms so the agent side computes the
/// statistical distribution (p95, max, median, avg, count) over the
/// flush window; per-process memory goes out as tagged distributions.
pub struct StatsdEmitter {
    client: StatsdClient,
}

impl StatsdEmitter {
    pub fn new(cfg: &Config) -> Result<Self> {
        let statsd = &cfg.emitters.statsd;

        let socket = UdpSocket::bind("0.0.0.0:0").context("binding statsd UDP socket")?;
        socket
            .set_nonblocking(true)
            .context("setting statsd socket non-blocking")?;

        let sink = BufferedUdpMetricSink::from((statsd.host.as_str(), statsd.port), socket)
            .context("connecting statsd sink")?;
        let sink = QueuingMetricSink::from(sink);

        let mut builder = StatsdClient::builder(statsd.namespace.trim_end_matches('.'), sink)
            .with_error_handler(|e| warn!(error = %e, "statsd send failed"));

        if !cfg.pod_name.is_empty() {
            builder = builder.with_tag("pod_name", &cfg.pod_name);
        }
        if !cfg.pod_namespace.is_empty() {
            builder = builder.with_tag("pod_namespace", &cfg.pod_namespace);
        }
        if !cfg.project.is_empty() {
            builder = builder.with_tag("project", &cfg.project);
        }

        for tag in &statsd.extra_tags {
            match tag.split_once(':') {
                Some((key, value)) => builder = builder.with_tag(key, value),
                None => builder = builder.with_tag_value(tag),
            }
        }

        Ok(Self {
            client: builder.build(),
        })
    }

    pub fn emit_socket(&self, readings: &Readings, worker_count: u64, use_threads: bool) {
        self.client
            .histogram_with_tags("calling", readings.calling)
            .send();
        self.client
            .histogram_with_tags("writing", readings.writing)
            .send();
        self.client
            .histogram_with_tags("queued", readings.queued)
            .send();
        self.client
            .histogram_with_tags("active", readings.active)
            .send();
        self.client
            .histogram_with_tags(worker_metric_name(use_threads), worker_count)
            .send();
    }

    pub fn emit_workers(
        &self,
        worker_count: u64,
        use_threads: bool,
        collection: Option<&ServerProcessCollection>,
        uss_available: bool,
    ) {
        self.client
            .histogram_with_tags(worker_metric_name(use_threads), worker_count)
            .send();

        if let Some(collection) = collection {
            for proc in &collection.processes {
                self.emit_process(proc, uss_available);
            }
        }
    }

    fn emit_process(&self, proc: &ServerProcess, uss_available: bool) {
        let ismaster = if proc.is_master { "true" } else { "false" };
        let index = proc.index.to_string();

        self.client
            .distribution_with_tags("process.rss", proc.rss)
            .with_tag("ismaster", ismaster)
            .with_tag("index", &index)
            .send();
        self.client
            .distribution_with_tags("process.pss", proc.pss)
            .with_tag("ismaster", ismaster)
            .with_tag("index", &index)
            .send();
        self.client
            .distribution_with_tags("process.anon", proc.anon)
            .with_tag("ismaster", ismaster)
            .with_tag("index", &index)
            .send();

        // Without pagemap privilege USS was never computed; emitting a
        // zero would read as a real measurement.
        if uss_available {
            self.client
                .distribution_with_tags("process.uss", proc.uss)
                .with_tag("ismaster", ismaster)
                .with_tag("index", &index)
                .send();
        }
    }
}
