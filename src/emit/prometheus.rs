use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::probe::Readings;
use crate::procscan::ServerProcessCollection;

/// Prometheus emitter: the unicorn metric family plus agent health
/// metrics, served from one registry over HTTP.
pub struct PrometheusEmitter {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Label values applied to every unicorn metric, in label order:
    /// pod_name, project, pod_namespace.
    identity: [String; 3],

    // === Unicorn metrics ===
    /// Observed active-connection counts.
    active: HistogramVec,
    /// Observed accept-queue depths.
    queued: HistogramVec,
    /// Current worker count.
    workers: GaugeVec,
    /// Per-process resident set size in bytes.
    process_rss: GaugeVec,
    /// Per-process proportional set size in bytes.
    process_pss: GaugeVec,
    /// Per-process unique set size in bytes.
    process_uss: GaugeVec,
    /// Per-process anonymous bytes.
    process_anon: GaugeVec,

    // === Agent health ===
    /// Completed ticks by kind (socket/worker).
    ticks_total: CounterVec,
    /// Probe failures by source.
    probe_errors_total: CounterVec,
    /// Processes found holding the listener in the last scan.
    processes_tracked: Gauge,
    /// Process scan latency.
    scan_duration: Histogram,
}

impl PrometheusEmitter {
    /// Creates a new emitter with all metrics registered.
    pub fn new(cfg: &Config) -> Result<Self> {
        let registry = Registry::new();

        let identity_labels = &["pod_name", "project", "pod_namespace"];
        let process_labels = &["ismaster", "index"];

        let active = HistogramVec::new(
            HistogramOpts::new("active", "Active clients on the observed listener.")
                .namespace("unicorn")
                .subsystem("raindrops")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
            identity_labels,
        )?;
        let queued = HistogramVec::new(
            HistogramOpts::new("queued", "Queued (pre-accept) clients on the observed listener.")
                .namespace("unicorn")
                .subsystem("raindrops")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
            identity_labels,
        )?;
        let workers = GaugeVec::new(
            Opts::new("worker", "Provisioned worker count.")
                .namespace("unicorn")
                .subsystem("raindrops"),
            identity_labels,
        )?;

        let process_rss = GaugeVec::new(
            Opts::new("process_rss_bytes", "Per-process resident set size.")
                .namespace("unicorn")
                .subsystem("raindrops"),
            process_labels,
        )?;
        let process_pss = GaugeVec::new(
            Opts::new("process_pss_bytes", "Per-process proportional set size.")
                .namespace("unicorn")
                .subsystem("raindrops"),
            process_labels,
        )?;
        let process_uss = GaugeVec::new(
            Opts::new("process_uss_bytes", "Per-process unique set size.")
                .namespace("unicorn")
                .subsystem("raindrops"),
            process_labels,
        )?;
        let process_anon = GaugeVec::new(
            Opts::new("process_anon_bytes", "Per-process anonymous memory.")
                .namespace("unicorn")
                .subsystem("raindrops"),
            process_labels,
        )?;

        let ticks_total = CounterVec::new(
            Opts::new("ticks_total", "Completed ticks by kind.").namespace("drainspout"),
            &["kind"],
        )?;
        let probe_errors_total = CounterVec::new(
            Opts::new("probe_errors_total", "Probe failures by source.").namespace("drainspout"),
            &["source"],
        )?;
        let processes_tracked = Gauge::with_opts(
            Opts::new(
                "processes_tracked",
                "Processes holding the listener in the last scan.",
            )
            .namespace("drainspout"),
        )?;
        let scan_duration = Histogram::with_opts(
            HistogramOpts::new("scan_duration_seconds", "Process scan latency.")
                .namespace("drainspout")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(queued.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(process_rss.clone()))?;
        registry.register(Box::new(process_pss.clone()))?;
        registry.register(Box::new(process_uss.clone()))?;
        registry.register(Box::new(process_anon.clone()))?;
        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(probe_errors_total.clone()))?;
        registry.register(Box::new(processes_tracked.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;

        Ok(Self {
            registry,
            addr: cfg.emitters.prometheus.addr.clone(),
            shutdown: parking_lot::Mutex::new(None),
            identity: [
                cfg.pod_name.clone(),
                cfg.project.clone(),
                cfg.pod_namespace.clone(),
            ],
            active,
            queued,
            workers,
            process_rss,
            process_pss,
            process_uss,
            process_anon,
            ticks_total,
            probe_errors_total,
            processes_tracked,
            scan_duration,
        })
    }

    fn identity_labels(&self) -> [&str; 3] {
        [&self.identity[0], &self.identity[1], &self.identity[2]]
    }

    pub fn emit_socket(&self, readings: &Readings, worker_count: u64) {
        let labels = self.identity_labels();
        self.active
            .with_label_values(&labels)
            .observe(readings.active as f64);
        self.queued
            .with_label_values(&labels)
            .observe(readings.queued as f64);
        self.workers
            .with_label_values(&labels)
            .set(worker_count as f64);
    }

    pub fn emit_workers(
        &self,
        worker_count: u64,
        collection: Option<&ServerProcessCollection>,
        uss_available: bool,
    ) {
        self.workers
            .with_label_values(&self.identity_labels())
            .set(worker_count as f64);

        let Some(collection) = collection else {
            return;
        };

        for proc in &collection.processes {
            let ismaster = if proc.is_master { "true" } else { "false" };
            let index = proc.index.to_string();
            let labels = [ismaster, index.as_str()];

            self.process_rss
                .with_label_values(&labels)
                .set(proc.rss as f64);
            self.process_pss
                .with_label_values(&labels)
                .set(proc.pss as f64);
            self.process_anon
                .with_label_values(&labels)
                .set(proc.anon as f64);
            if uss_available {
                self.process_uss
                    .with_label_values(&labels)
                    .set(proc.uss as f64);
            }
        }
    }

    pub fn record_tick(&self, kind: &str) {
        self.ticks_total.with_label_values(&[kind]).inc();
    }

    pub fn record_probe_error(&self, source: &str) {
        self.probe_errors_total.with_label_values(&[source]).inc();
    }

    pub fn record_scan_duration(&self, elapsed: Duration) {
        self.scan_duration.observe(elapsed.as_secs_f64());
    }

    pub fn set_processes_tracked(&self, count: usize) {
        self.processes_tracked.set(count as f64);
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Handle the ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "prometheus metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "prometheus metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_emitter() -> PrometheusEmitter {
        let cfg = Config {
            pod_name: "pod-1".to_string(),
            pod_namespace: "apps".to_string(),
            project: "storefront".to_string(),
            ..Default::default()
        };
        PrometheusEmitter::new(&cfg).expect("create emitter")
    }

    fn gauge_value(emitter: &PrometheusEmitter, name: &str) -> Option<f64> {
        emitter
            .registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .and_then(|mf| mf.get_metric().first().map(|m| m.get_gauge().get_value()))
    }

    #[test]
    fn test_emit_socket_sets_worker_gauge() {
        let emitter = test_emitter();
        let readings = Readings {
            active: 3,
            queued: 1,
            ..Default::default()
        };

        emitter.emit_socket(&readings, 16);

        assert_eq!(
            gauge_value(&emitter, "unicorn_raindrops_worker"),
            Some(16.0),
        );
    }

    #[test]
    fn test_emit_workers_without_collection() {
        let emitter = test_emitter();
        emitter.emit_workers(4, None, false);

        assert_eq!(gauge_value(&emitter, "unicorn_raindrops_worker"), Some(4.0));
        // No per-process series without a collection.
        assert!(gauge_value(&emitter, "unicorn_raindrops_process_rss_bytes").is_none());
    }

    #[test]
    fn test_health_counters() {
        let emitter = test_emitter();
        emitter.record_tick("socket");
        emitter.record_tick("socket");
        emitter.record_probe_error("netlink");
        emitter.set_processes_tracked(5);

        assert_eq!(gauge_value(&emitter, "drainspout_processes_tracked"), Some(5.0));

        let families = emitter.registry.gather();
        let ticks = families
            .iter()
            .find(|mf| mf.get_name() == "drainspout_ticks_total")
            .expect("ticks family");
        assert_eq!(ticks.get_metric()[0].get_counter().get_value(), 2.0);
    }
}
