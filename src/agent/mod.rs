use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, WorkerCountMode};
use crate::emit::log::LogEmitter;
use crate::emit::prometheus::PrometheusEmitter;
use crate::emit::statsd::StatsdEmitter;
use crate::emit::Emitter;
use crate::probe::{Prober, Readings};
use crate::procscan::{self, ServerProcessCollection};

/// Agent wires the configured prober and emitters to the tick loop and
/// owns their lifecycle.
pub struct Agent {
    cfg: Config,
    cancel: CancellationToken,
    loop_handle: Option<JoinHandle<()>>,
    prometheus: Option<Arc<PrometheusEmitter>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            loop_handle: None,
            prometheus: None,
        }
    }

    /// Start the emitters and the tick loop.
    pub async fn start(&mut self) -> Result<()> {
        let mut emitters = Vec::with_capacity(3);

        if self.cfg.emitters.statsd.enabled {
            let statsd = StatsdEmitter::new(&self.cfg).context("creating statsd emitter")?;
            emitters.push(Emitter::Statsd(statsd));
            info!(
                host = %self.cfg.emitters.statsd.host,
                port = self.cfg.emitters.statsd.port,
                "statsd emitter configured",
            );
        }

        if self.cfg.emitters.prometheus.enabled {
            let prometheus =
                Arc::new(PrometheusEmitter::new(&self.cfg).context("creating prometheus emitter")?);
            prometheus
                .start()
                .await
                .context("starting prometheus metrics server")?;
            emitters.push(Emitter::Prometheus(Arc::clone(&prometheus)));
            self.prometheus = Some(prometheus);
        }

        if self.cfg.emitters.log_metrics {
            emitters.push(Emitter::Log(LogEmitter));
        }

        if emitters.is_empty() {
            warn!("no emitters enabled; readings will be discarded");
        }

        // Netlink mode that cannot open its socket fails here, before
        // any tick runs.
        let prober = Prober::from_config(&self.cfg).context("creating socket prober")?;
        info!(
            prober = prober.name(),
            worker_count_mode = self.cfg.effective_worker_count_mode().as_str(),
            port = self.cfg.server_port,
            "socket prober ready",
        );

        let has_cap_sys_admin = if self.cfg.memory_stats_enabled {
            let has_cap = procscan::memory::has_cap_sys_admin(&self.cfg.proc_directory);
            if !has_cap {
                info!("no CAP_SYS_ADMIN; per-process USS will not be computed");
            }
            has_cap
        } else {
            false
        };

        let ticker = TickLoop {
            cfg: self.cfg.clone(),
            prober,
            emitters,
            prometheus: self.prometheus.clone(),
            readings: Readings::default(),
            worker_count: self.cfg.static_worker_count,
            has_cap_sys_admin,
        };

        self.loop_handle = Some(tokio::spawn(ticker.run(self.cancel.child_token())));

        info!("agent started");

        Ok(())
    }

    /// Stop the tick loop and release every resource it holds.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }

        if let Some(prometheus) = &self.prometheus {
            prometheus.stop().await?;
        }

        info!("agent stopped");

        Ok(())
    }
}

/// The tick loop owns every piece of per-tick mutable state. It runs on
/// a single task, so socket and worker ticks are serialized in arrival
/// order and the earlier tick's effects are fully applied before the
/// later one starts.
struct TickLoop {
    cfg: Config,
    prober: Prober,
    emitters: Vec<Emitter>,
    prometheus: Option<Arc<PrometheusEmitter>>,
    readings: Readings,
    worker_count: u64,
    has_cap_sys_admin: bool,
}

impl TickLoop {
    async fn run(mut self, cancel: CancellationToken) {
        // Prime the readings so the first worker tick already has a
        // listener inode to scan for.
        if let Err(e) = self.prober.probe(&mut self.readings).await {
            warn!(error = %e, prober = self.prober.name(), "prime probe failed");
        }

        let mut socket_tick = tokio::time::interval(self.cfg.socket_period());
        socket_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut worker_tick = tokio::time::interval(self.cfg.worker_period());
        worker_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("tick loop stopped");
                    break;
                }
                _ = socket_tick.tick() => self.socket_tick().await,
                _ = worker_tick.tick() => self.worker_tick(),
            }
        }

        // Dropping self releases the netlink socket and any proc
        // directory handles still held.
    }

    async fn socket_tick(&mut self) {
        match self.prober.probe(&mut self.readings).await {
            Ok(()) => {
                if let Some(prometheus) = &self.prometheus {
                    prometheus.record_tick("socket");
                }
                for emitter in &self.emitters {
                    emitter.emit_socket(&self.readings, self.worker_count, self.cfg.use_threads);
                }
            }
            Err(e) => {
                if let Some(prometheus) = &self.prometheus {
                    prometheus.record_probe_error(self.prober.name());
                }
                if self.prober.ready() {
                    error!(error = %e, prober = self.prober.name(), "socket probe failed");
                } else {
                    warn!(
                        error = %e,
                        prober = self.prober.name(),
                        "socket probe failed (endpoint not ready yet)",
                    );
                }
            }
        }
    }

    fn worker_tick(&mut self) {
        match self.cfg.effective_worker_count_mode() {
            WorkerCountMode::Static => {
                self.worker_count = self.cfg.static_worker_count;
                self.emit_workers(None, false);
            }
            WorkerCountMode::SocketInode => self.scan_processes(),
        }

        if let Some(prometheus) = &self.prometheus {
            prometheus.record_tick("worker");
        }
    }

    fn scan_processes(&mut self) {
        let started = Instant::now();

        let mut collection = match procscan::find_processes_listening_to_socket(
            &self.cfg.proc_directory,
            self.readings.listener_inode,
        ) {
            Ok(collection) => collection,
            Err(e) => {
                if let Some(prometheus) = &self.prometheus {
                    prometheus.record_probe_error("procscan");
                }
                error!(error = %e, "process scan failed");
                return;
            }
        };

        // USS availability is per pass: even with the capability,
        // kpagecount can fail to open, and then the USS fields were
        // never written.
        let uss_available = if self.cfg.memory_stats_enabled {
            procscan::memory::collect_memory_stats(
                &mut collection,
                &self.cfg.proc_directory,
                self.has_cap_sys_admin,
            )
        } else {
            false
        };

        self.worker_count = collection.worker_count() as u64;

        if let Some(prometheus) = &self.prometheus {
            prometheus.record_scan_duration(started.elapsed());
            prometheus.set_processes_tracked(collection.processes.len());
        }

        debug!(
            processes = collection.processes.len(),
            workers = self.worker_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "process scan complete",
        );

        let memory = self.cfg.memory_stats_enabled.then_some(&collection);
        self.emit_workers(memory, uss_available);

        // The collection drops here, closing every retained /proc
        // directory handle before the next tick builds a fresh one.
    }

    fn emit_workers(&self, collection: Option<&ServerProcessCollection>, uss_available: bool) {
        for emitter in &self.emitters {
            emitter.emit_workers(
                self.worker_count,
                self.cfg.use_threads,
                collection,
                uss_available,
            );
        }
    }
}
