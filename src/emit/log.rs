use tracing::{debug, info};

use crate::probe::Readings;
use crate::procscan::ServerProcessCollection;

use super::worker_metric_name;

/// Emits every scan's readings as structured log lines. Meant for
/// environments without a metrics backend, or for debugging the agent
/// itself.
pub struct LogEmitter;

impl LogEmitter {
    pub fn emit_socket(&self, readings: &Readings, worker_count: u64) {
        info!(
            active = readings.active,
            queued = readings.queued,
            writing = readings.writing,
            calling = readings.calling,
            workers = worker_count,
            "socket metrics",
        );
    }

    pub fn emit_workers(
        &self,
        worker_count: u64,
        use_threads: bool,
        collection: Option<&ServerProcessCollection>,
    ) {
        info!(
            metric = worker_metric_name(use_threads),
            count = worker_count,
            "worker metrics",
        );

        let Some(collection) = collection else {
            return;
        };

        for proc in &collection.processes {
            debug!(
                pid = proc.pid,
                is_master = proc.is_master,
                index = proc.index,
                rss = proc.rss,
                pss = proc.pss,
                uss = proc.uss,
                anon = proc.anon,
                "process memory",
            );
        }
    }
}
