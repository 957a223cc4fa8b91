pub mod log;
pub mod prometheus;
pub mod statsd;

use std::sync::Arc;

use crate::probe::Readings;
use crate::procscan::ServerProcessCollection;

use self::log::LogEmitter;
use self::prometheus::PrometheusEmitter;
use self::statsd::StatsdEmitter;

/// The metric name for the worker gauge. Servers that serve from
/// threads instead of forked workers report the same number under a
/// different name.
pub fn worker_metric_name(use_threads: bool) -> &'static str {
    if use_threads {
        "threads.count"
    } else {
        "worker.count"
    }
}

/// Emitter dispatches metric events to one configured backend.
pub enum Emitter {
    Statsd(StatsdEmitter),
    Prometheus(Arc<PrometheusEmitter>),
    Log(LogEmitter),
}

impl Emitter {
    /// Returns the emitter name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Statsd(_) => "statsd",
            Self::Prometheus(_) => "prometheus",
            Self::Log(_) => "log",
        }
    }

    /// Publish the readings gathered by a socket tick.
    pub fn emit_socket(&self, readings: &Readings, worker_count: u64, use_threads: bool) {
        match self {
            Self::Statsd(e) => e.emit_socket(readings, worker_count, use_threads),
            Self::Prometheus(e) => e.emit_socket(readings, worker_count),
            Self::Log(e) => e.emit_socket(readings, worker_count),
        }
    }

    /// Publish the result of a worker tick. `collection` is present only
    /// when memory stats were collected this tick; `uss_available` says
    /// whether the USS fields are meaningful.
    pub fn emit_workers(
        &self,
        worker_count: u64,
        use_threads: bool,
        collection: Option<&ServerProcessCollection>,
        uss_available: bool,
    ) {
        match self {
            Self::Statsd(e) => e.emit_workers(worker_count, use_threads, collection, uss_available),
            Self::Prometheus(e) => e.emit_workers(worker_count, collection, uss_available),
            Self::Log(e) => e.emit_workers(worker_count, use_threads, collection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_metric_name() {
        assert_eq!(worker_metric_name(false), "worker.count");
        assert_eq!(worker_metric_name(true), "threads.count");
    }
}
