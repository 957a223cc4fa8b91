use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the drainspout agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Where socket stats come from: `netlink`, `proc_net`, or
    /// `raindrops`. Default: proc_net.
    #[serde(default)]
    pub socket_stats_mode: SocketStatsMode,

    /// How the worker count is obtained. Derived when absent: `static`
    /// iff static-worker-count is positive, else `socket_inode`.
    #[serde(default)]
    pub worker_count_mode: Option<WorkerCountMode>,

    /// TCP port the observed server listens on. Default: 3000.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Root of the proc filesystem. Default: /proc.
    #[serde(default = "default_proc_directory")]
    pub proc_directory: PathBuf,

    /// Socket-tick period in milliseconds. Default: 500.
    #[serde(default = "default_frequency_ms")]
    pub frequency_ms: u64,

    /// Worker-tick period in milliseconds. Default: 60000.
    #[serde(default = "default_worker_frequency_ms")]
    pub worker_frequency_ms: u64,

    /// Raindrops middleware URL; required in raindrops mode.
    #[serde(default)]
    pub raindrops_url: String,

    /// Emit `threads.count` instead of `worker.count`. Default: false.
    #[serde(default)]
    pub use_threads: bool,

    /// Fixed worker count used by the `static` worker-count mode.
    #[serde(default)]
    pub static_worker_count: u64,

    /// Collect per-worker RSS/PSS/USS/anonymous memory. Default: false.
    #[serde(default)]
    pub memory_stats_enabled: bool,

    /// Metric emitter configuration.
    #[serde(default)]
    pub emitters: EmittersConfig,

    /// Kubernetes pod name tag. Defaults from $POD_NAME.
    #[serde(default = "default_pod_name")]
    pub pod_name: String,

    /// Kubernetes namespace tag. Defaults from $POD_NAMESPACE.
    #[serde(default = "default_pod_namespace")]
    pub pod_namespace: String,

    /// Project tag. Defaults from $PROJECT.
    #[serde(default = "default_project")]
    pub project: String,
}

/// Source of the socket-level metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketStatsMode {
    Netlink,
    #[default]
    ProcNet,
    Raindrops,
}

impl SocketStatsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netlink => "netlink",
            Self::ProcNet => "proc_net",
            Self::Raindrops => "raindrops",
        }
    }
}

/// Source of the worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCountMode {
    SocketInode,
    Static,
}

impl WorkerCountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SocketInode => "socket_inode",
            Self::Static => "static",
        }
    }
}

/// Metric emitter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmittersConfig {
    /// StatsD (DogStatsD) emitter configuration.
    #[serde(default)]
    pub statsd: StatsdConfig,

    /// Prometheus emitter configuration.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Log every scan's readings at info level. Default: false.
    #[serde(default)]
    pub log_metrics: bool,
}

/// StatsD emitter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsdConfig {
    /// Enable the StatsD emitter. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// StatsD agent host.
    #[serde(default)]
    pub host: String,

    /// StatsD agent UDP port. Default: 8125.
    #[serde(default = "default_statsd_port")]
    pub port: u16,

    /// Metric namespace prefix. Default: "unicorn.raingutter.agg.".
    #[serde(default = "default_statsd_namespace")]
    pub namespace: String,

    /// Extra default tags, each "key:value" or a bare value.
    #[serde(default)]
    pub extra_tags: Vec<String>,
}

/// Prometheus emitter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrometheusConfig {
    /// Enable the Prometheus /metrics server. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":8000".
    #[serde(default = "default_prometheus_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_proc_directory() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_frequency_ms() -> u64 {
    500
}

fn default_worker_frequency_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_statsd_port() -> u16 {
    8125
}

fn default_statsd_namespace() -> String {
    "unicorn.raingutter.agg.".to_string()
}

fn default_prometheus_addr() -> String {
    ":8000".to_string()
}

fn default_pod_name() -> String {
    std::env::var("POD_NAME").unwrap_or_default()
}

fn default_pod_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_default()
}

fn default_project() -> String {
    std::env::var("PROJECT").unwrap_or_default()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            socket_stats_mode: SocketStatsMode::default(),
            worker_count_mode: None,
            server_port: default_server_port(),
            proc_directory: default_proc_directory(),
            frequency_ms: default_frequency_ms(),
            worker_frequency_ms: default_worker_frequency_ms(),
            raindrops_url: String::new(),
            use_threads: false,
            static_worker_count: 0,
            memory_stats_enabled: false,
            emitters: EmittersConfig::default(),
            pod_name: default_pod_name(),
            pod_namespace: default_pod_namespace(),
            project: default_project(),
        }
    }
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: default_statsd_port(),
            namespace: default_statsd_namespace(),
            extra_tags: Vec::new(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_prometheus_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            bail!("server-port must be nonzero");
        }

        if self.frequency_ms == 0 {
            bail!("frequency-ms must be positive");
        }

        if self.worker_frequency_ms == 0 {
            bail!("worker-frequency-ms must be positive");
        }

        if self.socket_stats_mode == SocketStatsMode::Raindrops && self.raindrops_url.is_empty() {
            bail!("raindrops-url is required in raindrops mode");
        }

        if self.emitters.statsd.enabled && self.emitters.statsd.host.is_empty() {
            bail!("emitters.statsd.host is required when statsd is enabled");
        }

        Ok(())
    }

    /// The worker-count mode after applying the derivation rule.
    pub fn effective_worker_count_mode(&self) -> WorkerCountMode {
        match self.worker_count_mode {
            Some(mode) => mode,
            None if self.static_worker_count > 0 => WorkerCountMode::Static,
            None => WorkerCountMode::SocketInode,
        }
    }

    pub fn socket_period(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    pub fn worker_period(&self) -> Duration {
        Duration::from_millis(self.worker_frequency_ms)
    }
}
