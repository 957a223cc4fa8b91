pub mod netlink;
pub mod procnet;
pub mod raindrops;

use anyhow::{Context, Result as AnyhowResult};

use crate::config::{Config, SocketStatsMode};
use crate::error::Result;

use self::netlink::NetlinkProber;
use self::procnet::ProcNetProber;
use self::raindrops::{RaindropsProber, RaindropsSample};

/// Facts derived from one probe of the configured listener port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Kernel inode of the listening socket; 0 when no listener was seen.
    pub listener_inode: u64,
    /// Connections completing the handshake but not yet accepted.
    pub queue_size: u64,
    /// Sockets in a state where a server process is tied up serving them.
    pub active_workers: u64,
}

impl SocketStats {
    /// Merge per-family results: the counters sum, and the IPv4 listener
    /// inode wins when nonzero.
    pub fn combine(v4: SocketStats, v6: SocketStats) -> SocketStats {
        SocketStats {
            listener_inode: if v4.listener_inode != 0 {
                v4.listener_inode
            } else {
                v6.listener_inode
            },
            queue_size: v4.queue_size + v6.queue_size,
            active_workers: v4.active_workers + v6.active_workers,
        }
    }
}

/// The most recent readings published to the emitters.
///
/// Socket probers refresh `active`, `queued`, and `listener_inode`;
/// only the raindrops endpoint can observe `writing` and `calling`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readings {
    pub calling: u64,
    pub writing: u64,
    pub active: u64,
    pub queued: u64,
    pub listener_inode: u64,
}

impl Readings {
    pub fn apply_socket_stats(&mut self, stats: &SocketStats) {
        self.active = stats.active_workers;
        self.queued = stats.queue_size;
        self.listener_inode = stats.listener_inode;
    }

    /// Apply a raindrops sample. Labels missing from the response body
    /// leave the corresponding counter unchanged.
    pub fn apply_raindrops(&mut self, sample: &RaindropsSample) {
        if let Some(v) = sample.calling {
            self.calling = v;
        }
        if let Some(v) = sample.writing {
            self.writing = v;
        }
        if let Some(v) = sample.active {
            self.active = v;
        }
        if let Some(v) = sample.queued {
            self.queued = v;
        }
    }
}

/// Prober dispatches to the configured socket-stats source.
///
/// Uses enum dispatch rather than trait objects for zero-cost async
/// dispatch on the hot tick path.
pub enum Prober {
    Netlink(NetlinkProber),
    ProcNet(ProcNetProber),
    Raindrops(RaindropsProber),
}

impl Prober {
    /// Build the prober selected by the configuration.
    ///
    /// Failure to open the netlink socket in netlink mode is fatal.
    pub fn from_config(cfg: &Config) -> AnyhowResult<Self> {
        match cfg.socket_stats_mode {
            SocketStatsMode::Netlink => {
                let prober = NetlinkProber::new(cfg.server_port)
                    .context("opening NETLINK_SOCK_DIAG socket")?;
                Ok(Self::Netlink(prober))
            }
            SocketStatsMode::ProcNet => Ok(Self::ProcNet(ProcNetProber::new(
                &cfg.proc_directory,
                cfg.server_port,
            ))),
            SocketStatsMode::Raindrops => {
                let prober = RaindropsProber::new(&cfg.raindrops_url)
                    .context("creating raindrops HTTP client")?;
                Ok(Self::Raindrops(prober))
            }
        }
    }

    /// Returns the prober name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Netlink(_) => "netlink",
            Self::ProcNet(_) => "proc_net",
            Self::Raindrops(_) => "raindrops",
        }
    }

    /// Whether the probe source has produced at least one good result.
    /// Kernel-backed probers are always ready; the raindrops endpoint
    /// only after its first successful response.
    pub fn ready(&self) -> bool {
        match self {
            Self::Netlink(_) | Self::ProcNet(_) => true,
            Self::Raindrops(p) => p.ready(),
        }
    }

    /// Run one probe and fold the result into `readings`.
    pub async fn probe(&mut self, readings: &mut Readings) -> Result<()> {
        match self {
            Self::Netlink(p) => {
                let stats = p.read_stats()?;
                readings.apply_socket_stats(&stats);
            }
            Self::ProcNet(p) => {
                let stats = p.read_stats()?;
                readings.apply_socket_stats(&stats);
            }
            Self::Raindrops(p) => {
                let sample = p.fetch().await?;
                readings.apply_raindrops(&sample);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_sums_counters() {
        let v4 = SocketStats {
            listener_inode: 100,
            queue_size: 3,
            active_workers: 2,
        };
        let v6 = SocketStats {
            listener_inode: 200,
            queue_size: 1,
            active_workers: 4,
        };

        let combined = SocketStats::combine(v4, v6);
        assert_eq!(combined.queue_size, 4);
        assert_eq!(combined.active_workers, 6);
    }

    #[test]
    fn test_combine_prefers_ipv4_inode() {
        let v4 = SocketStats {
            listener_inode: 100,
            ..Default::default()
        };
        let v6 = SocketStats {
            listener_inode: 200,
            ..Default::default()
        };

        assert_eq!(SocketStats::combine(v4, v6).listener_inode, 100);
        assert_eq!(
            SocketStats::combine(SocketStats::default(), v6).listener_inode,
            200,
        );
    }

    #[test]
    fn test_apply_socket_stats_leaves_raindrops_counters() {
        let mut readings = Readings {
            calling: 7,
            writing: 8,
            ..Default::default()
        };

        readings.apply_socket_stats(&SocketStats {
            listener_inode: 42,
            queue_size: 5,
            active_workers: 3,
        });

        assert_eq!(readings.calling, 7);
        assert_eq!(readings.writing, 8);
        assert_eq!(readings.active, 3);
        assert_eq!(readings.queued, 5);
        assert_eq!(readings.listener_inode, 42);
    }

    #[test]
    fn test_apply_raindrops_partial_update() {
        let mut readings = Readings {
            calling: 1,
            writing: 2,
            active: 3,
            queued: 4,
            listener_inode: 42,
        };

        readings.apply_raindrops(&RaindropsSample {
            active: Some(9),
            ..Default::default()
        });

        assert_eq!(readings.active, 9);
        assert_eq!(readings.calling, 1);
        assert_eq!(readings.writing, 2);
        assert_eq!(readings.queued, 4);
        assert_eq!(readings.listener_inode, 42);
    }
}
