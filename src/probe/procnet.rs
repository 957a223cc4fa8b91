use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::SocketStats;
use crate::error::{Error, Result};

/// TCP connection state as encoded in column 4 of /proc/net/tcp.
///
/// Only the states this prober acts on are named; everything else is
/// folded into `Unknown`. ESTABLISHED is intentionally the only state
/// counted as active here, a narrower set than the netlink prober's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Listen,
    Established,
    TimeWait,
    Unknown,
}

/// One parsed row of /proc/net/tcp or /proc/net/tcp6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketLine {
    pub local_port: u16,
    pub state: ConnState,
    pub inode: u64,
    pub queue_size: u64,
}

/// Parse one data row of /proc/net/tcp.
///
/// Field layout per the kernel's proc_net_tcp documentation: field 1 is
/// `local_address:port` (hex), field 3 the state code, field 4
/// `tx_queue:rx_queue` (hex), field 9 the socket inode.
pub fn parse_socket_line(line: &str) -> Result<SocketLine> {
    let parse_err = |reason: String| Error::proc_parse("net/tcp", reason);

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(parse_err(format!("too few fields: {line}")));
    }

    let inode = fields[9]
        .parse::<u64>()
        .map_err(|_| parse_err(format!("bad inode: {}", fields[9])))?;

    let (_, port_hex) = fields[1]
        .rsplit_once(':')
        .ok_or_else(|| parse_err(format!("bad local address: {}", fields[1])))?;
    let local_port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| parse_err(format!("bad local port: {port_hex}")))?;

    let state = match fields[3] {
        "0A" => ConnState::Listen,
        "01" => ConnState::Established,
        "06" => ConnState::TimeWait,
        _ => ConnState::Unknown,
    };

    let (_, rx_hex) = fields[4]
        .split_once(':')
        .ok_or_else(|| parse_err(format!("bad queue sizes: {}", fields[4])))?;
    let queue_size = u64::from_str_radix(rx_hex, 16)
        .map_err(|_| parse_err(format!("bad receive queue: {rx_hex}")))?;

    Ok(SocketLine {
        local_port,
        state,
        inode,
        queue_size,
    })
}

/// Aggregate the rows of one /proc/net/tcp file for the given port.
///
/// TIME_WAIT sockets are skipped: they have been handed back to the
/// kernel and the server no longer cares. ESTABLISHED rows with inode 0
/// are finished connections mid-handoff and are skipped too.
pub fn parse_socket_stats(port: u16, content: &str) -> SocketStats {
    let mut stats = SocketStats::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let socket = match parse_socket_line(line) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "skipping unparseable socket line");
                continue;
            }
        };

        if socket.local_port != port || socket.state == ConnState::TimeWait {
            continue;
        }

        match socket.state {
            ConnState::Listen => {
                stats.queue_size += socket.queue_size;
                if stats.listener_inode == 0 {
                    stats.listener_inode = socket.inode;
                }
            }
            ConnState::Established if socket.inode != 0 => {
                stats.active_workers += 1;
            }
            _ => {}
        }
    }

    stats
}

/// Socket-stats source backed by /proc/net/tcp and /proc/net/tcp6.
pub struct ProcNetProber {
    proc_dir: PathBuf,
    port: u16,
}

impl ProcNetProber {
    pub fn new(proc_dir: &Path, port: u16) -> Self {
        Self {
            proc_dir: proc_dir.to_path_buf(),
            port,
        }
    }

    pub fn read_stats(&self) -> Result<SocketStats> {
        let v4 = self.read_family_stats("net/tcp")?;
        let v6 = self.read_family_stats("net/tcp6")?;
        Ok(SocketStats::combine(v4, v6))
    }

    fn read_family_stats(&self, name: &str) -> Result<SocketStats> {
        let path = self.proc_dir.join(name);
        let content = fs::read_to_string(&path).map_err(|e| Error::proc_io(&path, e))?;

        // The first line is the column header.
        let body = match content.split_once('\n') {
            Some((_, rest)) => rest,
            None => "",
        };

        Ok(parse_socket_stats(self.port, body))
    }
}
