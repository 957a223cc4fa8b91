use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::LazyLock;

use nix::sys::stat::fstat;
use regex::bytes::Regex;

use super::{open_pid_dir, read_at, ServerProcessCollection};
use crate::error::{Error, Result};

/// Unicorn embeds a stable worker number in its cmdline; pids would
/// work as an identifier but have far too high a cardinality for
/// per-worker metrics.
static WORKER_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"unicorn[\x00\x20]+worker\[([0-9]+)\]").expect("valid regex"));

/// Resolve `is_master`, `index`, and uid/gid for every process in the
/// collection.
///
/// A process is a worker iff following its parent chain reaches another
/// process in the collection before reaching pid 0. Identity along the
/// chain is by proc-directory inode, not pid: two handles name the same
/// process iff their fstat inodes match. If the tree goes disjoint
/// mid-scan (the master exits and a worker is reparented before we read
/// its PPID), the worker classifies as master; accepted.
pub(super) fn resolve(collection: &mut ServerProcessCollection, proc_dir: &Path) {
    let mut proc_inode_to_pid = HashMap::with_capacity(collection.processes.len());
    for proc in &collection.processes {
        if let Ok(st) = fstat(proc.proc_dir()) {
            proc_inode_to_pid.insert(st.st_ino, proc.pid);
        }
    }

    for proc in &mut collection.processes {
        let Ok(cmdline) = read_at(proc.proc_dir(), "cmdline") else {
            continue;
        };
        proc.index = worker_index(&cmdline);

        let Ok(mut ancestor) = parse_parent_pid(proc.proc_dir()) else {
            continue;
        };

        // Parent pid of pid 1 is 0: that terminates the walk. Any
        // failure along the chain also terminates it, leaving the
        // process classified as master.
        let mut is_descendant = false;
        while ancestor != 0 && !is_descendant {
            let Ok(ancestor_fd) = open_pid_dir(proc_dir, ancestor) else {
                break;
            };
            let Ok(st) = fstat(&ancestor_fd) else {
                break;
            };
            if proc_inode_to_pid.contains_key(&st.st_ino) {
                is_descendant = true;
                break;
            }
            match parse_parent_pid(ancestor_fd.as_fd()) {
                Ok(next) => ancestor = next,
                Err(_) => break,
            }
        }
        proc.is_master = !is_descendant;

        let Ok(st) = fstat(proc.proc_dir()) else {
            continue;
        };
        proc.uid = st.st_uid;
        proc.gid = st.st_gid;
    }
}

fn worker_index(cmdline: &[u8]) -> i32 {
    if !cmdline.starts_with(b"unicorn") {
        return 0;
    }

    WORKER_INDEX
        .captures(cmdline)
        .and_then(|caps| caps.get(1))
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
        .and_then(|digits| digits.parse::<i32>().ok())
        .unwrap_or(-1)
}

fn parse_parent_pid(proc_fd: std::os::fd::BorrowedFd<'_>) -> Result<i32> {
    let data = read_at(proc_fd, "stat")?;
    parse_ppid_from_stat(&data)
}

/// Extract the PPID (field 4) from a /proc/<pid>/stat line.
///
/// Field 2 is the program name in parentheses and may itself contain
/// spaces and parentheses, so the fields after it can only be located
/// by finding the last `)` in the file and splitting the suffix that
/// starts two bytes past it.
fn parse_ppid_from_stat(data: &[u8]) -> Result<i32> {
    let parse_err = |reason: &str| Error::proc_parse("stat", reason);

    let end_of_name = data
        .iter()
        .rposition(|&b| b == b')')
        .ok_or_else(|| parse_err("no closing paren"))?;

    let suffix = data
        .get(end_of_name + 2..)
        .ok_or_else(|| parse_err("truncated after program name"))?;
    let suffix = std::str::from_utf8(suffix).map_err(|_| parse_err("non-utf8 fields"))?;

    let ppid = suffix
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| parse_err("too few fields"))?;

    ppid.parse::<i32>()
        .map_err(|_| parse_err("parent pid is not a number"))
}
