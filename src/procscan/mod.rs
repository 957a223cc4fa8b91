pub mod memory;
mod relations;

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use nix::dir::Dir;
use nix::fcntl::{open, openat, readlinkat, OFlag};
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

const DIR_FLAGS: OFlag = OFlag::O_RDONLY
    .union(OFlag::O_DIRECTORY)
    .union(OFlag::O_CLOEXEC);

/// One process holding the observed listener socket.
///
/// All reads under `/proc/<pid>` go through the directory handle
/// captured at discovery time: pids recycle, and a path resolved by
/// string could land on a different process.
#[derive(Debug)]
pub struct ServerProcess {
    pub pid: i32,
    proc_dir: OwnedFd,
    pub uid: u32,
    pub gid: u32,

    /// True iff no other process in the collection is an ancestor.
    pub is_master: bool,
    /// Stable 1..N worker number parsed from the unicorn cmdline; -1 for
    /// an unmatched unicorn process (the master, or a child that has not
    /// renamed itself yet), 0 for non-unicorn servers.
    pub index: i32,

    pub rss: u64,
    pub pss: u64,
    pub uss: u64,
    pub anon: u64,
}

impl ServerProcess {
    fn new(pid: i32, proc_dir: OwnedFd) -> Self {
        Self {
            pid,
            proc_dir,
            uid: 0,
            gid: 0,
            is_master: false,
            index: 0,
            rss: 0,
            pss: 0,
            uss: 0,
            anon: 0,
        }
    }

    pub(crate) fn proc_dir(&self) -> BorrowedFd<'_> {
        self.proc_dir.as_fd()
    }
}

/// The set of processes holding a listener inode, built fresh on every
/// scan. Owns every retained `/proc/<pid>` handle; dropping the
/// collection releases them all.
#[derive(Debug, Default)]
pub struct ServerProcessCollection {
    pub processes: Vec<ServerProcess>,
}

impl ServerProcessCollection {
    /// Number of non-master processes.
    pub fn worker_count(&self) -> usize {
        self.processes.iter().filter(|p| !p.is_master).count()
    }
}

/// Find every process in our network namespace that holds a file
/// descriptor pointing at `socket_inode`, and resolve master/worker
/// relations over the result.
///
/// Per-process failures (the process exited mid-scan, a readlink
/// raced, a malformed stat line) drop that process from the result;
/// only failures to enumerate `proc_dir` itself or to read our own
/// namespace identity are reported.
pub fn find_processes_listening_to_socket(
    proc_dir: &Path,
    socket_inode: u64,
) -> Result<ServerProcessCollection> {
    let self_ns_path = proc_dir.join("self/ns/net");
    let self_net_ns = fs::read_link(&self_ns_path).map_err(|e| Error::proc_io(&self_ns_path, e))?;

    let entries = fs::read_dir(proc_dir).map_err(|e| Error::proc_io(proc_dir, e))?;

    let target = format!("socket:[{socket_inode}]");
    let target = OsStr::new(&target);

    let mut collection = ServerProcessCollection::default();

    for entry in entries {
        let Ok(entry) = entry else { continue };

        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid <= 0 {
            continue;
        }

        // The handle pins this process's /proc entry: every later read
        // is relative to it, immune to pid recycling.
        let Ok(proc_fd) = open(&proc_dir.join(&name), DIR_FLAGS, Mode::empty()) else {
            continue;
        };

        match readlinkat(&proc_fd, "ns/net") {
            Ok(ns) if ns.as_os_str() == self_net_ns.as_os_str() => {}
            // Different namespace, or the process exited. Either way,
            // not ours to observe.
            _ => continue,
        }

        if holds_socket(&proc_fd, target) {
            collection
                .processes
                .push(ServerProcess::new(pid, proc_fd));
        }
    }

    relations::resolve(&mut collection, proc_dir);

    Ok(collection)
}

/// Whether the process behind `proc_fd` has an fd whose link target is
/// `target`.
///
/// The fd directory is enumerated through its own open handle rather
/// than a path listing; both the open and every readlink resolve
/// relative to the pinned process entry.
fn holds_socket(proc_fd: &OwnedFd, target: &OsStr) -> bool {
    let Ok(fd_dir) = openat(proc_fd, "fd", DIR_FLAGS, Mode::empty()) else {
        return false;
    };
    let Ok(mut dir) = Dir::openat(proc_fd, "fd", DIR_FLAGS, Mode::empty()) else {
        return false;
    };

    for entry in dir.iter() {
        let Ok(entry) = entry else { break };

        let name = entry.file_name();
        if name.to_bytes() == b"." || name.to_bytes() == b".." {
            continue;
        }

        if let Ok(link) = readlinkat(&fd_dir, name) {
            if link.as_os_str() == target {
                return true;
            }
        }
    }

    false
}

/// Read a file relative to an open directory handle.
pub(crate) fn read_at(dir_fd: BorrowedFd<'_>, name: &str) -> Result<Vec<u8>> {
    let fd = openat(
        dir_fd,
        name,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| Error::proc_io(name, e.into()))?;

    let mut file = File::from(fd);
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| Error::proc_io(name, e))?;

    Ok(buf)
}

pub(crate) fn open_pid_dir(proc_dir: &Path, pid: i32) -> nix::Result<OwnedFd> {
    open(&proc_dir.join(pid.to_string()), DIR_FLAGS, Mode::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walker_fails_without_namespace_identity() {
        // A proc root without self/ns/net cannot tell us which network
        // namespace we are in, and that is the one non-recoverable
        // enumeration error.
        let dir = tempfile::tempdir().expect("tempdir");
        let result = find_processes_listening_to_socket(dir.path(), 1);
        assert!(matches!(result, Err(Error::ProcIo { .. })));
    }

    #[test]
    fn test_empty_collection_has_no_workers() {
        let collection = ServerProcessCollection::default();
        assert_eq!(collection.worker_count(), 0);
    }
}
