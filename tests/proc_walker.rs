#![cfg(target_os = "linux")]

use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use drainspout::procscan::memory::collect_memory_stats;
use drainspout::procscan::find_processes_listening_to_socket;

fn listener_inode(listener: &TcpListener) -> u64 {
    use std::os::fd::AsRawFd;

    let link = std::fs::read_link(format!("/proc/self/fd/{}", listener.as_raw_fd()))
        .expect("readlink listener fd");
    let link = link.to_string_lossy();

    link.strip_prefix("socket:[")
        .and_then(|s| s.strip_suffix(']'))
        .expect("socket link format")
        .parse()
        .expect("socket inode number")
}

#[test]
fn walker_finds_exactly_our_process() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let inode = listener_inode(&listener);

    let collection =
        find_processes_listening_to_socket(Path::new("/proc"), inode).expect("walk /proc");

    let pids: Vec<i32> = collection.processes.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![std::process::id() as i32]);

    let me = &collection.processes[0];
    assert!(me.is_master);
    assert_eq!(me.index, 0);
    assert_eq!(me.uid, nix::unistd::getuid().as_raw());
    assert_eq!(me.gid, nix::unistd::getgid().as_raw());
}

#[test]
fn walker_classifies_inheriting_child_as_worker() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let inode = listener_inode(&listener);

    // Sockets are opened close-on-exec; hand the child a dup with the
    // flag cleared so it inherits the listener like a forked worker.
    let inherited = listener.try_clone().expect("dup listener");
    fcntl(&inherited, FcntlArg::F_SETFD(FdFlag::empty())).expect("clear FD_CLOEXEC");

    let mut child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn child holding the listener");
    let child_pid = child.id() as i32;
    let own_pid = std::process::id() as i32;

    let mut classified = false;
    for _ in 0..10 {
        let collection =
            find_processes_listening_to_socket(Path::new("/proc"), inode).expect("walk /proc");

        let masters: Vec<i32> = collection
            .processes
            .iter()
            .filter(|p| p.is_master)
            .map(|p| p.pid)
            .collect();
        let workers: Vec<i32> = collection
            .processes
            .iter()
            .filter(|p| !p.is_master)
            .map(|p| p.pid)
            .collect();

        if masters == vec![own_pid] && workers == vec![child_pid] {
            classified = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    child.kill().expect("kill child");
    child.wait().expect("reap child");

    assert!(classified, "never saw one master and one worker");
}

#[test]
fn walker_finds_nothing_for_unused_inode() {
    // Inode 0 never names a live socket.
    let collection =
        find_processes_listening_to_socket(Path::new("/proc"), 0).expect("walk /proc");
    assert!(collection.processes.is_empty());
    assert_eq!(collection.worker_count(), 0);
}

#[test]
fn memory_collector_reads_own_footprint() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let inode = listener_inode(&listener);

    let mut collection =
        find_processes_listening_to_socket(Path::new("/proc"), inode).expect("walk /proc");
    assert_eq!(collection.processes.len(), 1);

    let uss_available = collect_memory_stats(&mut collection, Path::new("/proc"), false);
    assert!(!uss_available, "USS must be unavailable without privilege");

    let me = &collection.processes[0];
    assert!(me.rss > 0, "rss should be nonzero for a live process");
    assert!(me.pss > 0, "pss should be nonzero for a live process");
    assert!(me.anon > 0, "anon should be nonzero for a live process");
    // USS is only computed with pagemap privilege.
    assert_eq!(me.uss, 0);
}
