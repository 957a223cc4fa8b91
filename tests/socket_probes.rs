#![cfg(target_os = "linux")]

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use drainspout::probe::netlink::NetlinkProber;
use drainspout::probe::procnet::ProcNetProber;
use drainspout::probe::SocketStats;

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

/// Kernel state transitions are not synchronous with our syscalls;
/// retry a few times before concluding a probe result is wrong.
fn eventually(mut probe: impl FnMut() -> SocketStats, expected: SocketStats) -> bool {
    for _ in 0..5 {
        if probe() == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn probe_lifecycle(bind_addr: &str, probe_fn: impl Fn(&TcpListener) -> Box<dyn Fn() -> SocketStats>) {
    let listener = TcpListener::bind(bind_addr).expect("bind listener");
    let inode = listener_inode(&listener);
    let probe = probe_fn(&listener);

    // Nothing connected yet: just the listener.
    let stats = probe();
    assert_eq!(stats.listener_inode, inode);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.active_workers, 0);

    // Dial without accepting: one connection sits in the accept queue.
    let client = TcpStream::connect(listener.local_addr().expect("local addr")).expect("connect");
    assert!(
        eventually(
            &probe,
            SocketStats {
                listener_inode: inode,
                queue_size: 1,
                active_workers: 0,
            },
        ),
        "connection never showed up in the accept queue",
    );

    // Accept it: the queue drains and one socket is being served.
    let (accepted, _) = listener.accept().expect("accept");
    let stats = probe();
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.active_workers, 1);

    // Close both ends: back to idle.
    drop(accepted);
    drop(client);
    assert!(
        eventually(
            &probe,
            SocketStats {
                listener_inode: inode,
                queue_size: 0,
                active_workers: 0,
            },
        ),
        "counts never returned to zero",
    );
}

#[test]
fn netlink_probe_lifecycle_ipv4() {
    probe_lifecycle("127.0.0.1:0", |listener| {
        let port = listener.local_addr().expect("local addr").port();
        let prober = NetlinkProber::new(port).expect("netlink socket");
        Box::new(move || prober.read_stats().expect("netlink probe"))
    });
}

#[test]
fn netlink_probe_lifecycle_ipv6() {
    probe_lifecycle("[::1]:0", |listener| {
        let port = listener.local_addr().expect("local addr").port();
        let prober = NetlinkProber::new(port).expect("netlink socket");
        Box::new(move || prober.read_stats().expect("netlink probe"))
    });
}

#[test]
fn procnet_probe_lifecycle_ipv4() {
    probe_lifecycle("127.0.0.1:0", |listener| {
        let port = listener.local_addr().expect("local addr").port();
        let prober = ProcNetProber::new(Path::new("/proc"), port);
        Box::new(move || prober.read_stats().expect("procnet probe"))
    });
}

#[test]
fn procnet_probe_lifecycle_ipv6() {
    probe_lifecycle("[::1]:0", |listener| {
        let port = listener.local_addr().expect("local addr").port();
        let prober = ProcNetProber::new(Path::new("/proc"), port);
        Box::new(move || prober.read_stats().expect("procnet probe"))
    });
}
