use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_sock_diag::constants::{
    AF_INET, AF_INET6, IPPROTO_TCP, TCP_CLOSE_WAIT, TCP_CLOSING, TCP_ESTABLISHED, TCP_FIN_WAIT1,
    TCP_FIN_WAIT2, TCP_LAST_ACK, TCP_LISTEN,
};
use netlink_packet_sock_diag::inet::{ExtensionFlags, InetRequest, SocketId, StateFlags};
use netlink_packet_sock_diag::SockDiagMessage;
use netlink_sys::protocols::NETLINK_SOCK_DIAG;
use netlink_sys::{Socket, SocketAddr};

use super::SocketStats;
use crate::error::{Error, Result};

/// States in which a server process is committed to a connection.
///
/// SYN_RECV is excluded: the server is not tied up until the handshake
/// completes and it starts processing the request. TIME_WAIT is
/// excluded: the socket has been handed back to the kernel.
const ACTIVE_STATES_MASK: u32 = (1 << TCP_ESTABLISHED)
    | (1 << TCP_FIN_WAIT1)
    | (1 << TCP_FIN_WAIT2)
    | (1 << TCP_CLOSING)
    | (1 << TCP_CLOSE_WAIT)
    | (1 << TCP_LAST_ACK);

fn is_active_state(state: u8) -> bool {
    matches!(
        state,
        TCP_ESTABLISHED
            | TCP_FIN_WAIT1
            | TCP_FIN_WAIT2
            | TCP_CLOSING
            | TCP_CLOSE_WAIT
            | TCP_LAST_ACK
    )
}

fn request_states() -> StateFlags {
    StateFlags::from_bits_truncate(ACTIVE_STATES_MASK | (1 << TCP_LISTEN))
}

/// Socket-stats source backed by SOCK_DIAG_BY_FAMILY dumps over
/// NETLINK_SOCK_DIAG.
///
/// The netlink socket is opened once and reused for the agent's
/// lifetime; the kernel tracks dump sequencing per socket, and probes
/// are serialized by the tick loop.
pub struct NetlinkProber {
    socket: Socket,
    port: u16,
}

impl NetlinkProber {
    pub fn new(port: u16) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_SOCK_DIAG).map_err(Error::netlink)?;
        socket.bind_auto().map_err(Error::netlink)?;
        socket.connect(&SocketAddr::new(0, 0)).map_err(Error::netlink)?;

        Ok(Self { socket, port })
    }

    /// One dump per address family; counters sum across families and the
    /// IPv4 listener inode wins when both families have one.
    pub fn read_stats(&self) -> Result<SocketStats> {
        let v4 = self.read_family_stats(AF_INET)?;
        let v6 = self.read_family_stats(AF_INET6)?;
        Ok(SocketStats::combine(v4, v6))
    }

    fn read_family_stats(&self, family: u8) -> Result<SocketStats> {
        let mut socket_id = if family == AF_INET6 {
            SocketId::new_v6()
        } else {
            SocketId::new_v4()
        };
        // The sockid field is named "source port", meaning the local port
        // on this machine: filtering on it restricts the dump to sockets
        // our server owns on the listener port, not outgoing connections
        // that happen to target the same remote port number.
        socket_id.source_port = self.port;

        let request = InetRequest {
            family,
            protocol: IPPROTO_TCP,
            extensions: ExtensionFlags::empty(),
            states: request_states(),
            socket_id,
        };

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut packet =
            NetlinkMessage::new(header, SockDiagMessage::InetRequest(request).into());
        packet.finalize();

        let mut buf = vec![0u8; packet.header.length as usize];
        packet.serialize(&mut buf[..]);
        self.socket.send(&buf[..], 0).map_err(Error::netlink)?;

        let mut stats = SocketStats::default();
        let mut receive_buffer = vec![0u8; 8192];

        loop {
            let size = self
                .socket
                .recv(&mut &mut receive_buffer[..], 0)
                .map_err(Error::netlink)?;

            let mut offset = 0;
            while offset < size {
                let reply =
                    NetlinkMessage::<SockDiagMessage>::deserialize(&receive_buffer[offset..])
                        .map_err(|e| Error::NetlinkTransport(format!("decoding reply: {e}")))?;

                match reply.payload {
                    NetlinkPayload::Done(_) => return Ok(stats),
                    NetlinkPayload::Error(err) => {
                        return Err(Error::netlink(err.to_io()));
                    }
                    NetlinkPayload::InnerMessage(SockDiagMessage::InetResponse(response)) => {
                        // Inode 0 means the socket is mid-handoff to the
                        // kernel; the server no longer cares about it.
                        if response.header.inode != 0 {
                            if response.header.state == TCP_LISTEN {
                                stats.listener_inode = u64::from(response.header.inode);
                                stats.queue_size = u64::from(response.header.recv_queue);
                            } else if is_active_state(response.header.state) {
                                stats.active_workers += 1;
                            }
                        }
                    }
                    _ => {}
                }

                if reply.header.length == 0 {
                    break;
                }
                offset += reply.header.length as usize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use netlink_packet_sock_diag::constants::{TCP_SYN_RECV, TCP_TIME_WAIT};

    use super::*;

    #[test]
    fn test_active_states() {
        assert!(is_active_state(TCP_ESTABLISHED));
        assert!(is_active_state(TCP_FIN_WAIT1));
        assert!(is_active_state(TCP_FIN_WAIT2));
        assert!(is_active_state(TCP_CLOSING));
        assert!(is_active_state(TCP_CLOSE_WAIT));
        assert!(is_active_state(TCP_LAST_ACK));
    }

    #[test]
    fn test_inactive_states() {
        assert!(!is_active_state(TCP_SYN_RECV));
        assert!(!is_active_state(TCP_TIME_WAIT));
        assert!(!is_active_state(TCP_LISTEN));
    }

    #[test]
    fn test_request_states_include_listen() {
        let states = request_states();
        assert!(states.contains(StateFlags::LISTEN));
        assert!(states.contains(StateFlags::ESTABLISHED));
        assert!(!states.contains(StateFlags::TIME_WAIT));
        assert!(!states.contains(StateFlags::SYN_RECV));
    }
}
