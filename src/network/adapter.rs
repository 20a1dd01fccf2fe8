use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{trace, warn};

const RECV_BUFFER_SIZE: usize = 4096;

/// The transport capability the core consumes, one instance per remote
/// device.
///
/// An adapter is a best-effort unreliable datagram channel: `send` may drop
/// the datagram, `poll` returns whatever arrived since the last call, and
/// neither may block. The protocol is designed to tolerate loss,
/// duplication and reordering, so implementations need no reliability layer.
pub trait DeviceAdapter {
    /// Sends one datagram to the remote device. Best effort; never blocks.
    fn send(&mut self, datagram: &[u8]);

    /// Returns the datagrams received from the remote device since the last
    /// call. Never blocks.
    fn poll(&mut self) -> Vec<Vec<u8>>;
}

/// A [`DeviceAdapter`] over a non-blocking UDP socket, pinned to a single
/// peer address.
///
/// Datagrams arriving from any other address are discarded: with one adapter
/// per remote device, the peer address is the sender identity, and stray
/// senders are not part of the session.
#[derive(Debug)]
pub struct UdpDeviceAdapter {
    socket: UdpSocket,
    peer: SocketAddr,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpDeviceAdapter {
    /// Binds a UDP socket to `0.0.0.0:port` in non-blocking mode, pinned to
    /// `peer`.
    ///
    /// # Errors
    /// Returns the underlying I/O error if binding or configuring the socket
    /// fails.
    pub fn bind(port: u16, peer: SocketAddr) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// Wraps an already configured socket. The socket must be non-blocking.
    #[must_use]
    pub fn from_socket(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            buffer: [0; RECV_BUFFER_SIZE],
        }
    }

    /// The peer address this adapter is pinned to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The local address the socket is bound to.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl DeviceAdapter for UdpDeviceAdapter {
    fn send(&mut self, datagram: &[u8]) {
        // UDP is best-effort; a failed send is equivalent to a lost packet
        if let Err(e) = self.socket.send_to(datagram, self.peer) {
            warn!(peer = %self.peer, "failed to send datagram: {}", e);
        }
    }

    fn poll(&mut self) -> Vec<Vec<u8>> {
        let mut received = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, src)) => {
                    if src != self.peer {
                        trace!(%src, "discarding datagram from unknown sender");
                        continue;
                    }
                    received.push(self.buffer[..len].to_vec());
                }
                // no more datagrams buffered
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets surface this after a send to a closed port
                Err(ref e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(peer = %self.peer, "socket error while polling: {}", e);
                    return received;
                }
            }
        }
    }
}

// #########
// # TESTS #
// #########
