use std::net::SocketAddr;
use std::ops::Deref;

use crate::error::Error;
use crate::net::Socket;
use crate::sys::net;

/// A non-blocking UDP socket.
///
/// Datagram-oriented: a zero-byte read is an empty datagram, not
/// end-of-stream.
#[derive(Debug)]
pub struct UdpSocket {
    socket: Socket,
}

impl UdpSocket {
    /// Bind a datagram socket to `addr`.
    pub fn bind(addr: SocketAddr) -> Result<UdpSocket, Error> {
        let socket = Socket::new(net::domain_for(&addr), libc::SOCK_DGRAM)?;
        socket.bind(&addr)?;
        Ok(UdpSocket { socket })
    }

    /// Set the default peer for `send`/`recv`.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), Error> {
        self.socket.connect(&addr)
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Allow (or forbid) sending to broadcast addresses.
    pub fn set_broadcast(&self, broadcast: bool) -> Result<(), Error> {
        self.socket.set_option_int(
            libc::SOL_SOCKET,
            libc::SO_BROADCAST,
            broadcast as libc::c_int,
        )
    }

    /// Whether sending to broadcast addresses is allowed.
    pub fn broadcast(&self) -> Result<bool, Error> {
        self.socket
            .option_int(libc::SOL_SOCKET, libc::SO_BROADCAST)
            .map(|v| v != 0)
    }

    /// Set the time-to-live of outgoing packets.
    pub fn set_ttl(&self, ttl: u32) -> Result<(), Error> {
        self.socket
            .set_option_int(libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)
    }

    /// The time-to-live of outgoing packets.
    pub fn ttl(&self) -> Result<u32, Error> {
        self.socket
            .option_int(libc::IPPROTO_IP, libc::IP_TTL)
            .map(|v| v as u32)
    }
}

impl Deref for UdpSocket {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}
