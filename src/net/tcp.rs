use std::net::SocketAddr;
use std::ops::Deref;

use crate::error::Error;
use crate::net::Socket;
use crate::sys::net;

/// A non-blocking TCP acceptor.
///
/// Bind one, then build accept senders with
/// [`async_accept`](crate::async_accept).
#[derive(Debug)]
pub struct TcpListener {
    socket: Socket,
}

impl TcpListener {
    /// Bind a listening socket to `addr`.
    ///
    /// The socket is created non-blocking with `SO_REUSEADDR` set, the way
    /// short-lived test servers expect.
    pub fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
        let socket = Socket::new(net::domain_for(&addr), libc::SOCK_STREAM)?;
        socket.set_reuseaddr()?;
        socket.bind(&addr)?;
        socket.listen(1024)?;
        Ok(TcpListener { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
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

impl Deref for TcpListener {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// A non-blocking TCP stream.
///
/// Produced by an accept operation, or by [`connect`](TcpStream::connect)
/// on the initiating side.
#[derive(Debug)]
pub struct TcpStream {
    socket: Socket,
}

impl TcpStream {
    pub(crate) fn from_socket(socket: Socket) -> TcpStream {
        TcpStream { socket }
    }

    /// Connect to `addr`.
    ///
    /// The connect itself is allowed to block (there is nothing useful to
    /// overlap it with on the initiating side); the stream comes back in
    /// non-blocking mode, ready for the async verbs.
    pub fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
        let socket = Socket::new(net::domain_for(&addr), libc::SOCK_STREAM)?;
        socket.set_non_blocking(false)?;
        socket.connect(&addr)?;
        socket.set_non_blocking(true)?;
        Ok(TcpStream { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Disable (or re-enable) Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<(), Error> {
        self.socket.set_option_int(
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            nodelay as libc::c_int,
        )
    }

    /// Whether Nagle's algorithm is disabled.
    pub fn nodelay(&self) -> Result<bool, Error> {
        self.socket
            .option_int(libc::IPPROTO_TCP, libc::TCP_NODELAY)
            .map(|v| v != 0)
    }

    /// Enable or disable keep-alive probes.
    pub fn set_keepalive(&self, keepalive: bool) -> Result<(), Error> {
        self.socket.set_option_int(
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            keepalive as libc::c_int,
        )
    }

    /// Whether keep-alive probes are enabled.
    pub fn keepalive(&self) -> Result<bool, Error> {
        self.socket
            .option_int(libc::SOL_SOCKET, libc::SO_KEEPALIVE)
            .map(|v| v != 0)
    }

    /// Peer address of the connection.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.socket.native_handle(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        // SAFETY: the kernel filled `storage` with one of the inet families.
        unsafe { net::to_socket_addr(&storage).map_err(Error::from) }
    }
}

impl Deref for TcpStream {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}
