//! Networking primitives the runtime's operations drive.
//!
//! [`Socket`] is the protocol-agnostic non-blocking wrapper every operation
//! borrows; [`TcpListener`], [`TcpStream`] and [`UdpSocket`] are thin typed
//! shells over it.

mod socket;
mod tcp;
mod udp;

pub use self::socket::Socket;
pub use self::tcp::{TcpListener, TcpStream};
pub use self::udp::UdpSocket;
