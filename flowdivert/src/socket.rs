//! Socket boundary.
//!
//! The engine drives the application-facing socket through [`DivertSocket`].
//! A flow holds only a weak reference, so a socket that has been released
//! simply stops receiving notifications.
//!
//! Every method is called with the flow's lock held (flow lock first, then
//! whatever the socket locks internally). Implementations must not call
//! back into the engine from these methods.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

pub trait DivertSocket: Send + Sync {
    fn local_addr(&self) -> Option<SocketAddr>;

    fn set_local_addr(&self, addr: SocketAddr);

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn set_remote_addr(&self, addr: SocketAddr);

    /// Append provider data to the receive buffer.
    ///
    /// Stream sockets may take a prefix; datagram sockets take the whole
    /// datagram or nothing. Returns the number of bytes taken.
    fn deliver(&self, data: Bytes, from: Option<SocketAddr>) -> usize;

    /// The provider accepted the connection.
    fn on_connected(&self);

    /// The flow is finished. `None` is an orderly close.
    fn on_disconnected(&self, error: Option<io::Error>);

    /// No more application data can be sent.
    fn cant_send_more(&self);

    /// No more provider data will arrive.
    fn cant_recv_more(&self);

    /// Diversion is off for this socket: connect the ordinary way and send
    /// `pending`, the writes the engine had accepted but never released.
    fn connect_direct(
        &self,
        remote: SocketAddr,
        pending: Vec<(Bytes, Option<SocketAddr>)>,
    ) -> io::Result<()>;

    /// Send-buffer space was freed.
    fn wake_writer(&self) {}
}
