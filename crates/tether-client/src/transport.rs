//! Client-side transport abstraction and the UDP dev transport.
//!
//! The session needs one outbound primitive — send a single container
//! ([`ClientTransport::write`], the GATT write-without-response in the
//! reference deployment) — plus the negotiated MTU. Inbound notifications
//! are pumped by the driver into
//! [`ClientSession::handle_notification`](crate::ClientSession::handle_notification).

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

/// Errors from the outbound write primitive.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Unrecoverable transport failure.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound side of a tether client transport.
pub trait ClientTransport: Send + Sync {
    /// Send one serialized container to the peripheral.
    fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Negotiated MTU; container capacity is `mtu − 3 − header`.
    fn mtu(&self) -> u16;
}

/// Datagram-per-container transport over UDP, matching the server's dev
/// transport.
pub struct UdpTransport {
    socket: UdpSocket,
    mtu: u16,
}

impl UdpTransport {
    /// Bind an ephemeral port and direct all writes at `peer`.
    pub async fn connect(peer: &str, mtu: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(peer).await?;
        Ok(Self { socket, mtu })
    }

    /// Local address the socket bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one notification datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.socket.recv(buf).await?)
    }
}

impl ClientTransport for UdpTransport {
    fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.socket.try_send(frame)?;
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}
