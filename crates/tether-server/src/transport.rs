//! Outbound transport abstraction and the UDP dev transport.
//!
//! The protocol core only needs two primitives from a transport: a
//! per-container outbound send ([`Notify::notify`], the GATT notification in
//! the reference deployment) and the negotiated MTU. Inbound delivery is the
//! driver's job — it reads datagrams however the transport provides them and
//! feeds each one to [`Service::on_frame`](crate::Service::on_frame).
//!
//! [`UdpTransport`] is the bundled development transport: one datagram per
//! container, byte layout identical to the GATT deployment. It adopts the
//! most recent sender as its peer, which stands in for the single BLE
//! connection.

use std::{net::SocketAddr, sync::Mutex};

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::error::ServerError;

/// Errors from the outbound notify primitive.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transient backpressure; the caller may retry shortly.
    #[error("transport out of resources")]
    OutOfResources,

    /// No peer is connected.
    #[error("not connected")]
    NotConnected,

    /// Unrecoverable transport failure.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound side of a tether transport.
pub trait Notify: Send + Sync {
    /// Send one serialized container to the connected peer.
    fn notify(&self, frame: &[u8]) -> Result<(), NotifyError>;

    /// Negotiated MTU; container capacity is `mtu − 3 − header`.
    fn mtu(&self) -> u16;
}

/// Datagram-per-container transport over UDP.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    mtu: u16,
}

impl UdpTransport {
    /// Bind to `addr` and fix the emulated MTU.
    pub async fn bind(addr: &str, mtu: u16) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Config(format!("cannot bind '{addr}': {e}")))?;
        Ok(Self { socket, peer: Mutex::new(None), mtu })
    }

    /// Local address the socket bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one container datagram.
    ///
    /// Returns the byte count and whether the sender differs from the
    /// current peer — the driver maps a peer change onto the
    /// connect/disconnect lifecycle.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, bool), ServerError> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        let mut peer = lock(&self.peer);
        let new_peer = *peer != Some(addr);
        if new_peer {
            tracing::info!(%addr, "peer connected");
            *peer = Some(addr);
        }
        Ok((len, new_peer))
    }
}

impl Notify for UdpTransport {
    fn notify(&self, frame: &[u8]) -> Result<(), NotifyError> {
        let peer = (*lock(&self.peer)).ok_or(NotifyError::NotConnected)?;
        match self.socket.try_send_to(frame, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(NotifyError::OutOfResources)
            },
            Err(e) => Err(NotifyError::Io(e)),
        }
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

fn lock(peer: &Mutex<Option<SocketAddr>>) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
    peer.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
