//! Tether central.
//!
//! The client side of the tether RPC protocol: a [`ClientSession`] that
//! issues transaction ids, negotiates capabilities, runs the key exchange,
//! encrypts and fragments outbound requests, reassembles and decrypts
//! inbound responses, and delivers server-push streams to per-method
//! callbacks.
//!
//! The session is transport-agnostic behind [`ClientTransport`]; the
//! bundled [`UdpTransport`](transport::UdpTransport) pairs with the
//! server's UDP dev transport. Scanning, connecting, and MTU negotiation
//! belong to the transport layer and are out of scope here.

pub mod error;
pub mod session;
pub mod transport;

pub use error::ClientError;
pub use session::{ClientConfig, ClientSession, ResponseTicket};
pub use transport::{ClientTransport, TransportError};
