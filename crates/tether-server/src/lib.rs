//! Tether peripheral.
//!
//! The server side of the tether RPC protocol: a [`Service`] that consumes
//! inbound containers from a transport driver, answers control frames
//! inline, reassembles and (when encryption is on) decrypts requests, and
//! dispatches them on a dedicated worker with two-pass streamed responses.
//!
//! The transport is abstracted to the two primitives the protocol needs
//! ([`Notify`]); [`UdpTransport`] is a development stand-in that carries one
//! container per datagram with the reference byte layout. The bundled
//! [`handlers`] reproduce the reference peripheral's method set and show the
//! handler contract, including both stream directions.

pub mod config;
mod dispatch;
pub mod error;
pub mod handler;
pub mod handlers;
mod sender;
pub mod service;
pub mod transport;

pub use config::ServerConfig;
pub use error::ServerError;
pub use handler::{
    CommandHandler, HandlerError, HandlerOutcome, HandlerRegistry, RequestContext, ResponseSink,
    SinkError, SinkWriter,
};
pub use sender::ServiceHandle;
pub use service::Service;
pub use transport::{Notify, NotifyError, UdpTransport};
