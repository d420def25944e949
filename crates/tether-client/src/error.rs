//! Client error types.

use thiserror::Error;

use tether_proto::ErrorCode;

use crate::transport::TransportError;

/// Errors surfaced by the client session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wire-format violation in a received frame or payload.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),

    /// Handshake or session crypto failure.
    #[error(transparent)]
    Crypto(#[from] tether_crypto::CryptoError),

    /// The transport rejected an outbound container.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The connection went away while an operation was outstanding.
    #[error("connection lost")]
    TransportLost,

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A call is already in flight; the protocol carries one at a time.
    #[error("a call is already in flight")]
    Busy,

    /// The peripheral reported a request failure.
    #[error("peer reported {code:?}")]
    Remote {
        /// Decoded error code
        code: ErrorCode,
    },

    /// The peripheral reported a failure with a reserved code.
    #[error("peer reported unknown error {raw:#04x}")]
    RemoteUnknown {
        /// Raw error byte
        raw: u8,
    },

    /// A response arrived for a different method than was called.
    #[error("response names method '{got}', expected '{expected}'")]
    NameMismatch {
        /// Method the call was issued for
        expected: String,
        /// Method named in the response
        got: String,
    },

    /// The request exceeds the peripheral's advertised request cap.
    #[error("request of {len} bytes exceeds the peer's limit of {max}")]
    RequestTooLarge {
        /// Serialized request size
        len: usize,
        /// `max_request_payload_size` from capabilities
        max: u16,
    },

    /// Key exchange needs a pinned server identity in the configuration.
    #[error("no pinned server identity configured")]
    IdentityRequired,

    /// The system RNG failed.
    #[error("system rng unavailable")]
    RngUnavailable,
}

impl From<tether_proto::SplitError<TransportError>> for ClientError {
    fn from(err: tether_proto::SplitError<TransportError>) -> Self {
        match err {
            tether_proto::SplitError::Protocol(e) => Self::Protocol(e),
            tether_proto::SplitError::LengthMismatch { .. } => {
                unreachable!("one-shot splits declare exactly what they send")
            },
            tether_proto::SplitError::Send { source, .. } => Self::Transport(source),
        }
    }
}
