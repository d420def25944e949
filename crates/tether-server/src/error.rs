//! Server error types.

use thiserror::Error;

use crate::transport::NotifyError;

/// Errors surfaced by the peripheral service.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire-format violation.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),

    /// Handshake or session crypto failure.
    #[error(transparent)]
    Crypto(#[from] tether_crypto::CryptoError),

    /// The transport rejected an outbound container.
    #[error("notify failed: {0}")]
    Notify(#[from] NotifyError),

    /// An encrypted operation was attempted with no session established.
    #[error("no encrypted session established")]
    SessionInactive,

    /// A streamed response wrote a different byte count than it declared.
    #[error("response stream wrote {written} bytes but declared {declared}")]
    ResponseLengthMismatch {
        /// Total declared in the first container
        declared: u16,
        /// Bytes actually produced
        written: usize,
    },

    /// Invalid configuration (bad identity key, bind address, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tether_proto::SplitError<NotifyError>> for ServerError {
    fn from(err: tether_proto::SplitError<NotifyError>) -> Self {
        match err {
            tether_proto::SplitError::Protocol(e) => Self::Protocol(e),
            tether_proto::SplitError::LengthMismatch { declared, written } => {
                Self::ResponseLengthMismatch { declared, written }
            },
            tether_proto::SplitError::Send { source, .. } => Self::Notify(source),
        }
    }
}
